//! The capability contract between the reclaim coordinator and the caches it
//! drains.
//!
//! A cache participates by implementing [`Shrinker`] and registering the
//! trait object with a [`crate::ShrinkerRegistry`]. The coordinator never
//! looks inside a cache: it only asks how many evictable units are held and
//! requests that some number of them be freed. Which entries go, and how, is
//! entirely the implementor's policy.

/// The quantum shrinkers count and free in, in bytes.
///
/// Shrink targets are computed in bytes from system accounting and converted
/// to whole units of this size before reaching a shrinker.
pub const PAGE_SIZE: u64 = 4096;

/// Allocation-context flags forwarded verbatim to each shrinker.
///
/// The coordinator attaches no meaning to the bits; the caller that failed an
/// allocation and the shrinker agree on the encoding (typically whether the
/// shrinker may itself block or allocate while evicting). The periodic
/// reclaim path always forwards the empty set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AllocFlags(u32);

impl AllocFlags {
    pub const fn new(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }
}

/// One eviction request handed to [`Shrinker::scan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShrinkRequest {
    /// How many units the shrinker should try to free.
    pub nr_to_scan: u64,
    /// Allocation context of whoever triggered the request.
    pub flags: AllocFlags,
}

/// A cache-like subsystem that can give memory back on demand.
///
/// Implementor state lives behind `self`; the registry passes nothing else
/// through. Both callbacks may run concurrently, from the background reclaim
/// thread and from any thread relieving an allocation failure, so
/// implementations must be internally synchronized.
///
/// Callbacks execute while the registry lock is held: they must finish in
/// bounded time and must not call back into the registry.
pub trait Shrinker: Send + Sync {
    /// Name used in logs and diagnostics.
    fn name(&self) -> &str;

    /// Current number of evictable units held.
    fn count(&self) -> u64;

    /// Frees up to `request.nr_to_scan` units and returns the number actually
    /// freed, which must not exceed the request. Zero means no further
    /// progress is possible right now; the drain loop treats it as a stop
    /// signal, not a fault.
    fn scan(&self, request: ShrinkRequest) -> u64;
}
