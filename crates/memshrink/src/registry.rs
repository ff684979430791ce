//! Shrinker registration and the two eviction paths.
//!
//! One mutex guards the ordered shrinker list, and every walk over it holds
//! that mutex for its entire duration, whether draining toward a pressure
//! target or relieving a failed allocation. Iteration is never
//! snapshot-and-release: unregistration is therefore synchronous with
//! in-flight eviction (once a handle's drop returns, no further callbacks
//! into that shrinker are possible), at the price that a shrinker callback
//! which blocks indefinitely freezes the registry system-wide. Callbacks are
//! required to be bounded and non-reentrant.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use crossbeam_channel as channel;
use parking_lot::Mutex;

use crate::meminfo::MemorySampler;
use crate::policy::ReclaimPolicy;
use crate::reclaim;
use crate::shrinker::{AllocFlags, ShrinkRequest, Shrinker, PAGE_SIZE};

pub(crate) struct Entry {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) shrinker: Arc<dyn Shrinker>,
}

pub(crate) struct Inner {
    pub(crate) policy: ReclaimPolicy,
    pub(crate) sampler: MemorySampler,
    next_id: AtomicU64,
    pub(crate) entries: Mutex<Vec<Entry>>,
    reclaim_thread: Mutex<Option<JoinHandle<()>>>,
    stop_tx: channel::Sender<()>,
    stop_rx: Mutex<Option<channel::Receiver<()>>>,
}

/// Central coordinator: owns the shrinker list and drives both eviction
/// paths against it.
///
/// Cloning hands out another reference to the same registry. When the last
/// clone drops, the background reclaim thread (if started) is stopped and
/// joined; embedders that want the daemon behavior of running until process
/// exit simply keep a registry alive for the life of the process.
#[derive(Clone)]
pub struct ShrinkerRegistry {
    pub(crate) inner: Arc<Inner>,
}

impl ShrinkerRegistry {
    /// Registry sampling `/proc` with default policy.
    pub fn new() -> Self {
        Self::with_policy(ReclaimPolicy::default())
    }

    pub fn with_policy(policy: ReclaimPolicy) -> Self {
        Self::with_sampler(MemorySampler::new(), policy)
    }

    /// Registry sampling an alternate accounting tree; combined with a short
    /// `interval` this lets tests drive the reclaim loop against fabricated
    /// pressure.
    pub fn with_sampler(sampler: MemorySampler, policy: ReclaimPolicy) -> Self {
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        Self {
            inner: Arc::new(Inner {
                policy,
                sampler,
                next_id: AtomicU64::new(1),
                entries: Mutex::new(Vec::new()),
                reclaim_thread: Mutex::new(None),
                stop_tx,
                stop_rx: Mutex::new(Some(stop_rx)),
            }),
        }
    }

    /// Appends `shrinker` at the tail of the iteration order.
    ///
    /// The first registration on a registry also starts the background
    /// reclaim thread, before returning; later registrations never spawn
    /// another. Dropping the returned handle unregisters the shrinker, and
    /// the entries that remain keep their relative order.
    pub fn register(&self, shrinker: Arc<dyn Shrinker>) -> ShrinkerRegistration {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let name = shrinker.name().to_string();

        self.inner.entries.lock().push(Entry {
            id,
            name: name.clone(),
            shrinker,
        });
        tracing::debug!(target = "memshrink.registry", name = %name, "registered shrinker");

        ensure_reclaim_thread(&self.inner);

        ShrinkerRegistration {
            id,
            name,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Names of registered shrinkers in iteration order.
    pub fn shrinker_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.inner.for_each(|name, _shrinker| names.push(name.to_string()));
        names
    }

    /// Synchronous relief for a caller whose allocation just failed: every
    /// shrinker, in registration order, is asked to free an eighth of what
    /// it currently holds, with the caller's allocation context forwarded
    /// unchanged.
    ///
    /// One best-effort pass with no looping and no pressure target. Runs on
    /// the calling thread and may overlap a background cycle.
    pub fn relieve_allocation_failure(&self, flags: AllocFlags) {
        let mut shrinkers = 0u64;
        let mut freed_units = 0u64;
        self.inner.for_each(|_name, shrinker| {
            let have = shrinker.count();
            let freed = shrinker.scan(ShrinkRequest {
                nr_to_scan: have / 8,
                flags,
            });
            shrinkers += 1;
            freed_units = freed_units.saturating_add(freed);
        });
        tracing::debug!(
            target = "memshrink.registry",
            shrinkers,
            freed_units,
            "allocation failure relief pass"
        );
    }
}

impl Default for ShrinkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    pub(crate) fn has_shrinkers(&self) -> bool {
        !self.entries.lock().is_empty()
    }

    /// Runs `visitor` over every registered shrinker in registration order,
    /// holding the registry lock throughout.
    pub(crate) fn for_each(&self, mut visitor: impl FnMut(&str, &dyn Shrinker)) {
        let entries = self.entries.lock();
        for entry in entries.iter() {
            visitor(&entry.name, entry.shrinker.as_ref());
        }
    }

    /// One drain: sweeps the shrinker list in order, repeatedly, asking each
    /// shrinker for the outstanding remainder of `target_bytes`, until the
    /// target is met, the per-cycle cap is hit, or any shrinker reports zero
    /// progress. Returns the bytes freed.
    ///
    /// Holds the registry lock for the whole drain.
    pub(crate) fn drain_pass(&self, target_bytes: u64, flags: AllocFlags) -> u64 {
        let entries = self.entries.lock();
        if entries.is_empty() {
            return 0;
        }

        let cap = self.policy.cycle_cap_bytes;
        let mut freed_bytes: u64 = 0;
        'drain: loop {
            for entry in entries.iter() {
                let remaining = target_bytes.saturating_sub(freed_bytes);
                if remaining == 0 || freed_bytes >= cap {
                    break 'drain;
                }
                // Round up so a sub-page remainder still asks for one unit.
                let freed = entry.shrinker.scan(ShrinkRequest {
                    nr_to_scan: remaining.div_ceil(PAGE_SIZE),
                    flags,
                });
                if freed == 0 {
                    // Whatever this shrinker still holds is presumably pinned
                    // or dirty, so spinning on the list now is wasted work;
                    // the next cycle retries from the top.
                    break 'drain;
                }
                freed_bytes = freed_bytes.saturating_add(freed.saturating_mul(PAGE_SIZE));
            }
        }
        freed_bytes
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let Some(handle) = self.reclaim_thread.lock().take() else {
            return;
        };
        if handle.thread().id() == std::thread::current().id() {
            // The loop itself dropped the last reference; it is about to
            // exit on its failed upgrade and cannot be joined from here.
            return;
        }
        // Wake the loop out of its sleep. If it already exited, the channel
        // is disconnected and the send just fails.
        let _ = self.stop_tx.send(());
        join_reclaim_thread_best_effort(handle);
    }
}

fn ensure_reclaim_thread(inner: &Arc<Inner>) {
    let mut thread = inner.reclaim_thread.lock();
    if thread.is_some() {
        return;
    }
    let Some(stop_rx) = inner.stop_rx.lock().take() else {
        return;
    };
    let weak = Arc::downgrade(inner);
    match std::thread::Builder::new()
        .name("memshrink-reclaim".to_string())
        .spawn(move || reclaim::run_loop(weak, stop_rx))
    {
        Ok(handle) => *thread = Some(handle),
        Err(err) => {
            tracing::error!(
                target = "memshrink.reclaim",
                error = %err,
                "failed to spawn reclaim thread; terminating"
            );
            std::process::exit(1);
        }
    }
}

fn join_reclaim_thread_best_effort(handle: JoinHandle<()>) {
    if let Err(panic) = handle.join() {
        let message = panic
            .downcast_ref::<&'static str>()
            .copied()
            .or_else(|| panic.downcast_ref::<String>().map(|s| s.as_str()))
            .unwrap_or("<non-string panic>");
        tracing::debug!(
            target = "memshrink.registry",
            panic = %message,
            "reclaim thread panicked (best effort join)"
        );
    }
}

/// Handle kept by the registering cache; dropping it unregisters the
/// shrinker.
///
/// Removal happens under the registry lock, so once `drop` returns no
/// further callbacks into the shrinker are possible.
pub struct ShrinkerRegistration {
    id: u64,
    name: String,
    registry: Weak<Inner>,
}

impl ShrinkerRegistration {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for ShrinkerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShrinkerRegistration")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl Drop for ShrinkerRegistration {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.entries.lock().retain(|entry| entry.id != self.id);
            tracing::debug!(
                target = "memshrink.registry",
                name = %self.name,
                "unregistered shrinker"
            );
        }
    }
}
