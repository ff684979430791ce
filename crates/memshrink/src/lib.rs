//! Cooperative memory eviction for cache-heavy processes.
//!
//! Long-lived services accumulate caches that are individually reasonable
//! and collectively fatal. This crate gives those caches a common pressure
//! valve: each one registers a [`Shrinker`] with a [`ShrinkerRegistry`], and
//! the registry decides when and how hard to squeeze them.
//!
//! Eviction runs along two paths:
//!
//! * A background thread, started on the first registration, samples system
//!   and process memory accounting once per second. When usage crosses the
//!   pressure threshold it drains registered shrinkers, in registration
//!   order, toward a computed byte target (bounded per cycle). When free
//!   memory falls below a survival floor, or the accounting files turn out
//!   to be unparseable, it terminates the process rather than guess.
//! * [`ShrinkerRegistry::relieve_allocation_failure`] offers a synchronous
//!   fallback for a caller whose allocation just failed: one immediate pass
//!   asking every shrinker for an eighth of what it holds.
//!
//! Shrinkers report in abstract units of [`PAGE_SIZE`] bytes, and eviction
//! is best effort throughout: a shrinker is always free to decline. On
//! systems without the expected accounting files the background thread
//! idles harmlessly instead of failing.

mod meminfo;
mod policy;
mod reclaim;
mod registry;
mod shrinker;

pub use meminfo::{
    parse_meminfo, parse_smaps_rollup, MeminfoSnapshot, MemorySampler, SampleError,
};
pub use policy::{ReclaimDecision, ReclaimPolicy, GIB, MIB};
pub use registry::{ShrinkerRegistration, ShrinkerRegistry};
pub use shrinker::{AllocFlags, ShrinkRequest, Shrinker, PAGE_SIZE};
