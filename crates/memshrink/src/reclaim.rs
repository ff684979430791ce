//! The background reclaim loop: one pressure check per second, one drain
//! per check, fatal exit when accounting says the machine is out of road.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::OnceLock;
use std::sync::Weak;

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::meminfo::SampleError;
use crate::policy::ReclaimDecision;
use crate::registry::Inner;
use crate::shrinker::AllocFlags;

/// What one pass of the loop did. Returned rather than acted on so the
/// cycle stays a pure-ish function the tests can call directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CycleOutcome {
    /// Nothing to do this round; sleep and retry.
    Idle(IdleReason),
    Shrunk { target_bytes: u64, freed_bytes: u64 },
    /// The process must terminate.
    Fatal(FatalReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IdleReason {
    NoShrinkers,
    /// Accounting files could not be read. Transient on some systems
    /// (procfs remounts), permanent on others; either way not our call to
    /// kill the process over.
    SamplerUnavailable,
    NoPressure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FatalReason {
    /// A recognized accounting field failed to parse. Continuing to make
    /// eviction decisions on numbers we cannot read is worse than dying.
    CorruptAccounting(String),
    BelowFloor { free_bytes: u64, floor_bytes: u64 },
}

/// One pressure-check cycle against `inner`'s registry.
///
/// Order matters: the registry is consulted before any accounting file is
/// opened, so an idle registry costs no I/O per tick.
pub(crate) fn run_cycle(inner: &Inner) -> CycleOutcome {
    if !inner.has_shrinkers() {
        return CycleOutcome::Idle(IdleReason::NoShrinkers);
    }

    let snapshot = match inner.sampler.sample(true) {
        Ok(snapshot) => snapshot,
        Err(err @ SampleError::Parse { .. }) => {
            return CycleOutcome::Fatal(FatalReason::CorruptAccounting(err.to_string()));
        }
        Err(err @ SampleError::Io { .. }) => {
            warn_sampler_unavailable_once(&err);
            return CycleOutcome::Idle(IdleReason::SamplerUnavailable);
        }
    };

    match inner.policy.evaluate(&snapshot) {
        ReclaimDecision::None => CycleOutcome::Idle(IdleReason::NoPressure),
        ReclaimDecision::Shrink { target_bytes } => {
            let freed_bytes = inner.drain_pass(target_bytes, AllocFlags::default());
            tracing::debug!(
                target = "memshrink.reclaim",
                target_bytes,
                freed_bytes,
                "drained shrinkers"
            );
            CycleOutcome::Shrunk {
                target_bytes,
                freed_bytes,
            }
        }
        ReclaimDecision::Critical { free_bytes } => CycleOutcome::Fatal(FatalReason::BelowFloor {
            free_bytes,
            floor_bytes: inner.policy.min_free_bytes,
        }),
    }
}

/// Body of the `memshrink-reclaim` thread.
///
/// Holds only a `Weak` to the registry between cycles, so the loop never
/// keeps its own registry alive: when the last handle drops, the upgrade
/// fails and the thread winds down on its own.
pub(crate) fn run_loop(inner: Weak<Inner>, stop: Receiver<()>) {
    tracing::debug!(target = "memshrink.reclaim", "reclaim thread started");
    loop {
        let Some(strong) = inner.upgrade() else {
            break;
        };
        let interval = strong.policy.interval;

        match catch_unwind(AssertUnwindSafe(|| run_cycle(&strong))) {
            Ok(CycleOutcome::Fatal(reason)) => fatal(reason),
            Ok(CycleOutcome::Idle(_)) | Ok(CycleOutcome::Shrunk { .. }) => {}
            Err(panic) => {
                // A panicking shrinker must not take the loop down with it;
                // the owning cache is broken, the others still deserve
                // service.
                tracing::error!(
                    target = "memshrink.reclaim",
                    panic = %panic_payload_to_str(&panic),
                    "reclaim cycle panicked"
                );
            }
        }

        // Release before sleeping so this thread never holds the last
        // reference for a full interval.
        drop(strong);

        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    tracing::debug!(target = "memshrink.reclaim", "reclaim thread stopped");
}

/// Logs the diagnostic and terminates the process with a nonzero status.
fn fatal(reason: FatalReason) -> ! {
    match &reason {
        FatalReason::CorruptAccounting(message) => {
            tracing::error!(
                target = "memshrink.reclaim",
                error = %message,
                "memory accounting is corrupt; terminating"
            );
        }
        FatalReason::BelowFloor {
            free_bytes,
            floor_bytes,
        } => {
            tracing::error!(
                target = "memshrink.reclaim",
                free_bytes,
                floor_bytes,
                "free memory fell below the survival floor; terminating"
            );
        }
    }
    std::process::exit(1);
}

fn warn_sampler_unavailable_once(err: &SampleError) {
    static REPORTED: OnceLock<()> = OnceLock::new();
    if REPORTED.set(()).is_ok() {
        tracing::warn!(
            target = "memshrink.reclaim",
            error = %err,
            "memory accounting unavailable; reclaim loop is idling"
        );
    }
}

fn panic_payload_to_str(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(|s| s.as_str()))
        .unwrap_or("<non-string panic>")
}
