//! When to evict, and how much.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::meminfo::MeminfoSnapshot;

/// One mebibyte.
pub const MIB: u64 = 1024 * 1024;
/// One gibibyte.
pub const GIB: u64 = 1024 * MIB;

/// Tuning knobs for the reclaim loop.
///
/// The headroom ratios themselves (an eighth of total memory, a quarter of
/// total swap) are fixed properties of the design, not configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimPolicy {
    /// Pause between reclaim cycles.
    pub interval: Duration,
    /// Below this much free memory plus swap the process considers itself
    /// doomed and terminates before the OS picks a victim for it.
    pub min_free_bytes: u64,
    /// Upper bound on bytes freed by one drain. Hitting it means "try again
    /// next cycle", bounding how long one pass holds the registry lock and
    /// how hard it hits the caches.
    pub cycle_cap_bytes: u64,
}

impl Default for ReclaimPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            min_free_bytes: GIB,
            cycle_cap_bytes: 32 * MIB,
        }
    }
}

/// What a reclaim cycle should do, derived from one deep snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimDecision {
    /// Headroom is satisfied, or the snapshot is unusable; skip this cycle.
    None,
    /// Evict this many bytes worth of cached data.
    Shrink { target_bytes: u64 },
    /// Free memory plus swap fell under the survival floor.
    Critical { free_bytes: u64 },
}

impl ReclaimPolicy {
    /// Decides the current cycle's action.
    ///
    /// The memory target is usage-relative: keep an eighth of total memory
    /// clear of this process's footprint. The swap target keeps a quarter of
    /// total swap free. Whichever deficit is larger wins; either pressure
    /// source alone justifies eviction.
    pub fn evaluate(&self, snapshot: &MeminfoSnapshot) -> ReclaimDecision {
        if !snapshot.has_system_totals() {
            // A zero total means the source was never read; nothing can be
            // decided from it. A zero `available` is a real reading and
            // falls through to the floor check below.
            return ReclaimDecision::None;
        }

        let free_bytes = snapshot.available.saturating_add(snapshot.swap_available);
        if free_bytes < self.min_free_bytes {
            return ReclaimDecision::Critical { free_bytes };
        }

        let total = snapshot.total as i64;
        let usage = snapshot.usage as i64;
        let swap_total = snapshot.swap_total as i64;
        let swap_available = snapshot.swap_available as i64;

        // Deficits go negative when headroom is satisfied; signed math keeps
        // that explicit instead of saturating it away.
        let want_shrink_mem = total / 8 - (total - usage);
        let want_shrink_swap = swap_total / 4 - swap_available;
        let want_shrink = want_shrink_mem.max(want_shrink_swap);

        if want_shrink > 0 {
            ReclaimDecision::Shrink {
                target_bytes: want_shrink as u64,
            }
        } else {
            ReclaimDecision::None
        }
    }
}
