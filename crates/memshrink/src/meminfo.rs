//! System and process memory accounting.
//!
//! Figures come from the kernel's line-oriented accounting sources:
//! `/proc/meminfo` for the system-wide picture and `/proc/self/smaps_rollup`
//! for this process's resident and swapped usage. Parsing is separated from
//! file access so unit tests and the fuzz target run on plain strings, and
//! the sampler's root directory is injectable so integration tests run
//! against fabricated accounting trees.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Byte-count snapshot of system and process memory state.
///
/// A zero `total` marks the snapshot as never sampled. Every other zero is a
/// literal reading: the swap fields on swapless systems, `available` on a
/// machine with nothing left, and `usage` until a deep sample is taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeminfoSnapshot {
    /// Total system memory.
    pub total: u64,
    /// System memory available for new allocations without swapping.
    pub available: u64,
    /// Total configured swap.
    pub swap_total: u64,
    /// Swap currently free.
    pub swap_available: u64,
    /// This process's resident plus swapped-out bytes (deep samples only).
    pub usage: u64,
}

impl MeminfoSnapshot {
    /// Whether the system-wide figures were actually read.
    ///
    /// `MemTotal` can never genuinely read zero, so a zero total is the
    /// never-sampled sentinel. `available` is not part of the check: the
    /// kernel clamps `MemAvailable` at zero on an exhausted machine, and
    /// that reading has to keep meaning what it says.
    pub fn has_system_totals(&self) -> bool {
        self.total != 0
    }
}

/// Failure to produce a [`MeminfoSnapshot`].
#[derive(Debug, Error)]
pub enum SampleError {
    /// The accounting source could not be opened or read at all.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// A recognized accounting label carried a non-numeric value. The source
    /// is assumed trustworthy, so a malformed line means the environment is
    /// corrupt, not that the input needs recovering from.
    #[error("malformed {label} value {value:?} in {path}")]
    Parse {
        path: PathBuf,
        label: &'static str,
        value: String,
    },
}

/// Reads memory statistics from the accounting filesystem.
#[derive(Debug, Clone)]
pub struct MemorySampler {
    meminfo_path: PathBuf,
    smaps_rollup_path: PathBuf,
}

impl MemorySampler {
    /// Sampler over the standard `/proc` locations.
    pub fn new() -> Self {
        Self::with_proc_root(Path::new("/proc"))
    }

    /// Sampler rooted at an alternate accounting tree, expecting
    /// `<root>/meminfo` and `<root>/self/smaps_rollup`.
    pub fn with_proc_root(root: &Path) -> Self {
        Self {
            meminfo_path: root.join("meminfo"),
            smaps_rollup_path: root.join("self/smaps_rollup"),
        }
    }

    /// Takes a snapshot of system memory and swap.
    ///
    /// `deep` additionally reads this process's resident-plus-swapped usage.
    /// The deep read makes the kernel walk per-mapping accounting and can
    /// take on the order of a second; only request it when a usage-relative
    /// decision is actually being made.
    pub fn sample(&self, deep: bool) -> Result<MeminfoSnapshot, SampleError> {
        let contents = read_source(&self.meminfo_path)?;
        let mut snapshot = parse_meminfo(&contents, &self.meminfo_path)?;
        if deep {
            let contents = read_source(&self.smaps_rollup_path)?;
            snapshot.usage = parse_smaps_rollup(&contents, &self.smaps_rollup_path)?;
        }
        Ok(snapshot)
    }
}

impl Default for MemorySampler {
    fn default() -> Self {
        Self::new()
    }
}

fn read_source(path: &Path) -> Result<String, SampleError> {
    std::fs::read_to_string(path).map_err(|source| SampleError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Parse `/proc/meminfo`-shaped contents into the system-wide fields.
///
/// Pure helper; does not touch the filesystem. `origin` only attributes
/// errors. Unrecognized labels are skipped, so kernels can add lines without
/// breaking us; a recognized label with a non-numeric value is an error.
pub fn parse_meminfo(contents: &str, origin: &Path) -> Result<MeminfoSnapshot, SampleError> {
    let mut snapshot = MeminfoSnapshot::default();
    for line in contents.lines() {
        let line = line.trim_start();
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            snapshot.total = parse_kb_value("MemTotal", rest, origin)?;
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            snapshot.available = parse_kb_value("MemAvailable", rest, origin)?;
        } else if let Some(rest) = line.strip_prefix("SwapTotal:") {
            snapshot.swap_total = parse_kb_value("SwapTotal", rest, origin)?;
        } else if let Some(rest) = line.strip_prefix("SwapFree:") {
            snapshot.swap_available = parse_kb_value("SwapFree", rest, origin)?;
        }
    }
    Ok(snapshot)
}

/// Parse `/proc/<pid>/smaps_rollup`-shaped contents into resident plus
/// swapped bytes.
///
/// Pure helper; does not touch the filesystem. The mapping-range header line
/// and fields like `Pss:` or `SwapPss:` fall under the unrecognized-label
/// rule and are ignored.
pub fn parse_smaps_rollup(contents: &str, origin: &Path) -> Result<u64, SampleError> {
    let mut usage: u64 = 0;
    for line in contents.lines() {
        let line = line.trim_start();
        if let Some(rest) = line.strip_prefix("Rss:") {
            usage = usage.saturating_add(parse_kb_value("Rss", rest, origin)?);
        } else if let Some(rest) = line.strip_prefix("Swap:") {
            usage = usage.saturating_add(parse_kb_value("Swap", rest, origin)?);
        }
    }
    Ok(usage)
}

/// Accounting values are `<integer> kB`; the integer is the first whitespace
/// token after the label.
fn parse_kb_value(label: &'static str, rest: &str, origin: &Path) -> Result<u64, SampleError> {
    let value = rest.split_whitespace().next().unwrap_or("");
    match value.parse::<u64>() {
        Ok(kb) => Ok(kb.saturating_mul(1024)),
        Err(_) => Err(SampleError::Parse {
            path: origin.to_path_buf(),
            label,
            value: value.to_string(),
        }),
    }
}
