#![no_main]

use std::path::Path;

use libfuzzer_sys::fuzz_target;
use memshrink::{parse_meminfo, parse_smaps_rollup, SampleError};

mod utils;

const MEMINFO_LABELS: &[&str] = &["MemTotal", "MemAvailable", "SwapTotal", "SwapFree"];
const ROLLUP_LABELS: &[&str] = &["Rss", "Swap"];

fn assert_parse_error(err: SampleError, labels: &[&str]) {
    match err {
        SampleError::Parse { label, .. } => {
            assert!(labels.contains(&label), "error names a foreign label: {label}");
        }
        SampleError::Io { .. } => unreachable!("pure parsers never touch the filesystem"),
    }
}

fn assert_kb_derived(bytes: u64) {
    // Every figure is a kB count scaled by 1024, saturating at u64::MAX;
    // anything else means the arithmetic drifted.
    assert!(
        bytes % 1024 == 0 || bytes == u64::MAX,
        "not a kB-derived figure: {bytes}"
    );
}

fuzz_target!(|data: &[u8]| {
    let Some(text) = utils::truncate_utf8(data) else {
        return;
    };
    let origin = Path::new("fuzz-input");

    // The goal is simply "never panic / never hang" on arbitrary accounting
    // text, with errors confined to recognized labels.
    match parse_meminfo(text, origin) {
        Ok(snapshot) => {
            assert_kb_derived(snapshot.total);
            assert_kb_derived(snapshot.available);
            assert_kb_derived(snapshot.swap_total);
            assert_kb_derived(snapshot.swap_available);
            assert_eq!(snapshot.usage, 0, "meminfo never reports process usage");
        }
        Err(err) => assert_parse_error(err, MEMINFO_LABELS),
    }

    match parse_smaps_rollup(text, origin) {
        Ok(usage) => assert_kb_derived(usage),
        Err(err) => assert_parse_error(err, ROLLUP_LABELS),
    }
});
