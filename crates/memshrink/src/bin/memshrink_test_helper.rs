//! Test helper: runs a real reclaim loop against a fabricated accounting
//! tree so integration tests can observe process-level outcomes (fatal
//! exits, clean shutdown) from outside.

use std::{env, io, path::PathBuf, process, thread, time::Duration};

use memshrink::{MemorySampler, ReclaimPolicy, ShrinkRequest, Shrinker, ShrinkerRegistry};

/// Never holds anything; registering it exists only to start the loop.
struct InertShrinker;

impl Shrinker for InertShrinker {
    fn name(&self) -> &str {
        "inert"
    }

    fn count(&self) -> u64 {
        0
    }

    fn scan(&self, _request: ShrinkRequest) -> u64 {
        0
    }
}

fn parse_u64(value: Option<String>, flag: &str) -> u64 {
    let value = value.unwrap_or_else(|| {
        eprintln!("missing value for {flag}");
        process::exit(2);
    });
    value.parse().unwrap_or_else(|_| {
        eprintln!("invalid u64 for {flag}: {value}");
        process::exit(2);
    })
}

fn parse_path(value: Option<String>, flag: &str) -> PathBuf {
    PathBuf::from(value.unwrap_or_else(|| {
        eprintln!("missing value for {flag}");
        process::exit(2);
    }))
}

fn main() {
    tracing_subscriber::fmt()
        .with_ansi(false)
        .without_time()
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(io::stderr)
        .init();

    let mut proc_root: Option<PathBuf> = None;
    let mut interval_ms: u64 = 20;
    let mut run_ms: u64 = 1_000;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--proc-root" => proc_root = Some(parse_path(args.next(), "--proc-root")),
            "--interval-ms" => interval_ms = parse_u64(args.next(), "--interval-ms"),
            "--run-ms" => run_ms = parse_u64(args.next(), "--run-ms"),
            other => {
                eprintln!("unknown argument: {other}");
                process::exit(2);
            }
        }
    }

    let Some(proc_root) = proc_root else {
        eprintln!("--proc-root is required");
        process::exit(2);
    };

    let policy = ReclaimPolicy {
        interval: Duration::from_millis(interval_ms),
        ..ReclaimPolicy::default()
    };
    let registry =
        ShrinkerRegistry::with_sampler(MemorySampler::with_proc_root(&proc_root), policy);
    let _registration = registry.register(std::sync::Arc::new(InertShrinker));

    // A fatal cycle exits from the reclaim thread before this deadline; a
    // healthy tree lets the sleep finish and the process exit zero.
    thread::sleep(Duration::from_millis(run_ms));
}
