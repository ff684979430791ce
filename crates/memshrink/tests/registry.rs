//! End-to-end registry behavior over the public API: a real reclaim thread
//! sampling a fabricated accounting tree. Shrinkers signal a channel from
//! their callbacks, so the tests synchronize on observed work instead of
//! sleeping and hoping.

use crossbeam_channel as channel;
use memshrink::{
    AllocFlags, MemorySampler, ReclaimPolicy, ShrinkRequest, Shrinker, ShrinkerRegistry, GIB, MIB,
    PAGE_SIZE,
};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const RECV_DEADLINE: Duration = Duration::from_secs(5);

/// Writes `<root>/meminfo` and `<root>/self/smaps_rollup` describing an
/// 8 GiB swapless machine with the given availability and process usage.
fn write_tree(root: &Path, available: u64, usage: u64) {
    std::fs::write(
        root.join("meminfo"),
        format!(
            "MemTotal:       {} kB\n\
             MemFree:         1024 kB\n\
             MemAvailable:   {} kB\n\
             SwapTotal:          0 kB\n\
             SwapFree:           0 kB\n",
            8 * GIB / 1024,
            available / 1024,
        ),
    )
    .expect("write meminfo");
    std::fs::create_dir_all(root.join("self")).expect("mkdir self");
    std::fs::write(
        root.join("self/smaps_rollup"),
        format!(
            "00400000-7fff0000 ---p 00000000 00:00 0    [rollup]\n\
             Rss:            {} kB\n\
             Swap:               0 kB\n",
            usage / 1024,
        ),
    )
    .expect("write smaps_rollup");
}

fn fast_registry(root: &Path) -> ShrinkerRegistry {
    let policy = ReclaimPolicy {
        interval: Duration::from_millis(10),
        ..ReclaimPolicy::default()
    };
    ShrinkerRegistry::with_sampler(MemorySampler::with_proc_root(root), policy)
}

/// Frees a fixed number of units per scan and reports every request on a
/// channel.
struct ObservableShrinker {
    name: String,
    freed_per_scan: u64,
    scans: AtomicU64,
    requests: Mutex<Vec<u64>>,
    ticks: channel::Sender<()>,
}

impl ObservableShrinker {
    fn new(name: &str, freed_per_scan: u64) -> (Arc<Self>, channel::Receiver<()>) {
        let (ticks, tick_rx) = channel::bounded(1024);
        let shrinker = Arc::new(Self {
            name: name.to_string(),
            freed_per_scan,
            scans: AtomicU64::new(0),
            requests: Mutex::new(Vec::new()),
            ticks,
        });
        (shrinker, tick_rx)
    }

    fn scans(&self) -> u64 {
        self.scans.load(Ordering::SeqCst)
    }
}

impl Shrinker for ObservableShrinker {
    fn name(&self) -> &str {
        &self.name
    }

    fn count(&self) -> u64 {
        self.freed_per_scan * 8
    }

    fn scan(&self, request: ShrinkRequest) -> u64 {
        self.scans.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.nr_to_scan);
        let _ = self.ticks.try_send(());
        self.freed_per_scan
    }
}

#[test]
fn background_thread_drains_under_pressure() {
    let dir = tempfile::tempdir().expect("tempdir");
    // 7.5 GiB resident on an 8 GiB machine: 512 MiB over the threshold.
    write_tree(dir.path(), 7 * GIB, 7 * GIB + 512 * MIB);

    let registry = fast_registry(dir.path());
    let (shrinker, ticks) = ObservableShrinker::new("pressured", 1024);
    let _registration = registry.register(shrinker.clone());

    ticks
        .recv_timeout(RECV_DEADLINE)
        .expect("reclaim thread never scanned");

    // The first request of a drain asks for the whole outstanding target,
    // expressed in pages.
    let first_request = shrinker.requests.lock().unwrap()[0];
    assert_eq!(first_request, 512 * MIB / PAGE_SIZE);
}

#[test]
fn dropping_all_handles_stops_eviction() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_tree(dir.path(), 7 * GIB, 7 * GIB + 512 * MIB);

    let registry = fast_registry(dir.path());
    let (shrinker, ticks) = ObservableShrinker::new("short-lived", 1024);
    let registration = registry.register(shrinker.clone());

    ticks
        .recv_timeout(RECV_DEADLINE)
        .expect("reclaim thread never scanned");

    // The registration drop fences further scans of this shrinker; the
    // registry drop then winds the thread down. If shutdown ever hangs, the
    // harness timeout is the failure signal.
    drop(registration);
    let after_shutdown = shrinker.scans();
    drop(registry);

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(shrinker.scans(), after_shutdown);
}

#[test]
fn dropped_registration_is_synchronously_out_of_rotation() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_tree(dir.path(), 7 * GIB, 7 * GIB + 512 * MIB);

    let registry = fast_registry(dir.path());
    let (removed, _removed_ticks) = ObservableShrinker::new("removed", 1024);
    let (kept, kept_ticks) = ObservableShrinker::new("kept", 1024);
    let removed_registration = registry.register(removed.clone());
    let _kept_registration = registry.register(kept.clone());

    kept_ticks
        .recv_timeout(RECV_DEADLINE)
        .expect("reclaim thread never scanned");

    // Unregistration waits out any in-flight pass, so once drop returns the
    // removed shrinker's scan count is final.
    drop(removed_registration);
    let final_scans = removed.scans();

    // Ticks sent before drop returned are all in the channel already; after
    // clearing it, every received tick proves a post-drop scan of the
    // surviving shrinker.
    while kept_ticks.try_recv().is_ok() {}
    for _ in 0..10 {
        kept_ticks
            .recv_timeout(RECV_DEADLINE)
            .expect("surviving shrinker stopped being scanned");
    }

    assert_eq!(removed.scans(), final_scans);
}

#[test]
fn missing_accounting_tree_leaves_shrinkers_alone() {
    let dir = tempfile::tempdir().expect("tempdir");
    // No meminfo, no rollup: the loop must idle, not scan and not die.
    let registry = fast_registry(dir.path());
    let (shrinker, ticks) = ObservableShrinker::new("idle", 1024);
    let _registration = registry.register(shrinker.clone());

    assert_eq!(
        ticks.recv_timeout(Duration::from_millis(200)),
        Err(channel::RecvTimeoutError::Timeout),
        "no scan should ever happen without readable accounting"
    );
    assert_eq!(shrinker.scans(), 0);
}

#[test]
fn relief_pass_walks_registration_order_with_an_eighth_each() {
    let dir = tempfile::tempdir().expect("tempdir");
    // Healthy tree so the background thread stays out of the way.
    write_tree(dir.path(), 7 * GIB, GIB);

    let order: Arc<Mutex<Vec<(String, u64)>>> = Arc::new(Mutex::new(Vec::new()));

    struct LoggingShrinker {
        name: String,
        held_units: u64,
        expected_flags: AllocFlags,
        order: Arc<Mutex<Vec<(String, u64)>>>,
    }

    impl Shrinker for LoggingShrinker {
        fn name(&self) -> &str {
            &self.name
        }

        fn count(&self) -> u64 {
            self.held_units
        }

        fn scan(&self, request: ShrinkRequest) -> u64 {
            assert_eq!(request.flags, self.expected_flags);
            self.order
                .lock()
                .unwrap()
                .push((self.name.clone(), request.nr_to_scan));
            request.nr_to_scan
        }
    }

    let flags = AllocFlags::new(0x2);
    let registry = fast_registry(dir.path());
    let _first = registry.register(Arc::new(LoggingShrinker {
        name: "first".to_string(),
        held_units: 80,
        expected_flags: flags,
        order: order.clone(),
    }));
    let _second = registry.register(Arc::new(LoggingShrinker {
        name: "second".to_string(),
        held_units: 9,
        expected_flags: flags,
        order: order.clone(),
    }));

    registry.relieve_allocation_failure(flags);

    // The call is synchronous: by the time it returns, both shrinkers have
    // been visited in registration order for count()/8 units.
    let order = order.lock().unwrap();
    assert_eq!(
        *order,
        [("first".to_string(), 10), ("second".to_string(), 1)]
    );
}
