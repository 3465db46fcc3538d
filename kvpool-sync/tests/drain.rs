use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use kvpool_common::SchedulerConfig;
use kvpool_sync::{DrainSpawner, ProcessFn, Scheduler, SnapshotList};
use parking_lot::Mutex;

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    done()
}

fn isolated_scheduler() -> Arc<Scheduler> {
    Arc::new(Scheduler::new(SchedulerConfig {
        drain_thread_name: "drain-test".to_string(),
        ..SchedulerConfig::default()
    }))
}

#[test]
fn readers_only_observe_committed_snapshots() {
    let list = SnapshotList::with_scheduler(isolated_scheduler());
    let writing = Arc::new(AtomicBool::new(true));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let list = list.clone();
            let writing = Arc::clone(&writing);
            thread::spawn(move || {
                let mut last_len = 0;
                while writing.load(Ordering::Acquire) {
                    let snapshot = list.cache();
                    let expected: Vec<u32> = (0..snapshot.len() as u32).collect();
                    assert_eq!(*snapshot, expected);
                    assert!(snapshot.len() >= last_len);
                    last_len = snapshot.len();
                }
            })
        })
        .collect();

    for n in 0..2_000u32 {
        list.add(n);
    }
    writing.store(false, Ordering::Release);
    for reader in readers {
        reader.join().unwrap();
    }

    assert_eq!(list.cache().len(), 2_000);
    list.clear();
    assert!(list.cache().is_empty());
}

#[test]
fn single_writer_drains_in_fifo_order() {
    let list = SnapshotList::with_scheduler(isolated_scheduler());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let process: ProcessFn<u32> = {
        let seen = Arc::clone(&seen);
        Arc::new(move |n| seen.lock().push(n))
    };

    for n in 0..500 {
        list.add_with(n, Arc::clone(&process));
    }

    assert!(wait_until(Duration::from_secs(5), || seen.lock().len() == 500));
    assert_eq!(*seen.lock(), (0..500).collect::<Vec<_>>());
    list.stop_draining();
}

#[test]
fn at_most_one_drain_runs_per_list() {
    const WRITERS: usize = 8;
    const PER_WRITER: usize = 200;

    let list = SnapshotList::with_scheduler(isolated_scheduler());
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let processed = Arc::new(AtomicUsize::new(0));

    let process: ProcessFn<usize> = {
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        let processed = Arc::clone(&processed);
        Arc::new(move |_| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_micros(50));
            active.fetch_sub(1, Ordering::SeqCst);
            processed.fetch_add(1, Ordering::SeqCst);
        })
    };

    let barrier = Arc::new(Barrier::new(WRITERS));
    let writers: Vec<_> = (0..WRITERS)
        .map(|writer| {
            let list = list.clone();
            let process = Arc::clone(&process);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for n in 0..PER_WRITER {
                    list.add_with(writer * PER_WRITER + n, Arc::clone(&process));
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let total = WRITERS * PER_WRITER;
    assert!(wait_until(Duration::from_secs(10), || {
        processed.load(Ordering::SeqCst) == total
    }));
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    list.stop_draining();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tokio_spawner_runs_drains_on_blocking_pool() {
    let scheduler = Arc::new(Scheduler::with_spawner(
        SchedulerConfig::default(),
        DrainSpawner::Tokio(tokio::runtime::Handle::current()),
    ));
    let list = SnapshotList::with_scheduler(scheduler);
    let total = Arc::new(AtomicUsize::new(0));
    let process: ProcessFn<usize> = {
        let total = Arc::clone(&total);
        Arc::new(move |n| {
            total.fetch_add(n, Ordering::SeqCst);
        })
    };

    for n in 1..=100 {
        list.add_with(n, Arc::clone(&process));
    }

    tokio::time::timeout(
        Duration::from_secs(5),
        list.wait_idle_async(Duration::from_millis(1)),
    )
    .await
    .expect("drain finished");
    assert_eq!(total.load(Ordering::SeqCst), 5_050);
    list.stop_draining();
}
