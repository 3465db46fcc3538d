//! # Snapshot List
//!
//! Purpose: An ordered list whose writers serialize on a mutex while readers
//! iterate an immutable snapshot without locking, with optional deferred
//! draining driven by the shared scheduler.
//!
//! ## Design Principles
//! 1. **Copy-on-Write Publication**: Every structural change publishes a new
//!    `Arc<Vec<T>>` as the last step inside the mutex; published snapshots are
//!    never mutated.
//! 2. **Non-Blocking Take**: `try_take_first` gives up instead of waiting on a writer.
//! 3. **Single Drainer**: Drains claim the list's `Gate`; a second drain aborts.
//! 4. **Amortized Polling**: Lists with pending work register one poller with
//!    the scheduler instead of owning a thread or timer.
//!
//! ## Structure Overview
//!
//! ```text
//! SnapshotList (cheap clone)
//!   └── shared: Arc<Shared>
//!         ├── items: Mutex<VecDeque<T>>     writers, takes
//!         ├── published: ArcSwap<Vec<T>>    lock-free readers
//!         ├── gate: Arc<Gate>               at most one drain
//!         ├── processor: AtomicCell<..>     armed by add_with
//!         └── poller: PollFn                holds only a Weak back-reference
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::error;

use crate::cell::AtomicCell;
use crate::gate::Gate;
use crate::scheduler::{PollFn, PollStatus, Scheduler};

/// Immutable published view of a list.
pub type Snapshot<T> = Arc<Vec<T>>;

/// Function applied to each drained item.
pub type ProcessFn<T> = Arc<dyn Fn(T) + Send + Sync>;

struct Shared<T> {
    items: Mutex<VecDeque<T>>,
    published: Option<ArcSwap<Vec<T>>>,
    len: AtomicUsize,
    gate: Arc<Gate>,
    processor: AtomicCell<ProcessFn<T>>,
    drain_scheduled: AtomicBool,
    poller: PollFn,
    scheduler: Arc<Scheduler>,
}

/// Mutation-guarded list with lock-free snapshots and deferred draining.
pub struct SnapshotList<T> {
    shared: Arc<Shared<T>>,
}

impl<T> SnapshotList<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a snapshot-publishing list served by the global scheduler.
    pub fn new() -> Self {
        Self::with_scheduler(Scheduler::global())
    }

    /// Creates a snapshot-publishing list served by `scheduler`.
    pub fn with_scheduler(scheduler: Arc<Scheduler>) -> Self {
        Self::with_options(scheduler, true)
    }

    /// Creates a list; when `cache_snapshots` is false, `cache` copies under the lock.
    pub fn with_options(scheduler: Arc<Scheduler>, cache_snapshots: bool) -> Self {
        let shared = Arc::new_cyclic(|weak: &Weak<Shared<T>>| {
            let weak = weak.clone();
            let poller: PollFn = Arc::new(move || poll_list(&weak));
            Shared {
                items: Mutex::new(VecDeque::new()),
                published: cache_snapshots.then(|| ArcSwap::from_pointee(Vec::new())),
                len: AtomicUsize::new(0),
                gate: Arc::new(Gate::new()),
                processor: AtomicCell::new(),
                drain_scheduled: AtomicBool::new(false),
                poller,
                scheduler,
            }
        });
        SnapshotList { shared }
    }

    /// Appends `item`.
    pub fn add(&self, item: T) {
        let mut items = self.shared.items.lock();
        items.push_back(item);
        self.shared.commit(&items);
    }

    /// Appends `item` and arms a deferred drain that feeds items to `process`.
    ///
    /// The most recently supplied `process` is the one the drain uses.
    pub fn add_with(&self, item: T, process: ProcessFn<T>) {
        self.add(item);
        self.arm(process);
    }

    /// Arms a deferred drain without adding an item.
    pub fn arm(&self, process: ProcessFn<T>) {
        let current = self.shared.processor.get();
        let unchanged = current
            .as_ref()
            .is_some_and(|current| same_fn(&**current, &process));
        if !unchanged {
            self.shared.processor.set(Arc::new(process));
        }
        self.shared
            .scheduler
            .register(Arc::clone(&self.shared.poller));
    }

    /// Disarms draining; the poller deregisters on its next turn.
    pub fn stop_draining(&self) {
        self.shared.processor.clear();
    }

    /// Returns true while a processing function is armed.
    pub fn is_armed(&self) -> bool {
        self.shared.processor.is_set()
    }

    /// Returns true while a drain task holds the list.
    pub fn is_draining(&self) -> bool {
        self.shared.gate.is_held()
    }

    /// Removes every item equal to `item`. Returns whether any was removed.
    pub fn remove(&self, item: &T) -> bool
    where
        T: PartialEq,
    {
        self.remove_where(|candidate| candidate == item) > 0
    }

    /// Removes every item matching `pred` and returns how many were removed.
    pub fn remove_where<F>(&self, mut pred: F) -> usize
    where
        F: FnMut(&T) -> bool,
    {
        let mut items = self.shared.items.lock();
        let before = items.len();
        items.retain(|item| !pred(item));
        let removed = before - items.len();
        if removed > 0 {
            self.shared.commit(&items);
        }
        removed
    }

    /// Removes all items.
    pub fn clear(&self) {
        let mut items = self.shared.items.lock();
        items.clear();
        self.shared.commit(&items);
    }

    /// Peeks at (`remove == false`) or pops (`remove == true`) the head item.
    ///
    /// Returns `None` when the list is empty or a writer currently holds it.
    pub fn try_take_first(&self, remove: bool) -> Option<T> {
        self.shared.try_take_first(remove)
    }

    /// Latest published snapshot.
    pub fn cache(&self) -> Snapshot<T> {
        match &self.shared.published {
            Some(published) => published.load_full(),
            None => Arc::new(self.shared.items.lock().iter().cloned().collect()),
        }
    }

    /// Number of items at the last commit.
    pub fn len(&self) -> usize {
        self.shared.len.load(Ordering::Acquire)
    }

    /// Returns true when the list held no items at the last commit.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocks until no drain is running and nothing is left for one to do.
    pub fn wait_idle(&self, poll: Duration) {
        loop {
            self.shared.gate.wait_exit(poll);
            if self.is_settled() {
                return;
            }
            std::thread::sleep(poll);
        }
    }

    /// Suspends until no drain is running and nothing is left for one to do.
    pub async fn wait_idle_async(&self, poll: Duration) {
        loop {
            self.shared.gate.wait_exit_async(poll).await;
            if self.is_settled() {
                return;
            }
            tokio::time::sleep(poll).await;
        }
    }

    fn is_settled(&self) -> bool {
        !self.shared.gate.is_held() && (self.is_empty() || !self.is_armed())
    }
}

impl<T> Shared<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Publishes the committed state; must run while `items` is locked.
    fn commit(&self, items: &VecDeque<T>) {
        self.len.store(items.len(), Ordering::Release);
        if let Some(published) = &self.published {
            published.store(Arc::new(items.iter().cloned().collect()));
        }
    }

    fn try_take_first(&self, remove: bool) -> Option<T> {
        let mut items = self.items.try_lock()?;
        if !remove {
            return items.front().cloned();
        }
        let item = items.pop_front()?;
        self.commit(&items);
        Some(item)
    }
}

fn poll_list<T>(weak: &Weak<Shared<T>>) -> PollStatus
where
    T: Clone + Send + Sync + 'static,
{
    let Some(shared) = weak.upgrade() else {
        return PollStatus::Deregister;
    };
    if !shared.processor.is_set() {
        return PollStatus::Deregister;
    }

    let pending = shared.len.load(Ordering::Acquire) > 0;
    if pending
        && !shared.gate.is_held()
        && !shared.drain_scheduled.swap(true, Ordering::AcqRel)
    {
        let job = Arc::clone(&shared);
        if !shared.scheduler.spawn(move || drain(&job)) {
            shared.drain_scheduled.store(false, Ordering::Release);
        }
    }
    PollStatus::Continue
}

fn drain<T>(shared: &Arc<Shared<T>>)
where
    T: Clone + Send + Sync + 'static,
{
    let guard = shared.gate.try_enter_owned();
    shared.drain_scheduled.store(false, Ordering::Release);
    let Some(_guard) = guard else {
        return;
    };

    loop {
        let Some(process) = shared.processor.get() else {
            break;
        };
        let Some(item) = shared.try_take_first(true) else {
            break;
        };
        if panic::catch_unwind(AssertUnwindSafe(|| process(item))).is_err() {
            error!("drain processor panicked; item dropped");
        }
    }
}

fn same_fn<T>(a: &ProcessFn<T>, b: &ProcessFn<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl<T> Clone for SnapshotList<T> {
    fn clone(&self) -> Self {
        SnapshotList {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for SnapshotList<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for SnapshotList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotList")
            .field("len", &self.shared.len.load(Ordering::Acquire))
            .field("draining", &self.shared.gate.is_held())
            .field("armed", &self.shared.processor.is_set())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    use kvpool_common::SchedulerConfig;

    fn manual_scheduler() -> Arc<Scheduler> {
        Arc::new(Scheduler::new(SchedulerConfig {
            auto_start: false,
            ..SchedulerConfig::default()
        }))
    }

    #[test]
    fn cache_tracks_mutations() {
        let list = SnapshotList::with_scheduler(manual_scheduler());
        list.add(1);
        list.add(2);
        list.add(1);
        let before = list.cache();
        assert_eq!(*before, vec![1, 2, 1]);

        assert!(list.remove(&1));
        assert!(!list.remove(&7));
        assert_eq!(*list.cache(), vec![2]);
        assert_eq!(*before, vec![1, 2, 1]);

        list.clear();
        assert!(list.cache().is_empty());
        assert!(list.is_empty());
    }

    #[test]
    fn uncached_list_copies_on_read() {
        let list = SnapshotList::with_options(manual_scheduler(), false);
        list.add("a");
        list.add("b");
        assert_eq!(*list.cache(), vec!["a", "b"]);
    }

    #[test]
    fn take_first_peeks_or_pops_in_order() {
        let list = SnapshotList::with_scheduler(manual_scheduler());
        for n in 0..5 {
            list.add(n);
        }
        assert_eq!(list.try_take_first(false), Some(0));
        assert_eq!(list.len(), 5);

        let drained: Vec<_> = std::iter::from_fn(|| list.try_take_first(true)).collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
        assert!(list.try_take_first(true).is_none());
    }

    #[test]
    fn take_first_gives_up_while_writer_holds_lock() {
        let list = SnapshotList::with_scheduler(manual_scheduler());
        list.add(1);
        let held = list.shared.items.lock();
        assert_eq!(list.try_take_first(true), None);
        drop(held);
        assert_eq!(list.try_take_first(true), Some(1));
    }

    #[test]
    fn remove_where_counts_removed_items() {
        let list = SnapshotList::with_scheduler(manual_scheduler());
        for n in 0..10 {
            list.add(n);
        }
        assert_eq!(list.remove_where(|n| n % 2 == 0), 5);
        assert_eq!(*list.cache(), vec![1, 3, 5, 7, 9]);
    }

    #[test]
    fn tick_drains_armed_list_in_fifo_order() {
        let scheduler = manual_scheduler();
        let list = SnapshotList::with_scheduler(Arc::clone(&scheduler));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let process: ProcessFn<u32> = {
            let seen = Arc::clone(&seen);
            Arc::new(move |n| seen.lock().push(n))
        };

        for n in 0..50 {
            list.add_with(n, Arc::clone(&process));
        }
        assert_eq!(scheduler.len(), 1);

        assert!(scheduler.tick());
        list.wait_idle(Duration::from_millis(1));

        assert_eq!(*seen.lock(), (0..50).collect::<Vec<_>>());
        assert!(list.is_empty());
    }

    #[test]
    fn stop_draining_deregisters_poller() {
        let scheduler = manual_scheduler();
        let list: SnapshotList<u32> = SnapshotList::with_scheduler(Arc::clone(&scheduler));
        list.arm(Arc::new(|_| {}));
        assert_eq!(scheduler.len(), 1);

        list.stop_draining();
        scheduler.tick();
        assert!(scheduler.is_empty());
    }

    #[test]
    fn dropped_list_deregisters_poller() {
        let scheduler = manual_scheduler();
        let list: SnapshotList<u32> = SnapshotList::with_scheduler(Arc::clone(&scheduler));
        list.arm(Arc::new(|_| {}));
        drop(list);
        scheduler.tick();
        assert!(scheduler.is_empty());
    }

    #[test]
    fn busy_gate_skips_drain() {
        let scheduler = manual_scheduler();
        let list = SnapshotList::with_scheduler(Arc::clone(&scheduler));
        let ran = Arc::new(AtomicBool::new(false));
        let process: ProcessFn<u32> = {
            let ran = Arc::clone(&ran);
            Arc::new(move |_| ran.store(true, Ordering::SeqCst))
        };

        let held = list.shared.gate.try_enter().unwrap();
        list.add_with(1, process);
        scheduler.tick();
        thread::sleep(Duration::from_millis(10));
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(list.len(), 1);

        drop(held);
        scheduler.tick();
        list.wait_idle(Duration::from_millis(1));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn panicking_processor_does_not_wedge_list() {
        let scheduler = manual_scheduler();
        let list = SnapshotList::with_scheduler(Arc::clone(&scheduler));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let process: ProcessFn<u32> = {
            let seen = Arc::clone(&seen);
            Arc::new(move |n| {
                if n == 1 {
                    panic!("bad item");
                }
                seen.lock().push(n);
            })
        };
        for n in 0..3 {
            list.add_with(n, Arc::clone(&process));
        }

        scheduler.tick();
        list.wait_idle(Duration::from_millis(1));
        assert_eq!(*seen.lock(), vec![0, 2]);
        assert!(!list.is_draining());
    }
}
