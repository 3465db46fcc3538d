//! # Round-Robin Scheduler
//!
//! Purpose: Service any number of pollers from one shared timer thread,
//! one poller per tick, in rotating order.
//!
//! ## Design Principles
//! 1. **One Timer**: A single periodic thread replaces a thread or timer per consumer.
//! 2. **Non-Overlapping Ticks**: A tick that finds another tick in progress returns at once.
//! 3. **Callbacks Outside the Lock**: The registry lock covers selection and removal only.
//! 4. **Never Block the Timer**: Pollers hand heavy work to the `DrainSpawner`.
//!
//! ## Lifecycle
//!
//! ```text
//! register (auto_start) --> timer running --registry empty--> timer exits
//!        ^                                                       |
//!        +------------------- next register ---------------------+
//! shutdown / drop --> stop flag set, timer joined
//! ```
//!
//! `Scheduler::global()` is the process-wide instance; tests and embedders
//! build isolated ones with `Scheduler::new`.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use kvpool_common::SchedulerConfig;

/// What a poller wants after being serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// Keep the poller registered.
    Continue,
    /// Remove the poller from the registry.
    Deregister,
}

/// Zero-argument poll callback.
pub type PollFn = Arc<dyn Fn() -> PollStatus + Send + Sync>;

/// Where pollers run their background jobs.
#[derive(Clone)]
pub enum DrainSpawner {
    /// One named OS thread per job.
    Threads { name: String },
    /// The blocking pool of a tokio runtime.
    Tokio(tokio::runtime::Handle),
}

impl DrainSpawner {
    /// Starts `job` in the background. Returns false when it could not be started.
    pub fn spawn<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match self {
            DrainSpawner::Threads { name } => {
                match thread::Builder::new().name(name.clone()).spawn(job) {
                    Ok(_) => true,
                    Err(err) => {
                        warn!(error = %err, "failed to spawn drain thread");
                        false
                    }
                }
            }
            DrainSpawner::Tokio(handle) => {
                drop(handle.spawn_blocking(job));
                true
            }
        }
    }
}

impl fmt::Debug for DrainSpawner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DrainSpawner::Threads { name } => f.debug_struct("Threads").field("name", name).finish(),
            DrainSpawner::Tokio(_) => f.write_str("Tokio"),
        }
    }
}

struct Entry {
    poller: PollFn,
    // Bumped when an already-present poller is registered again, so a
    // Deregister answer computed before the re-registration is ignored.
    generation: u64,
}

struct Registry {
    entries: Vec<Entry>,
    cursor: usize,
    timer_running: bool,
}

struct Inner {
    config: SchedulerConfig,
    spawner: DrainSpawner,
    registry: Mutex<Registry>,
    ticking: AtomicBool,
    stop: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
}

/// Shared cooperative round-robin scheduler.
pub struct Scheduler {
    inner: Arc<Inner>,
}

static GLOBAL: OnceLock<Arc<Scheduler>> = OnceLock::new();

impl Scheduler {
    /// Creates an isolated scheduler whose drain jobs run on named threads.
    pub fn new(config: SchedulerConfig) -> Self {
        let spawner = DrainSpawner::Threads {
            name: config.drain_thread_name.clone(),
        };
        Self::with_spawner(config, spawner)
    }

    /// Creates an isolated scheduler with an explicit job spawner.
    pub fn with_spawner(config: SchedulerConfig, spawner: DrainSpawner) -> Self {
        Scheduler {
            inner: Arc::new(Inner {
                config,
                spawner,
                registry: Mutex::new(Registry {
                    entries: Vec::new(),
                    cursor: 0,
                    timer_running: false,
                }),
                ticking: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                timer: Mutex::new(None),
            }),
        }
    }

    /// Returns the process-wide scheduler, creating it on first use.
    pub fn global() -> Arc<Scheduler> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Scheduler::new(SchedulerConfig::default()))))
    }

    /// Creates the process-wide scheduler from `config`.
    ///
    /// Has no effect once the global scheduler exists; the existing one is returned.
    pub fn init_global(config: SchedulerConfig) -> Arc<Scheduler> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Scheduler::new(config))))
    }

    /// Adds `poller` unless the same callback is already registered.
    ///
    /// Returns true when the poller was newly added. Starts the timer thread
    /// when `auto_start` is set and it is not already running.
    pub fn register(&self, poller: PollFn) -> bool {
        let (added, start_timer) = {
            let mut registry = self.inner.registry.lock();
            let added = match registry
                .entries
                .iter_mut()
                .find(|entry| same_poller(&entry.poller, &poller))
            {
                Some(entry) => {
                    entry.generation = entry.generation.wrapping_add(1);
                    false
                }
                None => {
                    registry.entries.push(Entry {
                        poller,
                        generation: 0,
                    });
                    true
                }
            };
            let start_timer = self.inner.config.auto_start
                && !registry.timer_running
                && !self.inner.stop.load(Ordering::Acquire);
            if start_timer {
                registry.timer_running = true;
            }
            (added, start_timer)
        };

        if start_timer {
            self.start_timer();
        }
        added
    }

    /// Returns true when `poller` is registered.
    pub fn is_registered(&self, poller: &PollFn) -> bool {
        self.inner
            .registry
            .lock()
            .entries
            .iter()
            .any(|entry| same_poller(&entry.poller, poller))
    }

    /// Number of registered pollers.
    pub fn len(&self) -> usize {
        self.inner.registry.lock().entries.len()
    }

    /// Returns true when no pollers are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true while the timer thread is running.
    pub fn is_running(&self) -> bool {
        self.inner.registry.lock().timer_running
    }

    /// Services the poller under the cursor.
    ///
    /// Returns false when the tick was skipped (overlap or empty registry).
    pub fn tick(&self) -> bool {
        self.inner.tick()
    }

    /// Runs `job` on this scheduler's spawner.
    pub fn spawn<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.spawner.spawn(job)
    }

    /// Stops the timer thread and waits for it to exit.
    ///
    /// Registrations after shutdown no longer start the timer; `tick` still works.
    pub fn shutdown(&self) {
        self.inner.stop.store(true, Ordering::Release);
        let handle = self.inner.timer.lock().take();
        if let Some(handle) = handle {
            // The last reference may be dropped from a poller on the timer thread.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn start_timer(&self) {
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("kvpool-scheduler".to_string())
            .spawn(move || run_timer(inner));
        match spawned {
            Ok(handle) => {
                debug!(
                    interval_ms = self.inner.config.tick_interval_ms,
                    "scheduler timer started"
                );
                // A replaced handle belongs to a timer that already idled out.
                let _ = self.inner.timer.lock().replace(handle);
            }
            Err(err) => {
                warn!(error = %err, "failed to start scheduler timer");
                self.inner.registry.lock().timer_running = false;
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.inner.registry.lock();
        f.debug_struct("Scheduler")
            .field("pollers", &registry.entries.len())
            .field("cursor", &registry.cursor)
            .field("timer_running", &registry.timer_running)
            .field("spawner", &self.inner.spawner)
            .finish()
    }
}

impl Inner {
    fn tick(&self) -> bool {
        if self.ticking.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ticking = TickFlag(&self.ticking);

        let (poller, generation) = {
            let mut registry = self.registry.lock();
            let len = registry.entries.len();
            if len == 0 {
                return false;
            }
            let idx = registry.cursor % len;
            registry.cursor = (idx + 1) % len;
            let entry = &registry.entries[idx];
            (Arc::clone(&entry.poller), entry.generation)
        };

        let status = match panic::catch_unwind(AssertUnwindSafe(|| poller())) {
            Ok(status) => status,
            Err(_) => {
                error!("poll callback panicked; deregistering it");
                PollStatus::Deregister
            }
        };

        if status == PollStatus::Deregister {
            self.deregister(&poller, generation);
        }
        true
    }

    fn deregister(&self, poller: &PollFn, generation: u64) {
        let mut registry = self.registry.lock();
        let Some(idx) = registry
            .entries
            .iter()
            .position(|entry| same_poller(&entry.poller, poller))
        else {
            return;
        };
        if registry.entries[idx].generation != generation {
            return;
        }

        registry.entries.remove(idx);
        if idx < registry.cursor {
            registry.cursor -= 1;
        }
        if registry.cursor >= registry.entries.len() {
            registry.cursor = 0;
        }
    }
}

/// Clears the reentrancy flag when a tick ends, including by unwinding.
struct TickFlag<'a>(&'a AtomicBool);

impl Drop for TickFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn run_timer(inner: Arc<Inner>) {
    let interval = inner.config.tick_interval();
    loop {
        thread::sleep(interval);
        if inner.stop.load(Ordering::Acquire) {
            break;
        }
        inner.tick();

        let mut registry = inner.registry.lock();
        if registry.entries.is_empty() {
            registry.timer_running = false;
            debug!("scheduler timer idle; stopping");
            return;
        }
    }
    inner.registry.lock().timer_running = false;
    debug!("scheduler timer stopped");
}

/// Identity of a poll callback: the address of its closure data.
fn same_poller(a: &PollFn, b: &PollFn) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
