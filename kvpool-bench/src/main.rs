//! # Pool Benchmark Harness
//!
//! Purpose: Repeatable throughput numbers for the hot paths of the pool:
//! acquisition with reuse, guarded command calls, and deferred list draining.
//!
//! ## Usage
//!
//! `kvpool-bench [keys] [ops] [threads] [value_size]`; set `RUST_LOG=debug`
//! to see pool and scheduler events.
//!
//! ## Design Principles
//! 1. **Deterministic Workload**: Use a fixed PRNG seed for stable comparisons.
//! 2. **Allocation Control**: Pre-build keys/values to keep setup costs off the hot path.
//! 3. **Store-less**: Runs against `MemoryConnector` so numbers measure the
//!    pool, not a network.

use std::env;
use std::hint::black_box;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use bytes::Bytes;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kvpool_client::{MemoryConnector, StorePool};
use kvpool_common::{KvPoolConfig, SchedulerConfig};
use kvpool_sync::{ProcessFn, Scheduler, SnapshotList};

const DEFAULT_KEY_COUNT: usize = 1 << 12;
const DEFAULT_OP_COUNT: usize = 200_000;
const DEFAULT_THREADS: usize = 4;
const DEFAULT_VALUE_SIZE: usize = 128;
const ENDPOINT: &str = "memory";

struct BenchConfig {
    key_count: usize,
    key_mask: usize,
    op_count: usize,
    threads: usize,
    value_size: usize,
}

impl BenchConfig {
    fn from_args() -> Self {
        let mut args = env::args().skip(1);
        let key_count = parse_usize(args.next(), DEFAULT_KEY_COUNT)
            .max(1)
            .next_power_of_two();
        let op_count = parse_usize(args.next(), DEFAULT_OP_COUNT);
        let threads = parse_usize(args.next(), DEFAULT_THREADS).max(1);
        let value_size = parse_usize(args.next(), DEFAULT_VALUE_SIZE);

        BenchConfig {
            key_count,
            key_mask: key_count - 1,
            op_count,
            threads,
            value_size,
        }
    }
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value.and_then(|raw| raw.parse().ok()).unwrap_or(fallback)
}

/// Tiny deterministic PRNG; keeps the workload reproducible.
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    #[inline]
    fn next_index(&mut self, mask: usize) -> usize {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        (x as usize) & mask
    }
}

fn build_keys(count: usize) -> Vec<Bytes> {
    (0..count).map(|i| Bytes::from(format!("key:{i:08}"))).collect()
}

fn report(label: &str, ops: usize, elapsed: Duration) {
    let secs = elapsed.as_secs_f64();
    let ops_per_sec = (ops as f64) / secs;
    let nanos_per_op = (secs * 1e9) / (ops as f64);
    println!(
        "{label}: {ops} ops in {secs:.3}s ({ops_per_sec:.0} ops/s, {nanos_per_op:.1} ns/op)"
    );
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    if let Err(err) = run() {
        eprintln!("kvpool-bench failed: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let config = BenchConfig::from_args();
    let mut pool_config = KvPoolConfig::default();
    pool_config.pool.endpoint = ENDPOINT.to_string();
    let pool = StorePool::from_config(MemoryConnector::new(), pool_config)
        .context("invalid pool configuration")?;

    let keys = build_keys(config.key_count);
    let value = Bytes::from(vec![0xA5u8; config.value_size]);
    {
        let conn = pool.connection();
        for key in &keys {
            if !conn.set(key.clone(), value.clone()) {
                bail!("preload failed; handle is dead");
            }
        }
    }

    info!(
        keys = config.key_count,
        ops = config.op_count,
        threads = config.threads,
        value_size = config.value_size,
        "starting benchmark"
    );

    bench_acquire_get(&pool, &config, &keys);
    bench_shared_acquire(&pool, &config, &keys)?;
    bench_drain(&config)?;

    let stats = pool.stats().connections;
    println!(
        "pool: acquired={} reused={} opened={} evicted={}",
        stats.acquired,
        stats.reused,
        stats.opened,
        stats.evicted_dead + stats.evicted_expired
    );
    Ok(())
}

fn bench_acquire_get(pool: &StorePool<MemoryConnector>, config: &BenchConfig, keys: &[Bytes]) {
    let mut rng = XorShift64::new(0x1234_5678_9ABC_DEF0);
    let start = Instant::now();
    for _ in 0..config.op_count {
        let idx = rng.next_index(config.key_mask);
        let conn = pool.connection();
        black_box(conn.get(keys[idx].clone()));
    }
    report("ACQUIRE+GET", config.op_count, start.elapsed());
}

fn bench_shared_acquire(
    pool: &StorePool<MemoryConnector>,
    config: &BenchConfig,
    keys: &[Bytes],
) -> anyhow::Result<()> {
    let per_thread = config.op_count / config.threads;
    let barrier = Barrier::new(config.threads);
    let start = Instant::now();
    thread::scope(|scope| {
        for worker in 0..config.threads {
            let barrier = &barrier;
            scope.spawn(move || {
                let mut rng = XorShift64::new(0x0FED_CBA9_8765_4321 ^ worker as u64);
                barrier.wait();
                for _ in 0..per_thread {
                    let idx = rng.next_index(config.key_mask);
                    black_box(pool.connection().get(keys[idx].clone()));
                }
            });
        }
    });
    report("SHARED ACQUIRE+GET", per_thread * config.threads, start.elapsed());

    if pool.idle_connections() != 1 {
        bail!(
            "expected one shared handle, found {}",
            pool.idle_connections()
        );
    }
    Ok(())
}

fn bench_drain(config: &BenchConfig) -> anyhow::Result<()> {
    let scheduler = Arc::new(Scheduler::new(SchedulerConfig::default()));
    let list = SnapshotList::with_options(scheduler, false);
    let processed = Arc::new(AtomicUsize::new(0));
    let process: ProcessFn<usize> = {
        let processed = Arc::clone(&processed);
        Arc::new(move |n| {
            black_box(n);
            processed.fetch_add(1, Ordering::Relaxed);
        })
    };

    let start = Instant::now();
    for n in 0..config.op_count {
        list.add_with(n, Arc::clone(&process));
    }
    list.wait_idle(Duration::from_millis(1));
    report("DRAIN", config.op_count, start.elapsed());
    list.stop_draining();

    let done = processed.load(Ordering::Relaxed);
    if done != config.op_count {
        bail!("drain processed {done} of {} items", config.op_count);
    }
    Ok(())
}
