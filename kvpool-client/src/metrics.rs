//! # Pool Metrics
//!
//! Provide lightweight counters describing how a handle pool is being used:
//! reuse rate, connect failures and why handles left the registry.
//!
//! ## Design Principles
//! 1. **Accumulator Pattern**: Use atomic counters to aggregate events cheaply.
//! 2. **Zero-Cost Access**: Expose snapshots as plain structs without heap work.
//! 3. **Relaxed Ordering**: Counters are independent; no cross-field ordering is promised.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of a pool's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total acquisitions.
    pub acquired: u64,
    /// Acquisitions served by an already-registered handle.
    pub reused: u64,
    /// New sessions opened on a registry miss.
    pub opened: u64,
    /// Registry misses whose connect attempt failed.
    pub connect_failures: u64,
    /// Handles evicted because their session was gone.
    pub evicted_dead: u64,
    /// Handles evicted because their idle timer ran out.
    pub evicted_expired: u64,
    /// Live handles registered on release.
    pub released: u64,
    /// Dead handles dropped on release.
    pub discarded: u64,
    /// Handles invalidated after a failed store call.
    pub invalidated: u64,
}

/// Thread-safe counters for one pool.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    acquired: AtomicU64,
    reused: AtomicU64,
    opened: AtomicU64,
    connect_failures: AtomicU64,
    evicted_dead: AtomicU64,
    evicted_expired: AtomicU64,
    released: AtomicU64,
    discarded: AtomicU64,
    invalidated: AtomicU64,
}

impl PoolMetrics {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_acquire(&self) {
        self.acquired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reuse(&self) {
        self.reused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_open(&self) {
        self.opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evicted_dead(&self) {
        self.evicted_dead.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evicted_expired(&self) {
        self.evicted_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_release(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discard(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidate(&self) {
        self.invalidated.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            acquired: self.acquired.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            opened: self.opened.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            evicted_dead: self.evicted_dead.load(Ordering::Relaxed),
            evicted_expired: self.evicted_expired.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            invalidated: self.invalidated.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_events() {
        let metrics = PoolMetrics::new();
        metrics.record_acquire();
        metrics.record_acquire();
        metrics.record_reuse();
        metrics.record_evicted_expired();

        let stats = metrics.snapshot();
        assert_eq!(stats.acquired, 2);
        assert_eq!(stats.reused, 1);
        assert_eq!(stats.evicted_expired, 1);
        assert_eq!(stats.opened, 0);
    }
}
