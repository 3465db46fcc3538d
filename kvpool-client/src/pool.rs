//! # Handle Pool
//!
//! Purpose: Keep long-lived store handles keyed by (endpoint, idle timeout)
//! so callers reuse sessions instead of reconnecting.
//!
//! ## Design Principles
//! 1. **Shared Lease, Not Exclusive Checkout**: A registered handle that
//!    matches a key is handed out without being removed; several callers may
//!    hold it at once.
//! 2. **Lazy Sweep**: Every lookup evicts dead and idle-expired entries, so no
//!    sweeper thread is needed.
//! 3. **Minimal Locking**: One mutex covers scan, evict and append; sessions of
//!    evicted handles are closed after it is released.
//! 4. **Release on Drop**: Dropping a `Lease` offers a live handle back to the registry.
//!
//! ## Handle States
//!
//! ```text
//! Unregistered --release (alive)--> Available --dead / expired--> evicted
//!      |                                ^   |
//!      +--release (dead)--> dropped     +---+ acquire (shared)
//! ```

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use kvpool_common::{PoolKey, StoreResult};

use crate::metrics::{PoolMetrics, PoolStats};

/// What the pool needs to know about a handle.
pub trait Resource: Send + Sync + 'static {
    /// Key the handle was opened for.
    fn key(&self) -> &PoolKey;
    /// Returns true while the handle holds a usable session.
    fn is_alive(&self) -> bool;
    /// Returns true once the handle's idle timer ran out.
    fn is_expired(&self) -> bool;
    /// Releases the underlying session; the handle is dead afterwards.
    fn close(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Eviction {
    Dead,
    Expired,
}

struct PoolShared<H> {
    label: &'static str,
    registry: Mutex<Vec<Arc<H>>>,
    metrics: Arc<PoolMetrics>,
}

impl<H: Resource> PoolShared<H> {
    fn release(&self, handle: Arc<H>) {
        if !handle.is_alive() {
            self.metrics.record_discard();
            return;
        }
        let mut registry = self.registry.lock();
        if !registry.iter().any(|entry| Arc::ptr_eq(entry, &handle)) {
            registry.push(handle);
            self.metrics.record_release();
        }
    }
}

/// Keyed registry of reusable handles.
pub struct PooledResource<H> {
    shared: Arc<PoolShared<H>>,
}

impl<H: Resource> PooledResource<H> {
    /// Creates an empty pool; `label` names it in logs.
    pub fn new(label: &'static str) -> Self {
        Self::with_metrics(label, Arc::new(PoolMetrics::new()))
    }

    /// Creates an empty pool that records into `metrics`.
    pub fn with_metrics(label: &'static str, metrics: Arc<PoolMetrics>) -> Self {
        PooledResource {
            shared: Arc::new(PoolShared {
                label,
                registry: Mutex::new(Vec::new()),
                metrics,
            }),
        }
    }

    /// Returns a handle for `key`.
    ///
    /// Sweeps the registry, then hands out the first live match. On a miss
    /// `open` builds a new, still unregistered handle; if that fails the
    /// failure is logged and the `sentinel` handle is returned instead.
    pub fn acquire<O, S>(&self, key: &PoolKey, open: O, sentinel: S) -> Lease<H>
    where
        O: FnOnce(&PoolKey) -> StoreResult<H>,
        S: FnOnce(&PoolKey) -> H,
    {
        let metrics = &self.shared.metrics;
        metrics.record_acquire();

        if let Some(handle) = self.sweep_and_find(key) {
            metrics.record_reuse();
            return self.lease(handle);
        }

        match open(key) {
            Ok(handle) => {
                metrics.record_open();
                self.lease(Arc::new(handle))
            }
            Err(err) => {
                metrics.record_connect_failure();
                warn!(
                    pool = self.shared.label,
                    endpoint = %key.endpoint,
                    error = %err,
                    "failed to open store session; handing out a dead handle"
                );
                self.lease(Arc::new(sentinel(key)))
            }
        }
    }

    /// Offers `handle` back to the registry; dead handles are dropped.
    pub fn release(&self, handle: Arc<H>) {
        self.shared.release(handle);
    }

    /// Wraps `handle` in a lease that releases into this pool.
    pub fn lease(&self, handle: Arc<H>) -> Lease<H> {
        Lease {
            handle,
            home: Arc::downgrade(&self.shared),
        }
    }

    /// Evicts dead and expired entries; returns how many were evicted.
    pub fn sweep(&self) -> usize {
        let (_, evicted) = self.scan(None);
        let count = evicted.len();
        self.close_evicted(evicted);
        count
    }

    /// Number of registered handles.
    pub fn len(&self) -> usize {
        self.shared.registry.lock().len()
    }

    /// Returns true when no handle is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the registry in registration order.
    pub fn handles(&self) -> Vec<Arc<H>> {
        self.shared.registry.lock().clone()
    }

    /// Closes and forgets every registered handle.
    pub fn clear(&self) {
        let drained: Vec<_> = std::mem::take(&mut *self.shared.registry.lock());
        for handle in drained {
            handle.close();
        }
    }

    /// Counter snapshot for this pool.
    pub fn stats(&self) -> PoolStats {
        self.shared.metrics.snapshot()
    }

    /// Counters this pool records into.
    pub fn metrics(&self) -> &Arc<PoolMetrics> {
        &self.shared.metrics
    }

    fn sweep_and_find(&self, key: &PoolKey) -> Option<Arc<H>> {
        let (found, evicted) = self.scan(Some(key));
        self.close_evicted(evicted);
        found
    }

    fn scan(&self, key: Option<&PoolKey>) -> (Option<Arc<H>>, Vec<(Arc<H>, Eviction)>) {
        let mut found = None;
        let mut evicted = Vec::new();
        let mut registry = self.shared.registry.lock();
        registry.retain(|handle| {
            if !handle.is_alive() {
                evicted.push((Arc::clone(handle), Eviction::Dead));
                return false;
            }
            if handle.is_expired() {
                evicted.push((Arc::clone(handle), Eviction::Expired));
                return false;
            }
            if found.is_none() && key.is_some_and(|key| handle.key() == key) {
                found = Some(Arc::clone(handle));
            }
            true
        });
        (found, evicted)
    }

    fn close_evicted(&self, evicted: Vec<(Arc<H>, Eviction)>) {
        for (handle, reason) in evicted {
            match reason {
                Eviction::Dead => self.shared.metrics.record_evicted_dead(),
                Eviction::Expired => self.shared.metrics.record_evicted_expired(),
            }
            debug!(
                pool = self.shared.label,
                endpoint = %handle.key().endpoint,
                ?reason,
                "evicted pooled handle"
            );
            handle.close();
        }
    }
}

impl<H> Clone for PooledResource<H> {
    fn clone(&self) -> Self {
        PooledResource {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<H> fmt::Debug for PooledResource<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledResource")
            .field("label", &self.shared.label)
            .field("registered", &self.shared.registry.lock().len())
            .finish()
    }
}

/// Shared lease on a pooled handle.
///
/// Dropping the lease is the handle's disposal: a live handle goes back to
/// the registry, a dead one is dropped. Cloning a lease shares the handle.
pub struct Lease<H: Resource> {
    handle: Arc<H>,
    home: Weak<PoolShared<H>>,
}

impl<H: Resource> Lease<H> {
    /// The leased handle.
    pub fn handle(&self) -> &Arc<H> {
        &self.handle
    }

    /// Returns true when both leases refer to the same handle.
    pub fn same_handle(&self, other: &Lease<H>) -> bool {
        Arc::ptr_eq(&self.handle, &other.handle)
    }

    /// Releases the handle to its pool now.
    pub fn dispose(self) {
        drop(self);
    }

    /// A lease on `handle` that releases into the same pool as `self`.
    pub(crate) fn sibling(&self, handle: Arc<H>) -> Lease<H> {
        Lease {
            handle,
            home: Weak::clone(&self.home),
        }
    }
}

impl<H: Resource> Deref for Lease<H> {
    type Target = H;

    fn deref(&self) -> &H {
        &self.handle
    }
}

impl<H: Resource> Clone for Lease<H> {
    fn clone(&self) -> Self {
        self.sibling(Arc::clone(&self.handle))
    }
}

impl<H: Resource> Drop for Lease<H> {
    fn drop(&mut self) {
        if let Some(shared) = self.home.upgrade() {
            shared.release(Arc::clone(&self.handle));
        }
    }
}

impl<H: Resource + fmt::Debug> fmt::Debug for Lease<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Lease").field(&self.handle).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use kvpool_common::StoreError;

    struct Fake {
        key: PoolKey,
        alive: AtomicBool,
        expired: AtomicBool,
    }

    impl Fake {
        fn new(key: &PoolKey) -> Self {
            Fake {
                key: key.clone(),
                alive: AtomicBool::new(true),
                expired: AtomicBool::new(false),
            }
        }

        fn dead(key: &PoolKey) -> Self {
            let fake = Fake::new(key);
            fake.alive.store(false, Ordering::SeqCst);
            fake
        }
    }

    impl Resource for Fake {
        fn key(&self) -> &PoolKey {
            &self.key
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn is_expired(&self) -> bool {
            self.expired.load(Ordering::SeqCst)
        }

        fn close(&self) {
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    fn key(endpoint: &str) -> PoolKey {
        PoolKey::new(endpoint, Duration::from_secs(60))
    }

    fn acquire(pool: &PooledResource<Fake>, key: &PoolKey) -> Lease<Fake> {
        pool.acquire(key, |key| Ok(Fake::new(key)), Fake::dead)
    }

    #[test]
    fn new_handle_registers_on_release() {
        let pool = PooledResource::new("test");
        let lease = acquire(&pool, &key("a"));
        assert!(pool.is_empty());
        drop(lease);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn matching_handle_is_shared_not_removed() {
        let pool = PooledResource::new("test");
        acquire(&pool, &key("a")).dispose();

        let first = acquire(&pool, &key("a"));
        let second = acquire(&pool, &key("a"));
        assert!(first.same_handle(&second));
        assert_eq!(pool.len(), 1);

        drop(first);
        drop(second);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.stats().reused, 2);
    }

    #[test]
    fn different_key_opens_new_handle() {
        let pool = PooledResource::new("test");
        acquire(&pool, &key("a")).dispose();
        let other = acquire(&pool, &key("b"));
        assert_eq!(other.key(), &key("b"));
        drop(other);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn dead_handle_is_not_registered() {
        let pool = PooledResource::new("test");
        let lease = acquire(&pool, &key("a"));
        lease.close();
        drop(lease);
        assert!(pool.is_empty());
        assert_eq!(pool.stats().discarded, 1);
    }

    #[test]
    fn sweep_on_lookup_evicts_for_any_key() {
        let pool = PooledResource::new("test");
        acquire(&pool, &key("a")).dispose();
        acquire(&pool, &key("b")).dispose();
        let stale = pool.handles()[0].clone();
        stale.expired.store(true, Ordering::SeqCst);

        let lease = acquire(&pool, &key("b"));
        assert_eq!(pool.len(), 1);
        assert!(!stale.is_alive());
        assert_eq!(pool.stats().evicted_expired, 1);
        drop(lease);
    }

    #[test]
    fn connect_failure_yields_sentinel() {
        let pool: PooledResource<Fake> = PooledResource::new("test");
        let lease = pool.acquire(
            &key("a"),
            |key| {
                Err(StoreError::Connect {
                    endpoint: key.endpoint.clone(),
                    reason: "refused".to_string(),
                })
            },
            Fake::dead,
        );
        assert!(!lease.is_alive());
        drop(lease);
        assert!(pool.is_empty());
        assert_eq!(pool.stats().connect_failures, 1);
    }

    #[test]
    fn clear_closes_registered_handles() {
        let pool = PooledResource::new("test");
        acquire(&pool, &key("a")).dispose();
        let handle = pool.handles()[0].clone();
        pool.clear();
        assert!(pool.is_empty());
        assert!(!handle.is_alive());
    }

    #[test]
    fn lease_outliving_pool_is_harmless() {
        let pool = PooledResource::new("test");
        let lease = acquire(&pool, &key("a"));
        drop(pool);
        assert!(lease.is_alive());
        drop(lease);
    }
}
