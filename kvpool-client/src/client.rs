//! # Store Pool
//!
//! Purpose: The entry point callers use: one connector, one registry of
//! command handles and one registry of subscriber handles.
//!
//! ## Usage
//!
//! ```text
//! let pool = StorePool::new(MemoryConnector::new());
//! let conn = pool.acquire_connection("127.0.0.1:6379", Duration::from_secs(60));
//! conn.set("k", "v");
//! drop(conn); // back to the registry while alive
//! ```
//!
//! ## Design Principles
//! 1. **Facade Pattern**: Hides registry, connector and scheduler wiring
//!    behind acquire calls.
//! 2. **Never Throws**: Acquisition always yields a lease; an unreachable
//!    endpoint yields a dead handle the caller can detect with `is_alive`.
//! 3. **Separate Registries**: Command and subscriber sessions never mix,
//!    even for equal keys.

use std::sync::Arc;
use std::time::Duration;

use kvpool_common::{ConfigError, KvPoolConfig, PoolKey};
use kvpool_sync::Scheduler;

use crate::handle::ClientHandle;
use crate::metrics::{PoolMetrics, PoolStats};
use crate::pool::{Lease, PooledResource};
use crate::store::Connector;
use crate::subscriber::SubscriptionHandle;

/// Lease on a pooled command handle.
pub type ConnectionLease<C> = Lease<ClientHandle<C>>;

/// Lease on a pooled subscriber handle.
pub type SubscriberLease<C> = Lease<SubscriptionHandle<C>>;

/// Counters for both registries of a `StorePool`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorePoolStats {
    pub connections: PoolStats,
    pub subscribers: PoolStats,
}

/// Pool of store handles over one connector.
pub struct StorePool<C: Connector> {
    connector: Arc<C>,
    config: KvPoolConfig,
    scheduler: Arc<Scheduler>,
    connections: PooledResource<ClientHandle<C>>,
    subscribers: PooledResource<SubscriptionHandle<C>>,
}

impl<C: Connector> StorePool<C> {
    /// Creates a pool with default settings on the global scheduler.
    pub fn new(connector: C) -> Self {
        Self::with_scheduler(connector, KvPoolConfig::default(), Scheduler::global())
    }

    /// Creates a pool from a validated config.
    ///
    /// The scheduler settings seed the global scheduler if it does not exist yet.
    pub fn from_config(connector: C, config: KvPoolConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let scheduler = Scheduler::init_global(config.scheduler.clone());
        Ok(Self::with_scheduler(connector, config, scheduler))
    }

    /// Creates a pool whose subscriber inboxes run on `scheduler`.
    pub fn with_scheduler(connector: C, config: KvPoolConfig, scheduler: Arc<Scheduler>) -> Self {
        StorePool {
            connector: Arc::new(connector),
            config,
            scheduler,
            connections: PooledResource::with_metrics("connections", Arc::new(PoolMetrics::new())),
            subscribers: PooledResource::with_metrics("subscribers", Arc::new(PoolMetrics::new())),
        }
    }

    /// Lease on a command handle for `endpoint` with the given idle timeout.
    pub fn acquire_connection(&self, endpoint: &str, idle_timeout: Duration) -> ConnectionLease<C> {
        self.acquire_connection_for(&PoolKey::new(endpoint, idle_timeout))
    }

    pub fn acquire_connection_for(&self, key: &PoolKey) -> ConnectionLease<C> {
        let metrics = Arc::clone(self.connections.metrics());
        self.connections.acquire(
            key,
            |key| ClientHandle::open(&self.connector, key.clone(), Arc::clone(&metrics)),
            |key| ClientHandle::sentinel(key.clone(), Arc::clone(&metrics)),
        )
    }

    /// Lease on a subscriber handle for `endpoint` with the given idle timeout.
    pub fn acquire_subscriber(&self, endpoint: &str, idle_timeout: Duration) -> SubscriberLease<C> {
        self.acquire_subscriber_for(&PoolKey::new(endpoint, idle_timeout))
    }

    pub fn acquire_subscriber_for(&self, key: &PoolKey) -> SubscriberLease<C> {
        let metrics = Arc::clone(self.subscribers.metrics());
        let poll = self.config.gate.poll_interval();
        self.subscribers.acquire(
            key,
            |key| {
                SubscriptionHandle::open(
                    &self.connector,
                    key.clone(),
                    Arc::clone(&metrics),
                    &self.scheduler,
                    poll,
                )
            },
            |key| {
                SubscriptionHandle::sentinel(
                    &self.connector,
                    key.clone(),
                    Arc::clone(&metrics),
                    &self.scheduler,
                    poll,
                )
            },
        )
    }

    /// Command handle for the configured endpoint.
    pub fn connection(&self) -> ConnectionLease<C> {
        self.acquire_connection_for(&self.config.pool.key())
    }

    /// Subscriber handle for the configured endpoint.
    pub fn subscriber(&self) -> SubscriberLease<C> {
        self.acquire_subscriber_for(&self.config.pool.key())
    }

    /// Counters for both registries.
    pub fn stats(&self) -> StorePoolStats {
        StorePoolStats {
            connections: self.connections.stats(),
            subscribers: self.subscribers.stats(),
        }
    }

    /// Registered command handles.
    pub fn idle_connections(&self) -> usize {
        self.connections.len()
    }

    /// Registered subscriber handles.
    pub fn idle_subscribers(&self) -> usize {
        self.subscribers.len()
    }

    /// Closes every registered handle.
    ///
    /// Leases sharing a registered handle see it dead from now on; handles
    /// opened but not yet released are untouched.
    pub fn clear(&self) {
        self.connections.clear();
        self.subscribers.clear();
    }

    pub fn config(&self) -> &KvPoolConfig {
        &self.config
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }
}

impl<C: Connector> Drop for StorePool<C> {
    fn drop(&mut self) {
        self.clear();
    }
}
