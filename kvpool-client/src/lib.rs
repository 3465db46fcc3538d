//! # kvpool Client Pool
//!
//! Purpose: Pool long-lived store sessions, both command and subscriber,
//! keyed by endpoint and idle timeout, and absorb store failures at the
//! handle boundary.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse sessions instead of reconnecting per call.
//! 2. **Shared Lease**: A found handle is handed out without removal; several
//!    callers may use it at once.
//! 3. **Fail Fast, Heal on Acquire**: A failed call kills its handle; the next
//!    acquisition evicts it and opens a replacement.
//! 4. **Pluggable Client**: The store client is a `Connector`; `MemoryConnector`
//!    serves tests and store-less embedders.

mod client;
mod handle;
mod memory;
mod metrics;
mod pool;
mod store;
mod subscriber;

pub use client::{ConnectionLease, StorePool, StorePoolStats, SubscriberLease};
pub use handle::ClientHandle;
pub use memory::{MemoryConnector, MemorySession, SubscribeRecord};
pub use metrics::{PoolMetrics, PoolStats};
pub use pool::{Lease, PooledResource, Resource};
pub use store::{Connector, MessageSink, Session};
pub use subscriber::{MessageCallback, Subscription, SubscriptionHandle};
