//! # Client Handle
//!
//! Purpose: Wrap one store session with the bookkeeping the pool needs and
//! absorb every store failure at this boundary.
//!
//! ## Design Principles
//! 1. **Fail Fast, Heal Later**: A failed call invalidates the handle; the
//!    next acquisition for the key evicts it and opens a fresh session.
//! 2. **One Guard**: Every remote operation goes through `call`, which turns
//!    errors (and collaborator panics) into a `CallResult` and never unwinds.
//! 3. **No Resurrection**: Once the session slot is cleared it is never refilled.
//! 4. **Defaults at the Edge**: `call_or_default` and the typed helpers map a
//!    failure to the reply type's default.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use kvpool_common::{CallFailure, CallResult, Command, PoolKey, StoreError, StoreResult, Value};
use kvpool_sync::AtomicCell;

use crate::metrics::PoolMetrics;
use crate::pool::Resource;
use crate::store::{Connector, Session};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Elapsed-time counter behind idle expiry.
#[derive(Debug)]
pub(crate) struct IdleTimer {
    since: Mutex<Instant>,
}

impl IdleTimer {
    pub(crate) fn new() -> Self {
        IdleTimer {
            since: Mutex::new(Instant::now()),
        }
    }

    pub(crate) fn reset(&self) {
        *self.since.lock() = Instant::now();
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.since.lock().elapsed()
    }

    /// A zero timeout never expires.
    pub(crate) fn is_expired(&self, timeout: Duration) -> bool {
        !timeout.is_zero() && self.elapsed() > timeout
    }
}

/// Pooled wrapper around one store session.
///
/// A handle handed out by the pool is a shared lease: other callers asking
/// for the same key may be using it at the same time.
pub struct ClientHandle<C: Connector> {
    id: u64,
    key: PoolKey,
    session: AtomicCell<C::Session>,
    idle: IdleTimer,
    sentinel: bool,
    metrics: Arc<PoolMetrics>,
}

impl<C: Connector> ClientHandle<C> {
    /// Opens a command session for `key`.
    pub(crate) fn open(connector: &C, key: PoolKey, metrics: Arc<PoolMetrics>) -> StoreResult<Self> {
        let session = connector.connect(&key.endpoint)?;
        Ok(Self::with_session(key, session, metrics))
    }

    pub(crate) fn with_session(key: PoolKey, session: C::Session, metrics: Arc<PoolMetrics>) -> Self {
        ClientHandle {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            key,
            session: AtomicCell::with_value(Arc::new(session)),
            idle: IdleTimer::new(),
            sentinel: false,
            metrics,
        }
    }

    /// The "no connection available" handle: never alive, every call is a no-op.
    pub fn sentinel(key: PoolKey, metrics: Arc<PoolMetrics>) -> Self {
        ClientHandle {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            key,
            session: AtomicCell::new(),
            idle: IdleTimer::new(),
            sentinel: true,
            metrics,
        }
    }

    /// Process-unique handle id, for logs and identity checks.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn is_sentinel(&self) -> bool {
        self.sentinel
    }

    /// Returns true while the handle holds a usable session.
    ///
    /// Only looks. An unusable session stays in its slot until the next call
    /// or the pool's eviction closes it, so this is safe under the registry lock.
    pub fn is_alive(&self) -> bool {
        !self.sentinel && self.session.get().is_some_and(|session| session.is_usable())
    }

    /// Time since creation or the last `reset_idle`.
    pub fn idle_for(&self) -> Duration {
        self.idle.elapsed()
    }

    /// Returns true once the idle timer exceeds the key's timeout.
    pub fn is_expired(&self) -> bool {
        self.idle.is_expired(self.key.idle_timeout)
    }

    /// Restarts the idle timer.
    pub fn reset_idle(&self) {
        self.idle.reset();
    }

    /// Drops and closes the session. The handle is dead from here on.
    pub fn invalidate(&self) {
        if let Some(session) = self.session.clear() {
            self.metrics.record_invalidate();
            session.close();
            debug!(handle = self.id, endpoint = %self.key.endpoint, "handle invalidated");
        }
    }

    /// Runs `f` against the session under the failure policy.
    ///
    /// A dead handle skips `f` and yields `CallFailure::Dead`. An error or
    /// panic from `f` is logged with `op`, invalidates the handle and yields
    /// `CallFailure::Remote`.
    pub fn call<T, F>(&self, op: &'static str, f: F) -> CallResult<T>
    where
        F: FnOnce(&C::Session) -> StoreResult<T>,
    {
        let Some(session) = self.live_session() else {
            return Err(CallFailure::Dead);
        };

        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| f(&*session))) {
            Ok(outcome) => outcome,
            Err(payload) => Err(StoreError::Panicked(panic_message(payload.as_ref()))),
        };

        outcome.map_err(|err| {
            warn!(
                op,
                handle = self.id,
                endpoint = %self.key.endpoint,
                error = %err,
                "store call failed; invalidating handle"
            );
            // A concurrent reset may already have swapped in a fresh session.
            if self.session.clear_if(&session) {
                self.metrics.record_invalidate();
                session.close();
            }
            CallFailure::Remote(err)
        })
    }

    /// `call`, mapping any failure to `T::default()`.
    pub fn call_or_default<T, F>(&self, op: &'static str, f: F) -> T
    where
        T: Default,
        F: FnOnce(&C::Session) -> StoreResult<T>,
    {
        self.call(op, f).unwrap_or_default()
    }

    /// Issues `command`, reporting why no reply was produced.
    pub fn try_execute(&self, command: &Command) -> CallResult<Value> {
        self.call("execute", |session| session.execute(command))
    }

    /// Issues `command`; failures yield `Value::Nil`.
    pub fn execute(&self, command: &Command) -> Value {
        self.call_or_default("execute", |session| session.execute(command))
    }

    /// GET; missing keys and failures yield `None`.
    pub fn get(&self, key: impl Into<Bytes>) -> Option<Bytes> {
        let command = Command::new("GET").arg(key);
        self.call_or_default("get", |session| {
            Ok(match session.execute(&command)? {
                Value::Bulk(data) => Some(data),
                _ => None,
            })
        })
    }

    /// SET without expiry; returns true on an OK reply.
    pub fn set(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> bool {
        let command = Command::new("SET").arg(key).arg(value);
        self.call_or_default("set", |session| {
            Ok(matches!(session.execute(&command)?, Value::Simple(_)))
        })
    }

    /// DEL; returns how many keys were removed.
    pub fn del(&self, key: impl Into<Bytes>) -> i64 {
        let command = Command::new("DEL").arg(key);
        self.call_or_default("del", |session| {
            Ok(session.execute(&command)?.as_integer().unwrap_or_default())
        })
    }

    /// PUBLISH; returns how many subscribers received the message.
    pub fn publish(&self, channel: &str, payload: impl Into<Bytes>) -> i64 {
        let command = Command::new("PUBLISH")
            .arg(Bytes::copy_from_slice(channel.as_bytes()))
            .arg(payload);
        self.call_or_default("publish", |session| {
            Ok(session.execute(&command)?.as_integer().unwrap_or_default())
        })
    }

    /// PING; returns true on any reply.
    pub fn ping(&self) -> bool {
        let command = Command::new("PING");
        self.call_or_default("ping", |session| {
            session.execute(&command).map(|_| true)
        })
    }

    pub(crate) fn metrics(&self) -> &Arc<PoolMetrics> {
        &self.metrics
    }

    /// The session, if the handle is alive; an unusable one is cleared and closed.
    pub(crate) fn live_session(&self) -> Option<Arc<C::Session>> {
        if self.sentinel {
            return None;
        }
        let session = self.session.get()?;
        if session.is_usable() {
            return Some(session);
        }
        if self.session.clear_if(&session) {
            self.metrics.record_invalidate();
            session.close();
            debug!(handle = self.id, endpoint = %self.key.endpoint, "session no longer usable");
        }
        None
    }

    /// Swaps `current` for `fresh`; fails if the handle changed or died meanwhile.
    pub(crate) fn replace_session(&self, current: &Arc<C::Session>, fresh: Arc<C::Session>) -> bool {
        let expected = Some(Arc::clone(current));
        let prior = self.session.compare_and_swap(Some(fresh), &expected);
        kvpool_sync::same(&prior, &expected)
    }
}

impl<C: Connector> Resource for ClientHandle<C> {
    fn key(&self) -> &PoolKey {
        &self.key
    }

    fn is_alive(&self) -> bool {
        ClientHandle::is_alive(self)
    }

    fn is_expired(&self) -> bool {
        ClientHandle::is_expired(self)
    }

    fn close(&self) {
        self.invalidate();
    }
}

impl<C: Connector> Drop for ClientHandle<C> {
    fn drop(&mut self) {
        if let Some(session) = self.session.clear() {
            session.close();
        }
    }
}

impl<C: Connector> fmt::Debug for ClientHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("sentinel", &self.sentinel)
            .field("has_session", &self.session.is_set())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
