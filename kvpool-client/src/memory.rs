//! # In-Memory Loopback Store
//!
//! Purpose: A `Connector` that serves a tiny command set from process memory,
//! so pools can be exercised without a network. Faults can be injected to
//! drive every failure path of the handle policy.
//!
//! ## Usage
//!
//! - `MemoryConnector::new()` accepts any endpoint; clones share one store.
//! - `refuse_connections`, `fail_next_commands`, `fail_subscribe` and
//!   `kill_sessions` inject faults; `clear_faults` removes the pending ones.
//! - `subscribe_log` records every subscribe attempt for later inspection.
//!
//! ## Design Principles
//!
//! 1. **Strategy Pattern**: Implements `Connector`/`Session` like any real client.
//! 2. **Delivery Outside Locks**: Sinks are cloned out of the channel table
//!    before a message is handed to them, so a sink may call back into the store.
//! 3. **Epoch Kill Switch**: `kill_sessions` bumps an epoch; sessions opened
//!    before it report themselves unusable.
//!
//! ## Commands
//!
//! PING [msg], ECHO msg, GET key, SET key value, DEL key [key ...],
//! PUBLISH channel payload. Anything else is a server error.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ahash::RandomState;
use bytes::Bytes;
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use tracing::trace;

use kvpool_common::{Command, Message, StoreError, StoreResult, Value};

use crate::store::{Connector, MessageSink, Session};

type FastMap<K, V> = HashMap<K, V, RandomState>;

/// One recorded subscribe attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRecord {
    /// Session the attempt was made on.
    pub session: u64,
    pub channel: String,
    /// False when an injected fault rejected the attempt.
    pub ok: bool,
}

#[derive(Debug, Default)]
struct Faults {
    refuse_connections: bool,
    fail_commands: usize,
    fail_subscribe: HashSet<String, RandomState>,
}

struct Listener {
    session: u64,
    sink: MessageSink,
}

#[derive(Default)]
struct Store {
    data: Mutex<FastMap<Bytes, Bytes>>,
    channels: Mutex<FastMap<String, Vec<Listener>>>,
    faults: Mutex<Faults>,
    journal: Mutex<Vec<SubscribeRecord>>,
    epoch: AtomicU64,
    next_session: AtomicU64,
}

impl Store {
    fn drop_listeners(&self, session: u64) {
        let mut channels = self.channels.lock();
        for listeners in channels.values_mut() {
            listeners.retain(|listener| listener.session != session);
        }
        channels.retain(|_, listeners| !listeners.is_empty());
    }

    fn publish(&self, channel: &str, payload: Bytes) -> i64 {
        let sinks: Vec<MessageSink> = self
            .channels
            .lock()
            .get(channel)
            .map(|listeners| listeners.iter().map(|l| Arc::clone(&l.sink)).collect())
            .unwrap_or_default();
        for sink in &sinks {
            sink(Message::new(channel, payload.clone()));
        }
        sinks.len() as i64
    }
}

/// Loopback connector backed by a shared in-memory store.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    store: Arc<Store>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following connect attempt fail (or succeed again).
    pub fn refuse_connections(&self, refuse: bool) {
        self.store.faults.lock().refuse_connections = refuse;
    }

    /// Fails the next `count` commands, on any session, with an I/O error.
    pub fn fail_next_commands(&self, count: usize) {
        self.store.faults.lock().fail_commands = count;
    }

    /// Rejects subscribe attempts for `channel` until faults are cleared.
    pub fn fail_subscribe(&self, channel: impl Into<String>) {
        self.store.faults.lock().fail_subscribe.insert(channel.into());
    }

    /// Removes all pending faults.
    pub fn clear_faults(&self) {
        *self.store.faults.lock() = Faults::default();
    }

    /// Marks every session opened so far unusable and drops their subscriptions.
    pub fn kill_sessions(&self) {
        self.store.epoch.fetch_add(1, Ordering::AcqRel);
        self.store.channels.lock().clear();
    }

    /// Every subscribe attempt in call order.
    pub fn subscribe_log(&self) -> Vec<SubscribeRecord> {
        self.store.journal.lock().clone()
    }

    /// Number of live subscriptions on `channel`.
    pub fn subscribers_of(&self, channel: &str) -> usize {
        self.store
            .channels
            .lock()
            .get(channel)
            .map_or(0, Vec::len)
    }

    /// Sessions opened through this store.
    pub fn sessions_opened(&self) -> u64 {
        self.store.next_session.load(Ordering::Acquire)
    }

    /// Id of the most recently opened session.
    pub fn last_session_id(&self) -> Option<u64> {
        match self.sessions_opened() {
            0 => None,
            n => Some(n),
        }
    }

    /// Publishes directly, bypassing any session.
    pub fn publish(&self, channel: &str, payload: impl Into<Bytes>) -> i64 {
        self.store.publish(channel, payload.into())
    }

    fn open(&self, endpoint: &str) -> StoreResult<MemorySession> {
        if self.store.faults.lock().refuse_connections {
            return Err(StoreError::Connect {
                endpoint: endpoint.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        let id = self.store.next_session.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(session = id, endpoint, "memory session opened");
        Ok(MemorySession {
            id,
            epoch: self.store.epoch.load(Ordering::Acquire),
            closed: AtomicBool::new(false),
            store: Arc::clone(&self.store),
        })
    }
}

impl Connector for MemoryConnector {
    type Session = MemorySession;

    fn connect(&self, endpoint: &str) -> StoreResult<MemorySession> {
        self.open(endpoint)
    }
}

/// Session on a `MemoryConnector`'s store.
pub struct MemorySession {
    id: u64,
    epoch: u64,
    closed: AtomicBool,
    store: Arc<Store>,
}

impl MemorySession {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn ensure_usable(&self) -> StoreResult<()> {
        if self.is_usable() {
            Ok(())
        } else {
            Err(StoreError::Closed)
        }
    }

    fn take_command_fault(&self) -> StoreResult<()> {
        let mut faults = self.store.faults.lock();
        if faults.fail_commands > 0 {
            faults.fail_commands -= 1;
            return Err(StoreError::Io("injected failure".to_string()));
        }
        Ok(())
    }

    fn dispatch(&self, command: &Command) -> StoreResult<Value> {
        let args = command.args();
        if command.is("PING") {
            return Ok(match args.first() {
                Some(message) => Value::Bulk(message.clone()),
                None => Value::Simple(Bytes::from_static(b"PONG")),
            });
        }
        if command.is("ECHO") {
            let [message] = args else {
                return Err(arity(command));
            };
            return Ok(Value::Bulk(message.clone()));
        }
        if command.is("GET") {
            let [key] = args else {
                return Err(arity(command));
            };
            return Ok(self
                .store
                .data
                .lock()
                .get(key)
                .cloned()
                .map_or(Value::Nil, Value::Bulk));
        }
        if command.is("SET") {
            let [key, value] = args else {
                return Err(arity(command));
            };
            self.store.data.lock().insert(key.clone(), value.clone());
            return Ok(Value::Simple(Bytes::from_static(b"OK")));
        }
        if command.is("DEL") {
            if args.is_empty() {
                return Err(arity(command));
            }
            let mut data = self.store.data.lock();
            let removed = args.iter().filter(|key| data.remove(*key).is_some()).count();
            return Ok(Value::Integer(removed as i64));
        }
        if command.is("PUBLISH") {
            let [channel, payload] = args else {
                return Err(arity(command));
            };
            let channel = String::from_utf8_lossy(channel);
            return Ok(Value::Integer(self.store.publish(&channel, payload.clone())));
        }
        Err(StoreError::Server(format!(
            "unknown command '{}'",
            command.name()
        )))
    }
}

impl Session for MemorySession {
    fn is_usable(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
            && self.epoch == self.store.epoch.load(Ordering::Acquire)
    }

    fn execute(&self, command: &Command) -> StoreResult<Value> {
        self.ensure_usable()?;
        self.take_command_fault()?;
        self.dispatch(command)
    }

    fn subscribe(&self, channel: &str, sink: MessageSink) -> StoreResult<()> {
        self.ensure_usable()?;
        let refused = self.store.faults.lock().fail_subscribe.contains(channel);
        self.store.journal.lock().push(SubscribeRecord {
            session: self.id,
            channel: channel.to_string(),
            ok: !refused,
        });
        if refused {
            return Err(StoreError::Server(format!("subscribe to '{channel}' refused")));
        }

        let mut channels = self.store.channels.lock();
        let listeners = channels.entry(channel.to_string()).or_default();
        match listeners.iter_mut().find(|l| l.session == self.id) {
            Some(existing) => existing.sink = sink,
            None => listeners.push(Listener {
                session: self.id,
                sink,
            }),
        }
        Ok(())
    }

    fn unsubscribe(&self, channel: &str) -> StoreResult<()> {
        self.ensure_usable()?;
        let mut channels = self.store.channels.lock();
        if let Some(listeners) = channels.get_mut(channel) {
            listeners.retain(|l| l.session != self.id);
            if listeners.is_empty() {
                channels.remove(channel);
            }
        }
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.store.drop_listeners(self.id);
            trace!(session = self.id, "memory session closed");
        }
    }
}

fn arity(command: &Command) -> StoreError {
    StoreError::Server(format!(
        "wrong number of arguments for '{}'",
        command.name()
    ))
}
