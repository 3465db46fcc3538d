//! # Store Client Capability
//!
//! Purpose: The narrow surface the pool needs from a store client library:
//! open a session, ask whether it is usable, run a command, manage channel
//! subscriptions, close it.
//!
//! ## Design Principles
//! 1. **Strategy Pattern**: Any client library plugs in by implementing
//!    `Connector` and `Session`; the pool never sees the wire.
//! 2. **Errors as Values**: Every fallible call returns `StoreResult`.
//! 3. **Shared Sessions**: Sessions are `Send + Sync`; several callers may
//!    issue commands on one session concurrently.

use std::sync::Arc;

use kvpool_common::{Command, Message, StoreResult, Value};

/// Receives messages for one subscribed channel on one session.
pub type MessageSink = Arc<dyn Fn(Message) + Send + Sync>;

/// One open session to the store.
pub trait Session: Send + Sync + 'static {
    /// Returns true while the session can still carry commands.
    fn is_usable(&self) -> bool;

    /// Issues one command and waits for its reply.
    fn execute(&self, command: &Command) -> StoreResult<Value>;

    /// Routes messages published on `channel` to `sink`.
    ///
    /// Subscribing the same channel again replaces the previous sink.
    fn subscribe(&self, channel: &str, sink: MessageSink) -> StoreResult<()>;

    /// Stops routing messages for `channel`.
    fn unsubscribe(&self, channel: &str) -> StoreResult<()>;

    /// Releases the session. Further calls fail with `StoreError::Closed`.
    fn close(&self);
}

/// Factory for sessions.
pub trait Connector: Send + Sync + 'static {
    type Session: Session;

    /// Opens a command session to `endpoint`.
    fn connect(&self, endpoint: &str) -> StoreResult<Self::Session>;

    /// Opens a session used for channel subscriptions.
    fn connect_subscriber(&self, endpoint: &str) -> StoreResult<Self::Session> {
        self.connect(endpoint)
    }
}
