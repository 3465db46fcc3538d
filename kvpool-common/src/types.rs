//! # Shared Type Definitions
//!
//! Core value types exchanged between the handle pool and the store-client
//! collaborator.
//!
//! ## Design Principles
//!
//! 1. **Opaque Commands**: A `Command` is a name plus binary-safe arguments;
//!    the pool never interprets it, it only forwards it.
//! 2. **Defaultable Replies**: `Value` has a `Nil` default so a failed or
//!    skipped call can always produce a result of the expected shape.
//! 3. **Shared Buffers**: Arguments and payloads are `Bytes`, so cloning a
//!    command or fanning a message out to several callbacks never copies.
//! 4. **Value Keys**: `PoolKey` compares by value; two acquisitions with equal
//!    keys may share one handle.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;

/// Identity under which pooled handles are shared.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    /// Endpoint descriptor handed to the connector, e.g. "127.0.0.1:6379".
    pub endpoint: String,
    /// Idle timeout after which a pooled handle is evicted.
    ///
    /// `Duration::ZERO` disables idle expiry for the handle.
    pub idle_timeout: Duration,
}

impl PoolKey {
    /// Creates a key from an endpoint and idle timeout.
    pub fn new(endpoint: impl Into<String>, idle_timeout: Duration) -> Self {
        PoolKey {
            endpoint: endpoint.into(),
            idle_timeout,
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (idle {:?})", self.endpoint, self.idle_timeout)
    }
}

/// A store command: a name and its binary-safe arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: String,
    args: Vec<Bytes>,
}

impl Command {
    /// Starts a command with no arguments.
    pub fn new(name: impl Into<String>) -> Self {
        Command {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<Bytes>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Command name as given by the caller.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arguments in call order.
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Returns true when the name matches `other`, ignoring ASCII case.
    pub fn is(&self, other: &str) -> bool {
        self.name.eq_ignore_ascii_case(other)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for arg in &self.args {
            write!(f, " {}", String::from_utf8_lossy(arg))?;
        }
        Ok(())
    }
}

/// Reply value returned by the store.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Value {
    /// No value (missing key, or the default for a skipped call).
    #[default]
    Nil,
    /// Status replies such as OK or PONG.
    Simple(Bytes),
    /// Integer replies.
    Integer(i64),
    /// Binary-safe string replies.
    Bulk(Bytes),
    /// Multi-value replies.
    Array(Vec<Value>),
}

impl Value {
    /// Returns true for `Value::Nil`.
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Returns the payload of a status or bulk reply.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Simple(data) | Value::Bulk(data) => Some(data),
            _ => None,
        }
    }

    /// Returns the payload of an integer reply.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(value) => Some(*value),
            _ => None,
        }
    }
}

/// A message delivered on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Channel the message was published on.
    pub channel: String,
    /// Message body.
    pub payload: Bytes,
}

impl Message {
    /// Creates a message for `channel`.
    pub fn new(channel: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Message {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_keys_compare_equal() {
        let a = PoolKey::new("127.0.0.1:6379", Duration::from_millis(100));
        let b = PoolKey::new(String::from("127.0.0.1:6379"), Duration::from_millis(100));
        let c = PoolKey::new("127.0.0.1:6379", Duration::from_millis(200));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn command_builder_keeps_argument_order() {
        let cmd = Command::new("SET").arg("key").arg(Bytes::from_static(b"value"));
        assert!(cmd.is("set"));
        assert_eq!(cmd.args(), &[Bytes::from("key"), Bytes::from("value")]);
        assert_eq!(cmd.to_string(), "SET key value");
    }

    #[test]
    fn value_defaults_to_nil() {
        assert!(Value::default().is_nil());
        assert_eq!(Value::Integer(3).as_integer(), Some(3));
        assert_eq!(Value::Bulk(Bytes::from("x")).as_bytes(), Some(&Bytes::from("x")));
        assert_eq!(Value::Nil.as_bytes(), None);
    }
}
