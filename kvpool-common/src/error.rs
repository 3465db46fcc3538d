//! # Error Types
//!
//! Purpose: Name every failure the pool can observe at the store boundary,
//! so the guarded-call helper can return an explicit outcome instead of
//! unwinding through callers.
//!
//! ## Design Principles
//! 1. **Closed Taxonomy**: Store failures are one enum; callers match, not downcast.
//! 2. **Absorb at the Boundary**: Handles convert these into liveness changes.
//! 3. **Cheap to Clone**: Messages are owned strings so errors can be logged and kept.

use thiserror::Error;

/// Result type for calls into the store-client collaborator.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type returned by a handle's guarded-call helper.
pub type CallResult<T> = Result<T, CallFailure>;

/// Failures reported by the store-client collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// A session could not be opened for the endpoint.
    #[error("failed to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },
    /// Network or transport failure on an open session.
    #[error("io error: {0}")]
    Io(String),
    /// The store rejected the command.
    #[error("server error: {0}")]
    Server(String),
    /// The session was closed before or during the call.
    #[error("session closed")]
    Closed,
    /// The collaborator panicked while servicing the call.
    #[error("store client panicked: {0}")]
    Panicked(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

/// Why a guarded call on a handle produced no value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallFailure {
    /// The handle had no live session; the call was skipped.
    #[error("handle is dead")]
    Dead,
    /// The call reached the store and failed; the handle is now dead.
    #[error(transparent)]
    Remote(#[from] StoreError),
}

/// Errors surfaced while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The document could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    /// The document is not valid JSON for the config schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    /// A field holds a value the pool cannot run with.
    #[error("invalid config: {0}")]
    Invalid(String),
}
