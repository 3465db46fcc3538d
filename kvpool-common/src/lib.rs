// kvpool-common - Shared types, errors and configuration for kvpool
//
// This crate defines the vocabulary spoken between the concurrency
// primitives, the handle pool and the store-client collaborator.

pub mod config;
pub mod error;
pub mod types;

// Re-export for convenience
pub use config::*;
pub use error::*;
pub use types::*;
