//! # kvpool Concurrency Primitives
//!
//! Purpose: The small set of lock-free and lock-light building blocks the
//! handle pool is made of.
//!
//! ## Design Principles
//! 1. **Leaves First**: `AtomicCell` underpins `Gate`, which underpins `SnapshotList`.
//! 2. **Shared Timer**: One `Scheduler` services every list with pending work.
//! 3. **Readers Never Lock**: Published snapshots and cell loads are wait-free.
//! 4. **Explicit Singletons**: The process-wide scheduler is reached through
//!    `Scheduler::global()`; everything else is constructed by its owner.

mod cell;
mod gate;
mod scheduler;
mod snapshot;

pub use cell::{same, AtomicCell};
pub use gate::{Gate, GateGuard, OwnedGateGuard};
pub use scheduler::{DrainSpawner, PollFn, PollStatus, Scheduler};
pub use snapshot::{ProcessFn, Snapshot, SnapshotList};
