//! # Mutual Exclusion Gate
//!
//! Purpose: A single-owner advisory lock that can be polled from blocking
//! threads and from async tasks alike.
//!
//! ## Design Principles
//! 1. **One Marker**: Holding the gate means owning the claim stored in an
//!    `AtomicCell`; acquisition is a single compare-and-swap.
//! 2. **RAII Release**: Every successful enter yields a guard that releases
//!    on drop, including during unwinding.
//! 3. **Cooperative Waits**: Async variants sleep on the tokio timer between
//!    polls instead of parking a worker thread.
//!
//! ## States
//!
//! ```text
//! Free --try_enter--> Held --exit / guard drop--> Free
//! ```
//!
//! ## Forced Exit
//!
//! `exit` frees the gate whoever holds it. A guard only ever releases its own
//! claim: once a forced `exit` has let a new owner in, dropping the old guard
//! leaves the new owner holding the gate.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cell::AtomicCell;

/// Marker stored while the gate is held.
#[derive(Debug)]
struct Claim {
    since: Instant,
}

/// Single-owner advisory lock.
#[derive(Default)]
pub struct Gate {
    owner: AtomicCell<Claim>,
}

impl Gate {
    /// Creates a free gate.
    pub fn new() -> Self {
        Gate {
            owner: AtomicCell::new(),
        }
    }

    /// Returns true while some owner holds the gate.
    pub fn is_held(&self) -> bool {
        self.owner.is_set()
    }

    /// How long the current owner has held the gate.
    pub fn held_for(&self) -> Option<Duration> {
        self.owner.get().map(|claim| claim.since.elapsed())
    }

    /// Claims the gate if it is free.
    pub fn try_enter(&self) -> Option<GateGuard<'_>> {
        self.claim().map(|claim| GateGuard { gate: self, claim })
    }

    /// Claims the gate if it is free, returning a guard that owns the gate.
    ///
    /// Use this when the guard has to move to another thread.
    pub fn try_enter_owned(self: &Arc<Self>) -> Option<OwnedGateGuard> {
        self.claim().map(|claim| OwnedGateGuard {
            gate: Arc::clone(self),
            claim,
        })
    }

    /// Blocks the calling thread, polling every `poll`, until the gate is claimed.
    pub fn enter(&self, poll: Duration) -> GateGuard<'_> {
        loop {
            if let Some(guard) = self.try_enter() {
                return guard;
            }
            pause(poll);
        }
    }

    /// Suspends the calling task, polling every `poll`, until the gate is claimed.
    pub async fn enter_async(&self, poll: Duration) -> GateGuard<'_> {
        loop {
            if let Some(guard) = self.try_enter() {
                return guard;
            }
            pause_async(poll).await;
        }
    }

    /// Releases the gate regardless of who holds it. Exiting a free gate is a no-op.
    pub fn exit(&self) {
        self.owner.clear();
    }

    /// Blocks until the gate is free without claiming it.
    pub fn wait_exit(&self, poll: Duration) {
        while self.is_held() {
            pause(poll);
        }
    }

    /// Suspends until the gate is free without claiming it.
    pub async fn wait_exit_async(&self, poll: Duration) {
        while self.is_held() {
            pause_async(poll).await;
        }
    }

    fn claim(&self) -> Option<Arc<Claim>> {
        let claim = Arc::new(Claim {
            since: Instant::now(),
        });
        if self.owner.try_set(Arc::clone(&claim)) {
            Some(claim)
        } else {
            None
        }
    }

    fn release(&self, claim: &Arc<Claim>) {
        // A forced `exit` may already have handed the gate to someone else.
        self.owner.clear_if(claim);
    }
}

impl fmt::Debug for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gate").field("held", &self.is_held()).finish()
    }
}

/// Borrowed release token for a held gate.
#[must_use = "the gate is released as soon as the guard is dropped"]
pub struct GateGuard<'a> {
    gate: &'a Gate,
    claim: Arc<Claim>,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.release(&self.claim);
    }
}

/// Owned release token for a held gate.
#[must_use = "the gate is released as soon as the guard is dropped"]
pub struct OwnedGateGuard {
    gate: Arc<Gate>,
    claim: Arc<Claim>,
}

impl Drop for OwnedGateGuard {
    fn drop(&mut self) {
        self.gate.release(&self.claim);
    }
}

fn pause(poll: Duration) {
    if poll.is_zero() {
        std::thread::yield_now();
    } else {
        std::thread::sleep(poll);
    }
}

async fn pause_async(poll: Duration) {
    if poll.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(poll).await;
    }
}
