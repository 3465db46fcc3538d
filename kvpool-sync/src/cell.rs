//! # Atomic Cell
//!
//! Purpose: Hold at most one shared value and swap it without locks.
//!
//! ## Design Principles
//! 1. **Reference Identity**: Compare-and-swap compares pointers, not values.
//! 2. **Lock-Free**: Every operation is a single `ArcSwapOption` primitive.
//! 3. **Unset Is Empty**: `None` is the only "unset" state; there is no error path.

use std::fmt;
use std::sync::Arc;

use arc_swap::{ArcSwapOption, Guard};

/// Single-slot atomic reference holder.
pub struct AtomicCell<T> {
    slot: ArcSwapOption<T>,
}

impl<T> AtomicCell<T> {
    /// Creates an unset cell.
    pub fn new() -> Self {
        AtomicCell {
            slot: ArcSwapOption::empty(),
        }
    }

    /// Creates a cell holding `value`.
    pub fn with_value(value: Arc<T>) -> Self {
        AtomicCell {
            slot: ArcSwapOption::new(Some(value)),
        }
    }

    /// Returns the current value.
    pub fn get(&self) -> Option<Arc<T>> {
        self.slot.load_full()
    }

    /// Returns true when the cell holds a value.
    pub fn is_set(&self) -> bool {
        self.slot.load().is_some()
    }

    /// Replaces the value unconditionally and returns the previous one.
    pub fn set(&self, value: Arc<T>) -> Option<Arc<T>> {
        self.slot.swap(Some(value))
    }

    /// Stores `new` only if the cell currently holds `expected` (by pointer).
    ///
    /// Returns the value held before the call; the swap happened iff that
    /// value is pointer-equal to `expected`.
    pub fn compare_and_swap(&self, new: Option<Arc<T>>, expected: &Option<Arc<T>>) -> Option<Arc<T>> {
        let prior = self.slot.compare_and_swap(expected, new);
        Guard::into_inner(prior)
    }

    /// Stores `value` only if the cell is unset.
    pub fn try_set(&self, value: Arc<T>) -> bool {
        self.compare_and_swap(Some(value), &None).is_none()
    }

    /// Clears the cell only if it still holds `expected`.
    pub fn clear_if(&self, expected: &Arc<T>) -> bool {
        let expected = Some(Arc::clone(expected));
        let prior = self.compare_and_swap(None, &expected);
        same(&prior, &expected)
    }

    /// Unsets the cell and returns what it held.
    pub fn clear(&self) -> Option<Arc<T>> {
        self.slot.swap(None)
    }
}

impl<T> Default for AtomicCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for AtomicCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicCell")
            .field("set", &self.is_set())
            .finish()
    }
}

/// Pointer equality over optional shared values.
pub fn same<T>(a: &Option<Arc<T>>, b: &Option<Arc<T>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn set_get_clear() {
        let cell = AtomicCell::new();
        assert!(cell.get().is_none());
        let first = Arc::new(1);
        assert!(cell.set(Arc::clone(&first)).is_none());
        assert_eq!(cell.get().as_deref(), Some(&1));
        let prior = cell.clear().unwrap();
        assert!(Arc::ptr_eq(&prior, &first));
        assert!(!cell.is_set());
    }

    #[test]
    fn compare_and_swap_uses_identity_not_equality() {
        let held = Arc::new(String::from("a"));
        let lookalike = Arc::new(String::from("a"));
        let cell = AtomicCell::with_value(Arc::clone(&held));

        let prior = cell.compare_and_swap(Some(Arc::new(String::from("b"))), &Some(lookalike));
        assert!(same(&prior, &Some(Arc::clone(&held))));
        assert_eq!(cell.get().as_deref().map(String::as_str), Some("a"));

        let replacement = Arc::new(String::from("c"));
        let prior = cell.compare_and_swap(Some(Arc::clone(&replacement)), &Some(Arc::clone(&held)));
        assert!(same(&prior, &Some(held)));
        assert!(same(&cell.get(), &Some(replacement)));
    }

    #[test]
    fn try_set_only_succeeds_on_empty_cell() {
        let cell = AtomicCell::new();
        assert!(cell.try_set(Arc::new(1)));
        assert!(!cell.try_set(Arc::new(2)));
        assert_eq!(cell.get().as_deref(), Some(&1));
    }

    #[test]
    fn clear_if_ignores_other_values() {
        let mine = Arc::new(1);
        let cell = AtomicCell::with_value(Arc::new(2));
        assert!(!cell.clear_if(&mine));
        assert!(cell.is_set());
        cell.set(Arc::clone(&mine));
        assert!(cell.clear_if(&mine));
        assert!(!cell.is_set());
    }

    #[test]
    fn try_set_has_one_winner_under_contention() {
        let cell = Arc::new(AtomicCell::new());
        let barrier = Arc::new(Barrier::new(16));
        let wins = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..16)
            .map(|id| {
                let cell = Arc::clone(&cell);
                let barrier = Arc::clone(&barrier);
                let wins = Arc::clone(&wins);
                thread::spawn(move || {
                    barrier.wait();
                    if cell.try_set(Arc::new(id)) {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(wins.load(Ordering::SeqCst), 1);
    }
}
