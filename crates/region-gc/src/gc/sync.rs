//! # Lock Ordering Discipline for Deadlock Prevention
//!
//! All collector locks are acquired in increasing level:
//!
//! | Level | Lock            | Holder                                         |
//! |-------|-----------------|------------------------------------------------|
//! | 1     | `GcRunning`     | one collection cycle at a time                 |
//! | 2     | `Rendezvous`    | mutators (shared) and stop-the-world (exclusive) |
//! | 3     | `UpdateRemset`  | card digestion and its suspension by the GC    |
//! | 4     | `Allocator`     | region allocators and their queues             |
//! | 5     | `Pool`          | region pool slot sets                          |
//!
//! Remembered-set and per-region locks are leaves: nothing is acquired while
//! holding them. So are the collector's registries (mutators, their handles
//! and TLABs, root providers, listeners, the new-object buffer).
//!
//! ## Forbidden Patterns
//!
//! - A mutator never waits for a collection while inside the rendezvous.
//! - The GC never enters the rendezvous while holding the update-remset lock.
//!
//! ## Validation
//!
//! In debug builds every [`LockGuard`] checks that its level is not below the
//! highest level already held by the thread and panics otherwise.
//!
//! ```ignore
//! let _order = LockGuard::new(LockOrder::Allocator);
//! let queue = self.old_queue.lock();
//! // Pool (level 5) may be taken here, Rendezvous (level 2) may not.
//! ```

#[cfg(debug_assertions)]
use std::cell::RefCell;

/// Lock order tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LockOrder {
    /// Serializes collection cycles.
    GcRunning = 1,
    /// Safepoint rendezvous.
    Rendezvous = 2,
    /// Update-remset processing.
    UpdateRemset = 3,
    /// Region allocator state.
    Allocator = 4,
    /// Region pool state.
    Pool = 5,
}

impl LockOrder {
    /// Level of this lock.
    #[must_use]
    pub const fn level(self) -> u8 {
        self as u8
    }
}

#[cfg(debug_assertions)]
thread_local!(static HELD: RefCell<Vec<LockOrder>> = const { RefCell::new(Vec::new()) });

/// RAII witness of a lock acquisition, validated in debug builds.
///
/// Create it right before taking the lock so it is dropped right after the
/// lock guard.
#[must_use = "LockGuard must be held for the duration of the critical section"]
pub struct LockGuard {
    #[cfg(debug_assertions)]
    tag: LockOrder,
}

impl LockGuard {
    /// Validates and records acquisition of `tag`.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if a lock of a higher level is already held.
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(tag: LockOrder) -> Self {
        #[cfg(debug_assertions)]
        {
            let _ = HELD.try_with(|held| {
                let mut held = held.borrow_mut();
                if let Some(top) = held.iter().max() {
                    assert!(
                        tag >= *top,
                        "Lock ordering violation: {tag:?} (level {}) acquired while holding {top:?} (level {})",
                        tag.level(),
                        top.level()
                    );
                }
                held.push(tag);
            });
            Self { tag }
        }
        #[cfg(not(debug_assertions))]
        {
            let _ = tag;
            Self {}
        }
    }
}

#[cfg(debug_assertions)]
impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = HELD.try_with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|t| *t == self.tag) {
                held.remove(pos);
            }
        });
    }
}

/// Highest lock level held by the current thread (debug builds only).
#[cfg(debug_assertions)]
#[must_use]
pub fn max_held_level() -> Option<u8> {
    HELD.try_with(|held| held.borrow().iter().max().map(|t| t.level()))
        .ok()
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::{LockGuard, LockOrder};

    #[test]
    fn test_increasing_order_is_allowed() {
        let _a = LockGuard::new(LockOrder::GcRunning);
        let _b = LockGuard::new(LockOrder::Rendezvous);
        let _c = LockGuard::new(LockOrder::Pool);
        #[cfg(debug_assertions)]
        assert_eq!(super::max_held_level(), Some(5));
    }

    #[test]
    fn test_same_level_is_allowed() {
        let _a = LockGuard::new(LockOrder::Allocator);
        let _b = LockGuard::new(LockOrder::Allocator);
    }

    #[test]
    fn test_release_restores_level() {
        {
            let _a = LockGuard::new(LockOrder::Pool);
        }
        let _b = LockGuard::new(LockOrder::GcRunning);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Lock ordering violation")]
    fn test_downgrade_panics() {
        let _a = LockGuard::new(LockOrder::Pool);
        let _b = LockGuard::new(LockOrder::Rendezvous);
    }
}
