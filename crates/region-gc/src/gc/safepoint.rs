//! Stop-the-world rendezvous.
//!
//! Mutators are either *running* (attached, may touch the heap) or *parked*
//! (detached, e.g. blocked in a collection request or outside any
//! [`MutatorScope`](crate::MutatorScope)). A pause sets the stop flag and
//! waits until the running count drops to zero; running mutators notice the
//! flag at their next safepoint poll, detach, and block until the pause ends.
//!
//! ```text
//! mutator:  attach ─ work ─ poll ─┐            ┌─ attach ─ work
//!                                 └─ detach ── wait(resumed)
//! gc:                 safepoint_begin ── wait(running == 0) ── pause ── drop guard
//! ```

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

use super::sync::{LockGuard, LockOrder};

#[derive(Default)]
struct RendezvousState {
    running: usize,
    stop_requested: bool,
}

/// Coordinates pauses with the mutators of one heap.
#[derive(Default)]
pub struct Rendezvous {
    state: Mutex<RendezvousState>,
    stopped: Condvar,
    resumed: Condvar,
    stop_flag: AtomicBool,
}

impl Rendezvous {
    /// Creates a rendezvous without mutators.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the calling mutator as running, waiting out a pause in progress.
    pub fn attach(&self) {
        let mut state = self.state.lock();
        while state.stop_requested {
            self.resumed.wait(&mut state);
        }
        state.running += 1;
    }

    /// Marks the calling mutator as parked.
    pub fn detach(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.running > 0, "detach without attach");
        state.running = state.running.saturating_sub(1);
        if state.running == 0 && state.stop_requested {
            self.stopped.notify_all();
        }
    }

    /// Cheap poll for mutators.
    #[inline]
    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.stop_flag.load(Ordering::Acquire)
    }

    /// Number of running mutators.
    #[must_use]
    pub fn running(&self) -> usize {
        self.state.lock().running
    }

    /// Stops every mutator; they stay parked until the guard is dropped.
    ///
    /// Must not be called by a thread that is itself attached.
    pub fn safepoint_begin(&self) -> SafepointGuard<'_> {
        let order = LockGuard::new(LockOrder::Rendezvous);
        let mut state = self.state.lock();
        debug_assert!(!state.stop_requested, "nested safepoint");
        state.stop_requested = true;
        self.stop_flag.store(true, Ordering::Release);
        while state.running > 0 {
            self.stopped.wait(&mut state);
        }
        drop(state);

        #[cfg(feature = "tracing")]
        tracing::trace!("safepoint_begin");

        SafepointGuard {
            rendezvous: self,
            _order: order,
        }
    }

    fn safepoint_end(&self) {
        let mut state = self.state.lock();
        state.stop_requested = false;
        self.stop_flag.store(false, Ordering::Release);
        drop(state);
        self.resumed.notify_all();

        #[cfg(feature = "tracing")]
        tracing::trace!("safepoint_end");
    }
}

/// An active pause. Mutators resume when it is dropped.
#[must_use = "mutators resume as soon as the guard is dropped"]
pub struct SafepointGuard<'a> {
    rendezvous: &'a Rendezvous,
    _order: LockGuard,
}

impl Drop for SafepointGuard<'_> {
    fn drop(&mut self) {
        self.rendezvous.safepoint_end();
    }
}
