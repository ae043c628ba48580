//! Scoped handles: root slots owned by a mutator.
//!
//! Objects may move whenever a collection runs, so a raw [`ObjectRef`] is
//! only valid until the mutator's next allocation or safepoint. A [`Handle`]
//! is a slot the collector scans as a root and rewrites when its object
//! moves; read it again after anything that may collect.
//!
//! Handles are grouped in scopes. Dropping a [`HandleScope`] releases every
//! handle created in it, and the borrow checker keeps handles from outliving
//! their scope, following the V8 `HandleScope` pattern.
//!
//! ```ignore
//! let scope = mutator.handle_scope();
//! let list = scope.handle(Some(mutator.allocate(1, 0, AllocationKind::Movable)?));
//! let item = mutator.allocate(0, 64, AllocationKind::Movable)?; // may move `list`
//! mutator.write_ref(list.get().unwrap(), 0, Some(item));
//! ```

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::mutator::{Mutator, MutatorState};
use crate::object::ObjectRef;

/// A region of handle slots, released on drop.
pub struct HandleScope<'m> {
    state: &'m MutatorState,
    prev_len: usize,
    _marker: PhantomData<*mut ()>,
}

impl<'m> HandleScope<'m> {
    pub(crate) fn new(mutator: &'m Mutator) -> Self {
        let state = mutator.state();
        let prev_len = state.handles.lock().len();
        Self {
            state,
            prev_len,
            _marker: PhantomData,
        }
    }

    /// Creates a handle holding `obj`.
    pub fn handle<'s>(&'s self, obj: Option<ObjectRef>) -> Handle<'s> {
        let mut handles = self.state.handles.lock();
        let index = handles.len();
        handles.push(AtomicUsize::new(obj.map_or(0, ObjectRef::addr)));
        Handle {
            state: self.state,
            index,
            _marker: PhantomData,
        }
    }

    /// Number of handles this scope currently owns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.handles.lock().len().saturating_sub(self.prev_len)
    }

    /// Whether the scope owns no handle.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for HandleScope<'_> {
    fn drop(&mut self) {
        let mut handles = self.state.handles.lock();
        debug_assert!(handles.len() >= self.prev_len, "handle scopes dropped out of order");
        handles.truncate(self.prev_len);
    }
}

/// A root slot. Copying a handle copies the reference to the slot, not the slot.
#[derive(Clone, Copy)]
pub struct Handle<'s> {
    state: &'s MutatorState,
    index: usize,
    _marker: PhantomData<*mut ()>,
}

impl Handle<'_> {
    /// The object currently held, at its current address.
    #[must_use]
    pub fn get(&self) -> Option<ObjectRef> {
        let handles = self.state.handles.lock();
        let addr = handles.get(self.index)?.load(Ordering::Acquire);
        // SAFETY: handle slots hold zero or addresses of live objects.
        unsafe { ObjectRef::from_addr(addr) }
    }

    /// Replaces the object held.
    pub fn set(&self, obj: Option<ObjectRef>) {
        let handles = self.state.handles.lock();
        if let Some(slot) = handles.get(self.index) {
            slot.store(obj.map_or(0, ObjectRef::addr), Ordering::Release);
        }
    }

    /// Whether the handle holds no object.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.get().is_none()
    }
}

impl std::fmt::Debug for Handle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Handle").field(&self.get()).finish()
    }
}

/// A scope that can hand one handle to its parent before it closes.
pub struct EscapeableHandleScope<'m> {
    escape_index: usize,
    escaped: Cell<bool>,
    inner: HandleScope<'m>,
}

impl<'m> EscapeableHandleScope<'m> {
    pub(crate) fn new(mutator: &'m Mutator) -> Self {
        let state = mutator.state();
        // The escape slot belongs to the enclosing scope.
        let escape_index = {
            let mut handles = state.handles.lock();
            handles.push(AtomicUsize::new(0));
            handles.len() - 1
        };
        Self {
            escape_index,
            escaped: Cell::new(false),
            inner: HandleScope::new(mutator),
        }
    }

    /// Creates a handle in the inner scope.
    pub fn handle<'s>(&'s self, obj: Option<ObjectRef>) -> Handle<'s> {
        self.inner.handle(obj)
    }

    /// Copies `handle` into a slot of `parent` that survives this scope.
    ///
    /// # Panics
    ///
    /// Panics if called twice.
    pub fn escape<'p>(&self, parent: &'p HandleScope<'_>, handle: Handle<'_>) -> Handle<'p> {
        assert!(
            !self.escaped.replace(true),
            "EscapeableHandleScope::escape() can only be called once"
        );
        debug_assert!(std::ptr::eq(parent.state, self.inner.state));
        let escaped = Handle {
            state: parent.state,
            index: self.escape_index,
            _marker: PhantomData,
        };
        escaped.set(handle.get());
        escaped
    }
}
