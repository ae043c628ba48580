//! Write barriers.
//!
//! Two barriers run around every reference store:
//!
//! - the **pre-write (SATB) barrier** logs the overwritten reference while
//!   concurrent marking runs, so everything reachable at the start of marking
//!   is found even if the mutator unlinks it;
//! - the **post-write (card) barrier** marks the card of a non-young object
//!   that now points into another region and queues it for remembered-set
//!   digestion.
//!
//! Both append to per-mutator buffers; only a full card buffer touches shared
//! state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_queue::{ArrayQueue, SegQueue};
use parking_lot::{Condvar, Mutex};

use crate::heap::card_table::CardIndex;
use crate::heap::pool::RegionPool;
use crate::object::ObjectRef;

/// Capacity of a mutator's card buffer.
pub const CARD_BUFFER_SIZE: usize = 256;

/// SATB entries a mutator keeps before handing its buffer to the collector.
pub const SATB_BUFFER_SIZE: usize = 1024;

/// Per-mutator barrier buffers.
pub struct BarrierBuffers {
    satb: Mutex<Vec<ObjectRef>>,
    cards: ArrayQueue<CardIndex>,
}

impl Default for BarrierBuffers {
    fn default() -> Self {
        Self::new()
    }
}

impl BarrierBuffers {
    /// Creates empty buffers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            satb: Mutex::new(Vec::new()),
            cards: ArrayQueue::new(CARD_BUFFER_SIZE),
        }
    }

    /// Number of logged SATB entries.
    #[must_use]
    pub fn satb_len(&self) -> usize {
        self.satb.lock().len()
    }

    /// Number of buffered cards.
    #[must_use]
    pub fn card_len(&self) -> usize {
        self.cards.len()
    }

    /// Takes the logged SATB entries.
    pub fn take_satb(&self) -> Vec<ObjectRef> {
        std::mem::take(&mut *self.satb.lock())
    }
}

/// Barrier state shared by all mutators of a heap.
pub struct G1BarrierSet {
    pool: Arc<RegionPool>,
    concurrent_marking: AtomicBool,
    shared_cards: SegQueue<CardIndex>,
    satb_buffers: Mutex<Vec<Vec<ObjectRef>>>,
    min_cards_to_notify: usize,
    pending_lock: Mutex<()>,
    pending: Condvar,
}

impl G1BarrierSet {
    /// Creates the barrier set for `pool`.
    #[must_use]
    pub fn new(pool: Arc<RegionPool>, min_cards_to_notify: usize) -> Self {
        Self {
            pool,
            concurrent_marking: AtomicBool::new(false),
            shared_cards: SegQueue::new(),
            satb_buffers: Mutex::new(Vec::new()),
            min_cards_to_notify: min_cards_to_notify.max(1),
            pending_lock: Mutex::new(()),
            pending: Condvar::new(),
        }
    }

    /// Whether the SATB barrier is active.
    #[must_use]
    pub fn is_concurrent_marking(&self) -> bool {
        self.concurrent_marking.load(Ordering::Acquire)
    }

    /// Turns the SATB barrier on or off. Only called during a pause.
    pub fn set_concurrent_marking(&self, enabled: bool) {
        self.concurrent_marking.store(enabled, Ordering::Release);
    }

    /// Logs `old`, the value about to be overwritten.
    pub fn pre_write_barrier(&self, buffers: &BarrierBuffers, old: Option<ObjectRef>) {
        let Some(old) = old else { return };
        if !self.is_concurrent_marking() {
            return;
        }
        let mut satb = buffers.satb.lock();
        satb.push(old);
        if satb.len() >= SATB_BUFFER_SIZE {
            let full = std::mem::take(&mut *satb);
            drop(satb);
            self.satb_buffers.lock().push(full);
        }
    }

    /// Records that `obj` now references `value`.
    ///
    /// Returns `true` if the store marked a card.
    pub fn post_write_barrier(
        &self,
        buffers: &BarrierBuffers,
        obj: ObjectRef,
        value: Option<ObjectRef>,
    ) -> bool {
        let Some(value) = value else { return false };
        if !self.pool.contains(value.addr()) {
            return false;
        }
        let rs = self.pool.region_size();
        if obj.addr() / rs == value.addr() / rs {
            let same = match (
                self.pool.get_region(obj.addr()),
                self.pool.get_region(value.addr()),
            ) {
                (Some(a), Some(b)) => a.id() == b.id(),
                _ => true,
            };
            if same {
                return false;
            }
        }
        let table = self.pool.card_table();
        let card = table.card_of(obj.addr());
        if table.is_young(card) || !table.mark(card) {
            return false;
        }
        if let Err(card) = buffers.cards.push(card) {
            self.flush_cards(buffers);
            self.shared_cards.push(card);
        }
        true
    }

    /// Moves every buffered card of `buffers` to the shared queue.
    pub fn flush_cards(&self, buffers: &BarrierBuffers) {
        while let Some(card) = buffers.cards.pop() {
            self.shared_cards.push(card);
        }
        if self.shared_cards.len() >= self.min_cards_to_notify {
            let _guard = self.pending_lock.lock();
            self.pending.notify_all();
        }
    }

    /// Hands the SATB entries of `buffers` to the collector.
    pub fn flush_satb(&self, buffers: &BarrierBuffers) {
        let satb = buffers.take_satb();
        if !satb.is_empty() {
            self.satb_buffers.lock().push(satb);
        }
    }

    /// Flushes everything a terminating mutator holds.
    pub fn on_mutator_exit(&self, buffers: &BarrierBuffers) {
        self.flush_satb(buffers);
        self.flush_cards(buffers);
    }

    /// Takes every SATB buffer handed over so far.
    pub fn take_satb_buffers(&self) -> Vec<Vec<ObjectRef>> {
        std::mem::take(&mut *self.satb_buffers.lock())
    }

    /// Drops collected SATB buffers.
    pub fn discard_satb_buffers(&self) {
        self.satb_buffers.lock().clear();
    }

    /// Pops one queued card.
    pub fn pop_card(&self) -> Option<CardIndex> {
        self.shared_cards.pop()
    }

    /// Queues a card again.
    pub fn push_card(&self, card: CardIndex) {
        self.shared_cards.push(card);
    }

    /// Number of cards in the shared queue.
    #[must_use]
    pub fn pending_cards(&self) -> usize {
        self.shared_cards.len()
    }

    /// Blocks until cards are pending, `stop` returns `true`, or `timeout` elapses.
    pub fn wait_for_cards(&self, timeout: std::time::Duration, stop: impl Fn() -> bool) {
        let mut guard = self.pending_lock.lock();
        if self.shared_cards.len() >= self.min_cards_to_notify || stop() {
            return;
        }
        let _ = self.pending.wait_for(&mut guard, timeout);
    }

    /// Wakes a thread blocked in [`wait_for_cards`](Self::wait_for_cards).
    pub fn notify_all(&self) {
        let _guard = self.pending_lock.lock();
        self.pending.notify_all();
    }
}
