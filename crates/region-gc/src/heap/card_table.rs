//! Card table over the reserved heap range.
//!
//! The heap is divided into [`CARD_SIZE`] byte cards with one state byte each.
//! The post-write barrier marks the card holding the start of a modified
//! object; the update-remset worker turns marked cards into remembered-set
//! entries. Cards of eden regions are kept in the [`CardState::Young`] state so
//! the barrier can skip stores into young objects with a single load.

use std::sync::atomic::{AtomicU8, Ordering};

/// Size of a card in bytes.
pub const CARD_SIZE: usize = 512;

/// Card state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardState {
    /// No pending cross-region store.
    Clear = 0,
    /// A store happened; the card waits for remembered-set digestion.
    Marked = 1,
    /// The card was already scanned during the current pause.
    Processed = 2,
    /// The card belongs to an eden region.
    Young = 3,
}

impl CardState {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Marked,
            2 => Self::Processed,
            3 => Self::Young,
            _ => Self::Clear,
        }
    }
}

/// Index of a card in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CardIndex(usize);

impl CardIndex {
    /// Creates a card index.
    #[must_use]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// The raw index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Card table covering `[base, base + size)`.
pub struct CardTable {
    base: usize,
    size: usize,
    cards: Box<[AtomicU8]>,
}

impl CardTable {
    /// Create a card table for a heap range.
    #[must_use]
    pub fn new(base: usize, size: usize) -> Self {
        let count = size.div_ceil(CARD_SIZE);
        let cards = (0..count)
            .map(|_| AtomicU8::new(CardState::Clear as u8))
            .collect();
        Self { base, size, cards }
    }

    /// Number of cards.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cards.len()
    }

    /// Whether the table covers nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    /// Whether `addr` lies in the covered range.
    #[must_use]
    pub const fn covers(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.size
    }

    /// Card holding `addr`.
    #[must_use]
    pub fn card_of(&self, addr: usize) -> CardIndex {
        debug_assert!(self.covers(addr), "address {addr:#x} outside card table");
        CardIndex((addr - self.base) / CARD_SIZE)
    }

    /// Memory range `[start, end)` covered by `card`.
    #[must_use]
    pub fn memory_range(&self, card: CardIndex) -> (usize, usize) {
        let start = self.base + card.0 * CARD_SIZE;
        (start, (start + CARD_SIZE).min(self.base + self.size))
    }

    /// Current state of `card`.
    #[must_use]
    pub fn state(&self, card: CardIndex) -> CardState {
        CardState::from_u8(self.cards[card.0].load(Ordering::Acquire))
    }

    /// Whether `card` is clear.
    #[must_use]
    pub fn is_clear(&self, card: CardIndex) -> bool {
        self.state(card) == CardState::Clear
    }

    /// Whether `card` belongs to an eden region.
    #[must_use]
    pub fn is_young(&self, card: CardIndex) -> bool {
        self.state(card) == CardState::Young
    }

    /// Moves a clear card to [`CardState::Marked`].
    ///
    /// Returns `true` only for the caller that performed the transition, so a
    /// card is queued for digestion at most once until it is cleared again.
    pub fn mark(&self, card: CardIndex) -> bool {
        self.cards[card.0]
            .compare_exchange(
                CardState::Clear as u8,
                CardState::Marked as u8,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Moves a marked card back to clear before it is scanned, so stores made
    /// during the scan mark it again.
    ///
    /// Returns `false` if the card was not marked.
    pub fn clear_card(&self, card: CardIndex) -> bool {
        self.cards[card.0]
            .compare_exchange(
                CardState::Marked as u8,
                CardState::Clear as u8,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Marks `card` as scanned in the current pause. Young cards are left alone.
    ///
    /// Returns `false` if the card was already processed.
    pub fn set_processed(&self, card: CardIndex) -> bool {
        let slot = &self.cards[card.0];
        let mut current = slot.load(Ordering::Acquire);
        loop {
            if current == CardState::Processed as u8 || current == CardState::Young as u8 {
                return false;
            }
            match slot.compare_exchange_weak(
                current,
                CardState::Processed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Resets every non-young card to clear.
    pub fn clear_all(&self) {
        for card in &*self.cards {
            if card.load(Ordering::Relaxed) != CardState::Young as u8 {
                card.store(CardState::Clear as u8, Ordering::Relaxed);
            }
        }
    }

    /// Sets every card in `[begin, end)` to `state`.
    pub fn set_range(&self, begin: usize, end: usize, state: CardState) {
        if begin >= end {
            return;
        }
        let first = self.card_of(begin).0;
        let last = self.card_of(end - 1).0;
        for card in &self.cards[first..=last] {
            card.store(state as u8, Ordering::Release);
        }
    }

    /// Cards currently in the marked state.
    #[must_use]
    pub fn marked_cards(&self) -> Vec<CardIndex> {
        self.cards
            .iter()
            .enumerate()
            .filter(|(_, state)| state.load(Ordering::Relaxed) == CardState::Marked as u8)
            .map(|(idx, _)| CardIndex(idx))
            .collect()
    }
}
