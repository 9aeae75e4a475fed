//! The pool-wide MDC array.
//!
//! One top-level struct owning a collection of per-slot state (`MdcInfo`, keyed by slot index)
//! behind a lock that only ever protects membership, never per-slot data. Membership changes are
//! rare (MDC creation) next to reads (every lookup, every replay, every selector refresh), so the
//! slot vector itself lives behind an `RwLock` rather than requiring exclusive access to `Mda`.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::ids::MDC_SLOTS;
use crate::mdc_info::MdcInfo;

/// The full set of MDC slots for one pool. Slot 0 is always MDC0; the remaining slots are the
/// user-object MDCs the allocator has created so far.
pub struct Mda {
    /// Guards both which slots exist and how many; readers never need more than a shared lock.
    slots:          RwLock<Vec<Arc<MdcInfo>>>,
    /// The selector's interleave table; owned here because it is sized to the slot set and
    /// rebuilt whenever membership changes, even though the credit math that fills it lives in
    /// `selector.rs`.
    selector_table: Mutex<Vec<u8>>,
}

impl Mda {
    /// Builds an `Mda` with MDC0 already present as slot 0.
    #[must_use]
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MDC_SLOTS);
        slots.push(Arc::new(MdcInfo::new(0)));
        Self { slots: RwLock::new(slots), selector_table: Mutex::new(Vec::new()) }
    }

    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.read().len()
    }

    #[must_use]
    pub fn mdc0(&self) -> Arc<MdcInfo> {
        Arc::clone(&self.slots.read()[0])
    }

    #[must_use]
    pub fn slot(&self, index: u8) -> Option<Arc<MdcInfo>> {
        self.slots.read().get(index as usize).map(Arc::clone)
    }

    pub fn slots(&self) -> impl Iterator<Item = Arc<MdcInfo>> {
        self.slots.read().clone().into_iter()
    }

    /// Appends `count` freshly allocated slots. Returns the newly added slots.
    ///
    /// # Panics
    ///
    /// Panics if the pool has already reached `MDC_SLOTS`.
    pub fn grow(&self, count: usize) -> Vec<Arc<MdcInfo>> {
        let mut slots = self.slots.write();
        assert!(
            slots.len() + count <= MDC_SLOTS,
            "mdc slot array exhausted: {} + {count} > {MDC_SLOTS}",
            slots.len(),
        );
        let mut added = Vec::with_capacity(count);
        for i in 0..count {
            #[expect(clippy::cast_possible_truncation, reason = "MDC_SLOTS fits in u8")]
            let slot = Arc::new(MdcInfo::new((slots.len() + i) as u8));
            slots.push(Arc::clone(&slot));
            added.push(slot);
        }
        added
    }

    /// Appends one already-constructed slot.
    ///
    /// # Panics
    ///
    /// Panics if the pool has already reached `MDC_SLOTS`.
    pub fn push_slot(&self, info: Arc<MdcInfo>) {
        let mut slots = self.slots.write();
        assert!(slots.len() < MDC_SLOTS, "mdc slot array exhausted: already at {MDC_SLOTS}");
        slots.push(info);
    }

    /// Replaces the selector's interleave table wholesale; called by `selector.rs` after
    /// recomputing credits.
    pub fn set_selector_table(&self, table: Vec<u8>) {
        *self.selector_table.lock() = table;
    }

    #[must_use]
    pub fn selector_table(&self) -> Vec<u8> {
        self.selector_table.lock().clone()
    }
}

impl Default for Mda {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Mda {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mda").field("slot_count", &self.slot_count()).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_with_only_mdc0() {
        let mda = Mda::new();
        assert_eq!(mda.slot_count(), 1);
        assert!(mda.mdc0().is_mdc0());
        assert!(mda.slot(1).is_none());
    }

    #[test]
    fn grow_appends_contiguous_slots() {
        let mda = Mda::new();
        let added = mda.grow(8);
        assert_eq!(added.len(), 8);
        assert_eq!(mda.slot_count(), 9);
        for (i, slot) in added.iter().enumerate() {
            assert_eq!(slot.slot, u8::try_from(i + 1).unwrap());
        }
        assert!(mda.slot(9).is_none());
        assert!(mda.slot(8).is_some());
    }

    #[test]
    #[should_panic(expected = "mdc slot array exhausted")]
    fn grow_past_capacity_panics() {
        let mda = Mda::new();
        mda.grow(MDC_SLOTS);
    }

    #[test]
    fn selector_table_round_trips() {
        let mda = Mda::new();
        assert!(mda.selector_table().is_empty());
        mda.set_selector_table(vec![0, 1, 2]);
        assert_eq!(mda.selector_table(), vec![0, 1, 2]);
    }
}
