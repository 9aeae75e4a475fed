//! Object-id encoding and the small numeric constants that govern the MDC set.
//!
//! The 64-bit objid packs `uniq | otype | slot`, low bits first, as a thin newtype wrapper with
//! explicit accessors rather than exposing the bit layout directly.

/// Maximum number of logical MDC slots (including slot 0, MDC0).
pub const MDC_SLOTS: usize = 256;
/// Size of the selector's interleave table (`mds_tbl`).
pub const MDC_TBL_SZ: usize = 16_384;
/// Maximum number of MDCs in one credit set / one allocator batch.
pub const MPOOL_MDC_SET_SZ: usize = 8;
/// Compaction retry budget before a slot's compaction is fatal.
pub const MDC_COMPACT_RETRY_DEFAULT: u32 = 3;
/// Every this-many'th issued uniq forces a durable checkpoint.
pub const OBJID_UNIQ_DELTA: u64 = 256;
/// Number of supported media classes.
pub const MP_MED_NUMBER: usize = 4;
/// Highest uniq reserved for internal/root use before user ids begin.
pub const UROOT_OBJID_MAX: u64 = OBJID_UNIQ_DELTA - 1;
/// Bounded retry budget for `obj_alloc`'s zone-reservation loop before giving up with `NoSpace`.
pub const ALLOC_RETRY_DEFAULT: u32 = 1024;
/// Backoff window between zone-reservation retries, alternated low/high per attempt.
pub const ALLOC_RETRY_WAIT_MIN_MICROS: u64 = 128;
pub const ALLOC_RETRY_WAIT_MAX_MICROS: u64 = 256;

const SLOT_BITS: u32 = 8;
const TYPE_BITS: u32 = 4;
const SLOT_MASK: u64 = (1 << SLOT_BITS) - 1;
const TYPE_MASK: u64 = (1 << TYPE_BITS) - 1;
const UNIQ_SHIFT: u32 = SLOT_BITS + TYPE_BITS;

/// The kind of durable object an objid or [`crate::layout::Layout`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjType {
    Undefined = 0,
    Mblock    = 1,
    Mlog      = 2,
}

impl ObjType {
    #[must_use]
    pub const fn is_user(self) -> bool {
        matches!(self, Self::Mblock | Self::Mlog)
    }
}

impl TryFrom<u64> for ObjType {
    type Error = ();

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Undefined),
            1 => Ok(Self::Mblock),
            2 => Ok(Self::Mlog),
            _ => Err(()),
        }
    }
}

/// A 64-bit object identifier: `uniq | otype | slot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ObjId(pub u64);

impl ObjId {
    #[must_use]
    pub const fn make(uniq: u64, otype: ObjType, slot: u8) -> Self {
        let packed = (uniq << UNIQ_SHIFT) | ((otype as u64) << SLOT_BITS) | (slot as u64);
        Self(packed)
    }

    #[must_use]
    pub const fn slot(self) -> u8 {
        (self.0 & SLOT_MASK) as u8
    }

    #[must_use]
    pub fn otype(self) -> ObjType {
        ObjType::try_from((self.0 >> SLOT_BITS) & TYPE_MASK).unwrap_or(ObjType::Undefined)
    }

    #[must_use]
    pub const fn uniq(self) -> u64 {
        self.0 >> UNIQ_SHIFT
    }

    /// True every `OBJID_UNIQ_DELTA`th uniq: these ids require a durable OIDCKPT before being
    /// handed to a caller.
    #[must_use]
    pub fn is_checkpoint(self) -> bool {
        self.uniq().is_multiple_of(OBJID_UNIQ_DELTA)
    }
}

/// Builds the objid of one of an MDCi's two paired mlogs. `n` is `2*i` or `2*i+1`; the mlog
/// always lives in slot 0 (MDC0's committed map), per invariant 2.
#[must_use]
pub const fn logid_make(n: u64, slot: u8) -> ObjId {
    ObjId::make(n, ObjType::Mlog, slot)
}

/// Recovers the MDC index `i` from a slot-0 mlog objid with uniq `2i` or `2i+1`.
#[must_use]
pub const fn mlogid_to_mdc_slot(id: ObjId) -> u8 {
    (id.uniq() >> 1) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_fields() {
        let id = ObjId::make(12_345, ObjType::Mblock, 7);
        assert_eq!(id.uniq(), 12_345);
        assert_eq!(id.otype(), ObjType::Mblock);
        assert_eq!(id.slot(), 7);
    }

    #[test]
    fn checkpoint_ids_are_multiples_of_delta() {
        assert!(ObjId::make(0, ObjType::Mlog, 0).is_checkpoint());
        assert!(ObjId::make(OBJID_UNIQ_DELTA, ObjType::Mlog, 0).is_checkpoint());
        assert!(!ObjId::make(OBJID_UNIQ_DELTA - 1, ObjType::Mlog, 0).is_checkpoint());
        assert!(!ObjId::make(OBJID_UNIQ_DELTA + 1, ObjType::Mlog, 0).is_checkpoint());
    }

    #[test]
    fn logid_recovers_mdc_slot() {
        let i: u64 = 5;
        let log1 = logid_make(2 * i, 0);
        let log2 = logid_make(2 * i + 1, 0);
        assert_eq!(mlogid_to_mdc_slot(log1), 5);
        assert_eq!(mlogid_to_mdc_slot(log2), 5);
        assert_eq!(log1.otype(), ObjType::Mlog);
        assert_eq!(log1.slot(), 0);
    }
}
