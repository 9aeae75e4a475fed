//! MDC allocation and MDC0 consistency validation.
//!
//! A new MDC's two paired mlogs are logged into MDC0 and only become part of the live slot set
//! once that's durable: log before install.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{PmdError, PmdErrorKind, Result};
use crate::external::{ExtentIo, SpaceMap};
use crate::ids::{logid_make, mlogid_to_mdc_slot, ObjType, MDC_SLOTS};
use crate::layout::LayoutDevice;
use crate::lifecycle::{obj_alloc_with_id, obj_commit, obj_delete};
use crate::mda::Mda;
use crate::mdc_info::MdcInfo;
use crate::write_log::{PairedBlockLog, BLOCK_SIZE};

/// Zones reserved per log half of a newly created MDC. An allocator-internal sizing choice, not
/// part of the on-media format.
const LOG_HALF_ZONES: u32 = 4;

/// Highest number of materialized MDC slots (beyond MDC0) the allocator will ever create.
/// One slot short of [`MDC_SLOTS`], leaving room for MDC0 itself.
const MDC_ALLOC_CAP: usize = MDC_SLOTS - 1;

/// Whether [`mdc0_validate`] is being run from the allocator (where residue cleanup failure is
/// fatal, since the caller is about to make the slot set larger) or from activation (where it is
/// best-effort: a pool that can't clean up its own crash residue should still come up).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidateMode {
    Activation,
    Allocator,
}

/// Creates up to `want` new MDC slots (bounded by remaining room in the pool's slot array,
/// capped one short of [`MDC_SLOTS`] to leave room for MDC0), recording each one's paired mlogs
/// in MDC0 before the slot becomes visible, and erasing both freshly reserved log halves before
/// they are ever written to.
pub fn allocate_mdcs(
    mda: &Mda,
    space_map: &dyn SpaceMap,
    extent_io: &dyn ExtentIo,
    pdh: u16,
    want: usize,
) -> Result<Vec<Arc<MdcInfo>>> {
    mdc0_validate(mda, space_map, extent_io, ValidateMode::Allocator)?;

    if mda.slot_count() >= MDC_ALLOC_CAP {
        return Err(PmdError::new(PmdErrorKind::NoSpace, "mdc slot array is at its allocation cap"));
    }
    let room = MDC_ALLOC_CAP - mda.slot_count();
    let count = want.min(room);
    if count == 0 {
        return Err(PmdError::new(PmdErrorKind::NoSpace, "mdc slot array is at its allocation cap"));
    }

    let mdc0 = mda.mdc0();
    let mut created = Vec::with_capacity(count);
    for _ in 0..count {
        let i = (mda.slot_count() + created.len() - 1) as u64;

        let active_ld = space_map.alloc(pdh, LOG_HALF_ZONES)?;
        let standby_ld = space_map.alloc(pdh, LOG_HALF_ZONES)?;
        extent_io.erase(active_ld)?;
        extent_io.erase(standby_ld)?;
        record_log_half(&mdc0, logid_make(2 * i, 0), active_ld)?;
        record_log_half(&mdc0, logid_make(2 * i + 1, 0), standby_ld)?;

        let slot_index = u8::try_from(i + 1).expect("MDC_SLOTS fits in u8");
        let slot = Arc::new(MdcInfo::new(slot_index));
        let capacity = usize::try_from(LOG_HALF_ZONES).unwrap_or(1) * BLOCK_SIZE;
        slot.compact.lock().handle = Some(Box::new(PairedBlockLog::new(capacity)));
        created.push(slot);
    }

    for slot in &created {
        mda.push_slot(Arc::clone(slot));
    }
    Ok(created)
}

fn record_log_half(mdc0: &MdcInfo, objid: crate::ids::ObjId, ld: LayoutDevice) -> Result<()> {
    obj_alloc_with_id(mdc0, objid, ld)?;
    obj_commit(mdc0, objid)?;
    Ok(())
}

/// Confirms MDC0's committed set holds both paired mlogs for every non-MDC0 slot currently in
/// `mda`, and cleans up a crashed MDC allocation's residue: if the last-allocated slot's pair
/// isn't exactly two entries (the allocator crashed between committing `log1` and `log2`), the
/// orphaned log is deleted and its extent erased.
pub fn mdc0_validate(
    mda: &Mda,
    space_map: &dyn SpaceMap,
    extent_io: &dyn ExtentIo,
    mode: ValidateMode,
) -> Result<()> {
    let mdc0 = mda.mdc0();

    let mut lcnt: BTreeMap<u8, Vec<crate::ids::ObjId>> = BTreeMap::new();
    for objid in mdc0.co.read().keys() {
        if objid.otype() == ObjType::Mlog && objid.slot() == 0 {
            lcnt.entry(mlogid_to_mdc_slot(*objid)).or_default().push(*objid);
        }
    }

    let max = lcnt.keys().copied().max();
    if let Some(max) = max {
        let entries = &lcnt[&max];
        match entries.len() {
            2 => {}
            1 => {
                let orphan = entries[0];
                let cleanup = (|| -> Result<()> {
                    let layout = mdc0.lookup(orphan).ok_or_else(|| {
                        PmdError::new(PmdErrorKind::Internal, "orphaned log vanished mid-cleanup")
                    })?;
                    obj_delete(&mdc0, orphan, space_map)?;
                    extent_io.erase(layout.ld)
                })();
                match mode {
                    ValidateMode::Allocator => cleanup?,
                    ValidateMode::Activation => {
                        if let Err(err) = cleanup {
                            tracing::warn!(
                                %err,
                                slot = max,
                                "failed to clean up orphaned mdc log residue during activation",
                            );
                        }
                    }
                }
            }
            n => {
                return Err(PmdError::new(
                    PmdErrorKind::Internal,
                    format!("mdc slot {max} has {n} paired log records, expected at most 2"),
                ));
            }
        }
    }

    let co = mdc0.co.read();
    for slot in mda.slots().skip(1) {
        let i = u64::from(slot.slot - 1);
        if Some(slot.slot - 1) == max {
            // Already validated (and possibly cleaned up) above.
            continue;
        }
        let active = logid_make(2 * i, 0);
        let standby = logid_make(2 * i + 1, 0);
        if !co.contains_key(&active) || !co.contains_key(&standby) {
            return Err(PmdError::new(
                PmdErrorKind::Internal,
                format!("MDC0 missing paired log records for slot {}", slot.slot),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{InMemoryExtentIo, InMemorySpaceMap};

    fn mda_with_mdc0_log() -> Mda {
        let mda = Mda::new();
        mda.mdc0().compact.lock().handle =
            Some(Box::new(PairedBlockLog::new(BLOCK_SIZE * 16)));
        mda
    }

    #[test]
    fn allocates_requested_slots_and_records_them_in_mdc0() {
        let mda = mda_with_mdc0_log();
        let space_map = InMemorySpaceMap::new(vec![1_000]);
        let extent_io = InMemoryExtentIo::new();
        let created = allocate_mdcs(&mda, &space_map, &extent_io, 0, 3).unwrap();
        assert_eq!(created.len(), 3);
        assert_eq!(mda.slot_count(), 4);
        mdc0_validate(&mda, &space_map, &extent_io, ValidateMode::Activation).unwrap();
    }

    #[test]
    fn refuses_to_allocate_past_the_allocation_cap() {
        let mda = mda_with_mdc0_log();
        let space_map = InMemorySpaceMap::new(vec![1_000_000]);
        let extent_io = InMemoryExtentIo::new();
        let remaining = MDC_ALLOC_CAP - mda.slot_count();
        allocate_mdcs(&mda, &space_map, &extent_io, 0, remaining).unwrap();
        assert_eq!(mda.slot_count(), MDC_ALLOC_CAP);
        assert_eq!(
            allocate_mdcs(&mda, &space_map, &extent_io, 0, 1).unwrap_err().kind(),
            PmdErrorKind::NoSpace,
        );
    }

    #[test]
    fn validate_cleans_up_an_orphaned_log_from_a_crashed_allocation() {
        let mda = mda_with_mdc0_log();
        let space_map = InMemorySpaceMap::new(vec![1_000]);
        let extent_io = InMemoryExtentIo::new();
        allocate_mdcs(&mda, &space_map, &extent_io, 0, 1).unwrap();

        // Simulate a crash between committing log1 and log2 of a second MDC: log one half only.
        let orphan_ld = space_map.alloc(0, LOG_HALF_ZONES).unwrap();
        record_log_half(&mda.mdc0(), logid_make(2, 0), orphan_ld).unwrap();

        mdc0_validate(&mda, &space_map, &extent_io, ValidateMode::Allocator).unwrap();
        assert!(mda.mdc0().lookup(logid_make(2, 0)).is_none());
    }
}
