//! `Pmd`: the public façade over every other component in this crate.
//!
//! Callers never touch `Mda`, `MdcInfo`, or the individual component modules directly; they open
//! a pool, allocate/commit/delete objects on it, and let the background pre-compactor (or their
//! own periodic call to [`Pmd::run_precompaction_pass`]) keep logs compact and the MDC set sized.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::activation::{self, DeviceDescriptor, PoolProps};
use crate::error::{PmdError, PmdErrorKind, Result};
use crate::external::{ExtentIo, Mdc0Location, MdcLog, SpaceMap, Superblock};
use crate::ids::{logid_make, ObjId};
use crate::layout::Layout;
use crate::lifecycle;
use crate::mda::Mda;
use crate::mdc_alloc::{self, ValidateMode};
use crate::mdc_info::MdcInfo;
use crate::precompactor::Precompactor;
use crate::selector;
use crate::writeback;

/// The object type a caller asks [`Pmd::alloc_object`] for. Re-exported so callers don't need a
/// separate import for it.
pub use crate::ids::ObjType;
/// Configuration re-export so callers don't need a separate import for it.
pub use crate::config::PmdConfig;

/// One already-opened non-MDC0 slot, handed to [`Pmd::open`] alongside the paired-mlog objids
/// MDC0 already recorded for it. Opening the physical paired log is an external collaborator's
/// job; this crate only consumes the resulting handle.
pub struct OpenSlot {
    pub log: Box<dyn MdcLog>,
}

/// A running pool. Holds the in-memory MDC array, the pool-wide configuration, and handles to
/// the external collaborators (`SpaceMap`, `ExtentIo`, `Superblock`) this crate never implements
/// itself.
pub struct Pmd {
    mda:          Arc<Mda>,
    config:       PmdConfig,
    space_map:    Arc<dyn SpaceMap>,
    extent_io:    Arc<dyn ExtentIo>,
    superblock:   Arc<dyn Superblock>,
    /// Process-wide allocation mutex: MDC creation is single-threaded, per the allocator's own
    /// design, even though ordinary object operations are not.
    alloc_mutex:  Mutex<()>,
    /// Round-robin cursor into the selector's interleave table, advanced on every allocation.
    select_cursor: AtomicUsize,
    precompactor: Mutex<Option<Precompactor>>,
}

impl std::fmt::Debug for Pmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pmd").field("slot_count", &self.mda.slot_count()).finish_non_exhaustive()
    }
}

impl Pmd {
    /// Activates a pool: attaches `mdc0_log` and the two boot mlog objects MDC0 itself lives in,
    /// attaches one already-opened log per entry in `other_slots` (in slot order, i.e. entry 0
    /// becomes slot 1), replays every slot, reconciles MDC0's device map against `descriptors`,
    /// and validates MDC0's bookkeeping.
    pub fn open(
        config: PmdConfig,
        mdc0_log: Box<dyn MdcLog>,
        boot_mlogs: [(ObjId, crate::layout::LayoutDevice); 2],
        other_slots: Vec<OpenSlot>,
        space_map: Arc<dyn SpaceMap>,
        extent_io: Arc<dyn ExtentIo>,
        superblock: Arc<dyn Superblock>,
        descriptors: &[DeviceDescriptor],
    ) -> Result<(Self, PoolProps)> {
        let config = config.validated()?;
        let mda = Mda::new();
        mda.mdc0().compact.lock().handle = Some(mdc0_log);
        for (objid, ld) in boot_mlogs {
            let layout = lifecycle::obj_alloc_with_id(&mda.mdc0(), objid, ld)?;
            lifecycle::obj_commit(&mda.mdc0(), layout.objid)?;
        }

        if !other_slots.is_empty() {
            let added = mda.grow(other_slots.len());
            for (slot, opened) in added.iter().zip(other_slots) {
                slot.compact.lock().handle = Some(opened.log);
            }
        }

        let mda = Arc::new(mda);
        let props =
            activation::activate(&mda, &config, space_map.as_ref(), extent_io.as_ref(), descriptors)?;
        selector::update_credit(&mda, &config);

        let pmd = Self {
            mda,
            config,
            space_map,
            extent_io,
            superblock,
            alloc_mutex: Mutex::new(()),
            select_cursor: AtomicUsize::new(0),
            precompactor: Mutex::new(None),
        };
        Ok((pmd, props))
    }

    #[must_use]
    pub fn config(&self) -> &PmdConfig {
        &self.config
    }

    #[must_use]
    pub fn extent_io(&self) -> &Arc<dyn ExtentIo> {
        &self.extent_io
    }

    #[must_use]
    pub fn space_map(&self) -> &Arc<dyn SpaceMap> {
        &self.space_map
    }

    fn slot_for(&self, objid: ObjId) -> Result<Arc<MdcInfo>> {
        self.mda.slot(objid.slot()).ok_or_else(|| {
            PmdError::new(PmdErrorKind::NotFound, format!("no such MDC slot {}", objid.slot()))
        })
    }

    /// Picks the destination slot for a new allocation from the selector's interleave table,
    /// falling back to slot 1 (or MDC0, if no user MDC exists yet) when the table hasn't been
    /// populated.
    fn select_slot(&self) -> Arc<MdcInfo> {
        let table = self.mda.selector_table();
        if table.is_empty() {
            return self.mda.slot(1).unwrap_or_else(|| self.mda.mdc0());
        }
        let cursor = self.select_cursor.fetch_add(1, Ordering::Relaxed) % table.len();
        let slot_index = table[cursor];
        self.mda.slot(slot_index).unwrap_or_else(|| self.mda.mdc0())
    }

    /// Allocates a new object on whichever slot the selector currently favors: reserves `zcnt`
    /// zones on `pdh` via the space map, prepares the extent, and only then records the
    /// allocation. The returned layout is uncommitted until [`Pmd::commit`] is called with its
    /// objid.
    pub fn alloc_object(&self, otype: ObjType, pdh: u16, zcnt: u32) -> Result<Arc<Layout>> {
        let slot = self.select_slot();
        lifecycle::obj_alloc(&slot, otype, pdh, zcnt, self.space_map.as_ref(), self.extent_io.as_ref())
    }

    pub fn commit(&self, objid: ObjId) -> Result<Arc<Layout>> {
        lifecycle::obj_commit(&self.slot_for(objid)?, objid)
    }

    pub fn abort(&self, objid: ObjId) -> Result<()> {
        lifecycle::obj_abort(&self.slot_for(objid)?, objid, self.space_map.as_ref())
    }

    pub fn delete(&self, objid: ObjId) -> Result<()> {
        lifecycle::obj_delete(&self.slot_for(objid)?, objid, self.space_map.as_ref())
    }

    /// Finds MDC0's own paired-log location (the two slot-0 mlog objids), for routing an erase of
    /// one of MDC0's own logs through the writeback path instead of the ordinary record log.
    fn mdc0_location(&self) -> Result<Mdc0Location> {
        let mdc0 = self.mda.mdc0();
        let active = mdc0.lookup(logid_make(0, 0)).ok_or_else(|| {
            PmdError::new(PmdErrorKind::Internal, "MDC0 is missing its active boot log")
        })?;
        let standby = mdc0.lookup(logid_make(1, 0)).ok_or_else(|| {
            PmdError::new(PmdErrorKind::Internal, "MDC0 is missing its standby boot log")
        })?;
        Ok(Mdc0Location { active: active.ld, standby: standby.ld })
    }

    /// Erases `objid` to generation `gen`. MDC0's own two boot mlogs cannot be recorded through
    /// an ordinary `OERASE` (there is nothing left to replay that bootstrap pointer from), so an
    /// erase of one of them is routed straight to the superblock instead.
    pub fn erase(&self, objid: ObjId, gen: u64) -> Result<u64> {
        if objid.slot() == 0 && objid.otype() == ObjType::Mlog {
            let loc = self.mdc0_location()?;
            return writeback::erase_mdc0_mlog(&self.mda.mdc0(), objid, gen, loc, self.superblock.as_ref());
        }
        lifecycle::obj_erase(&self.slot_for(objid)?, objid, gen)
    }

    pub fn get(&self, objid: ObjId) -> Result<Arc<Layout>> {
        lifecycle::obj_get(&self.slot_for(objid)?, objid)
    }

    pub fn put(&self, layout: &Arc<Layout>) {
        lifecycle::obj_put(layout);
    }

    pub fn find_get(&self, objid: ObjId) -> Result<Option<Arc<Layout>>> {
        Ok(lifecycle::obj_find_get(&self.slot_for(objid)?, objid))
    }

    /// Persists a new MDC0 location via the superblock, bypassing the ordinary record log path.
    pub fn writeback_mdc0_location(&self, loc: Mdc0Location) -> Result<()> {
        writeback::mdc0_meta_update(self.superblock.as_ref(), loc)
    }

    /// Grows the MDC set by `count` slots, under the process-wide allocation mutex, then
    /// re-validates MDC0's bookkeeping.
    pub fn grow_mdcs(&self, pdh: u16, count: usize) -> Result<Vec<Arc<MdcInfo>>> {
        let _guard = self.alloc_mutex.lock();
        let created = mdc_alloc::allocate_mdcs(
            &self.mda,
            self.space_map.as_ref(),
            self.extent_io.as_ref(),
            pdh,
            count,
        )?;
        mdc_alloc::mdc0_validate(
            &self.mda,
            self.space_map.as_ref(),
            self.extent_io.as_ref(),
            ValidateMode::Allocator,
        )?;
        selector::update_credit(&self.mda, &self.config);
        Ok(created)
    }

    /// Runs one pre-compaction pass synchronously: compacts every slot that needs it, grows the
    /// MDC set if the pool as a whole is running low on room, then refreshes the selector.
    pub fn run_precompaction_pass(&self, pdh: u16) -> Result<usize> {
        let compacted = crate::precompactor::run_once(&self.mda, &self.config)?;
        if selector::mdc_needed(&self.mda, &self.config) {
            self.grow_mdcs(pdh, self.config.mdc_ncap)?;
        }
        Ok(compacted)
    }

    /// Starts a background thread running [`Pmd::run_precompaction_pass`]'s compaction half on
    /// a fixed period. Replaces any previously spawned pre-compactor.
    pub fn spawn_precompactor(&self) {
        let mut guard = self.precompactor.lock();
        if let Some(old) = guard.take() {
            old.stop();
        }
        *guard = Some(Precompactor::spawn(Arc::clone(&self.mda), self.config));
    }

    /// Stops the background pre-compactor, if one is running.
    pub fn stop_precompactor(&self) {
        if let Some(precompactor) = self.precompactor.lock().take() {
            precompactor.stop();
        }
    }
}

impl Drop for Pmd {
    fn drop(&mut self) {
        self.stop_precompactor();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{InMemoryExtentIo, InMemoryMdcLog, InMemorySpaceMap, InMemorySuperblock};
    use crate::layout::LayoutDevice;

    fn fresh_pool() -> Pmd {
        let mdc0_log = Box::new(InMemoryMdcLog::new(1 << 20));
        let boot_mlogs = [
            (logid_make(0, 0), LayoutDevice { pdh: 0, zaddr: 0, zcnt: 4 }),
            (logid_make(1, 0), LayoutDevice { pdh: 0, zaddr: 4, zcnt: 4 }),
        ];
        let space_map: Arc<dyn SpaceMap> = Arc::new(InMemorySpaceMap::new(vec![10_000]));
        let extent_io: Arc<dyn ExtentIo> = Arc::new(InMemoryExtentIo::new());
        let superblock: Arc<dyn Superblock> = Arc::new(InMemorySuperblock::new());
        let (pmd, props) = Pmd::open(
            PmdConfig::default(),
            mdc0_log,
            boot_mlogs,
            Vec::new(),
            space_map,
            extent_io,
            superblock,
            &[],
        )
        .unwrap();
        assert!(props.version.is_none());
        pmd
    }

    #[test]
    fn opens_a_fresh_pool_with_only_mdc0() {
        let pmd = fresh_pool();
        assert_eq!(pmd.mda.slot_count(), 1);
    }

    #[test]
    fn grows_mdcs_and_allocates_objects_on_them() {
        let pmd = fresh_pool();
        pmd.grow_mdcs(0, 2).unwrap();
        assert_eq!(pmd.mda.slot_count(), 3);

        let allocated = pmd.alloc_object(ObjType::Mblock, 0, 1).unwrap();
        let committed = pmd.commit(allocated.objid).unwrap();
        assert!(committed.is_committed());

        let fetched = pmd.get(allocated.objid).unwrap();
        assert_eq!(fetched.objid, allocated.objid);
    }

    #[test]
    fn delete_and_erase_round_trip() {
        let pmd = fresh_pool();
        pmd.grow_mdcs(0, 1).unwrap();
        let allocated = pmd.alloc_object(ObjType::Mlog, 0, 1).unwrap();
        pmd.commit(allocated.objid).unwrap();

        let new_gen = pmd.erase(allocated.objid, 1).unwrap();
        assert_eq!(new_gen, 1);

        pmd.delete(allocated.objid).unwrap();
        assert_eq!(pmd.get(allocated.objid).unwrap_err().kind(), PmdErrorKind::NotFound);
    }

    #[test]
    fn erasing_an_mdc0_boot_log_routes_through_the_superblock() {
        let pmd = fresh_pool();
        let objid = logid_make(0, 0);
        let new_gen = pmd.erase(objid, 1).unwrap();
        assert_eq!(new_gen, 1);
        assert_eq!(pmd.get(objid).unwrap().gen(), 1);
    }

    #[test]
    fn run_precompaction_pass_compacts_and_reports_zero_when_idle() {
        let pmd = fresh_pool();
        let compacted = pmd.run_precompaction_pass(0).unwrap();
        assert_eq!(compacted, 0);
    }

    #[test]
    fn spawn_and_stop_precompactor_does_not_hang() {
        let pmd = fresh_pool();
        pmd.spawn_precompactor();
        pmd.stop_precompactor();
    }
}
