//! Per-slot MDC bookkeeping.
//!
//! Each pool slot holds one MDC's committed/uncommitted object maps plus counters, each guarded
//! by its own specific lock rather than one big mutex.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::external::MdcLog;
use crate::ids::{ObjId, ObjType};
use crate::layout::Layout;
use crate::record::{ContentVersion, PoolProps, LATEST_CONTENT_VERSION};

/// Allocation/footprint counters reported to callers and consulted by the selector.
#[derive(Debug, Clone, Copy, Default)]
pub struct MdcStats {
    pub mblock_cnt:      u32,
    pub mlog_cnt:        u32,
    pub bytes_allocated: u64,
    pub bytes_written:   u64,
}

/// Activity counters accumulated since the slot's last compaction; reset to zero on
/// every successful compaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreCompactCounters {
    pub cr:   u32,
    pub up:   u32,
    pub del:  u32,
    pub er:   u32,
    pub cobj: u32,
    pub cap:  u64,
    pub len:  u64,
}

impl PreCompactCounters {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Selector bookkeeping for one slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreditInfo {
    pub free:   u64,
    pub credit: i64,
}

/// State behind the `compact` lock: the paired-log handle, the scratch record buffer used while
/// packing a compaction, and the slot's last-seen content version/activity counters. Only one
/// compaction may be in flight per slot, so one mutex covers all of it.
#[derive(Debug)]
pub struct CompactGuarded {
    pub handle:  Option<Box<dyn MdcLog>>,
    pub recbuf:  Vec<u8>,
    pub mdccver: ContentVersion,
    pub pco_cnt: PreCompactCounters,
}

impl Default for CompactGuarded {
    fn default() -> Self {
        Self {
            handle:  None,
            recbuf:  Vec::new(),
            mdccver: LATEST_CONTENT_VERSION,
            pco_cnt: PreCompactCounters::default(),
        }
    }
}

/// State behind the `uq` lock: the id generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniqGuarded {
    /// Next uniq to hand out.
    pub luniq: u64,
    /// Highest uniq known durable via an OIDCKPT record.
    pub lckpt: u64,
}

/// One pool slot's full in-memory MDC state. Field names match the lock they live behind, not
/// a generic "data"/"inner" split, so call sites read as "lock `co`, not "lock `self.state``.
pub struct MdcInfo {
    pub slot: u8,

    /// Handle, scratch buffer, version, and pre-compact counters.
    pub compact: Mutex<CompactGuarded>,
    /// Id generator.
    pub uq: Mutex<UniqGuarded>,
    /// Committed objects, readable by many concurrent lookups.
    pub co: RwLock<BTreeMap<ObjId, Arc<Layout>>>,
    /// Uncommitted (in-flight `obj_alloc`) objects.
    pub unco: Mutex<BTreeMap<ObjId, Arc<Layout>>>,
    /// Selector credit bookkeeping.
    pub ref_: Mutex<CreditInfo>,
    /// Reported stats.
    pub stats: Mutex<MdcStats>,
    /// MDC0's own pool-wide properties, carried forward so compaction can re-emit them. Always
    /// `None` on non-MDC0 slots.
    pub mdc0_props: Mutex<Option<PoolProps>>,
}

impl MdcInfo {
    #[must_use]
    pub fn new(slot: u8) -> Self {
        Self {
            slot,
            compact: Mutex::new(CompactGuarded::default()),
            uq:      Mutex::new(UniqGuarded::default()),
            co:      RwLock::new(BTreeMap::new()),
            unco:    Mutex::new(BTreeMap::new()),
            ref_:    Mutex::new(CreditInfo::default()),
            stats:   Mutex::new(MdcStats::default()),
            mdc0_props: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn is_mdc0(&self) -> bool {
        self.slot == 0
    }

    /// Hands out the next uniq, reporting whether it crosses an `OBJID_UNIQ_DELTA` boundary and
    /// therefore needs a durable OIDCKPT before being returned to a caller.
    pub fn alloc_uniq(&self) -> (u64, bool) {
        let mut uq = self.uq.lock();
        let uniq = uq.luniq;
        uq.luniq += 1;
        (uniq, ObjId::make(uniq, crate::ids::ObjType::Undefined, 0).is_checkpoint())
    }

    /// Records that `uniq` is now durable, advancing `lckpt` if `uniq` is newer.
    pub fn record_checkpoint(&self, uniq: u64) {
        let mut uq = self.uq.lock();
        if uniq > uq.lckpt {
            uq.lckpt = uniq;
        }
    }

    /// Inserts a freshly allocated, not-yet-committed object.
    pub fn insert_uncommitted(&self, layout: Arc<Layout>) {
        self.unco.lock().insert(layout.objid, layout);
    }

    /// Moves an object from `unco` to `co`.
    #[must_use]
    pub fn commit(&self, objid: ObjId) -> Option<Arc<Layout>> {
        let layout = self.unco.lock().remove(&objid)?;
        self.co.write().insert(objid, Arc::clone(&layout));
        Some(layout)
    }

    /// Drops an allocated-but-never-committed object.
    #[must_use]
    pub fn abort(&self, objid: ObjId) -> Option<Arc<Layout>> {
        self.unco.lock().remove(&objid)
    }

    /// Removes a committed object.
    #[must_use]
    pub fn delete_committed(&self, objid: ObjId) -> Option<Arc<Layout>> {
        self.co.write().remove(&objid)
    }

    #[must_use]
    pub fn lookup(&self, objid: ObjId) -> Option<Arc<Layout>> {
        self.co.read().get(&objid).cloned().or_else(|| self.unco.lock().get(&objid).cloned())
    }

    /// Looks up `objid` in `unco` only. Used by `obj_commit`, where the realloc path means
    /// `co` can already hold a stale layout under the same id that `lookup` would otherwise
    /// shadow the freshly allocated one with.
    #[must_use]
    pub fn pending(&self, objid: ObjId) -> Option<Arc<Layout>> {
        self.unco.lock().get(&objid).cloned()
    }

    #[must_use]
    pub fn committed_len(&self) -> usize {
        self.co.read().len()
    }

    pub fn bump_pco_cobj(&self) {
        self.compact.lock().pco_cnt.cobj += 1;
    }

    pub fn drop_pco_cobj(&self) {
        let mut compact = self.compact.lock();
        compact.pco_cnt.cobj = compact.pco_cnt.cobj.saturating_sub(1);
    }

    pub fn reset_pco_cnt(&self) {
        self.compact.lock().pco_cnt.reset();
    }

    /// Records a successful `obj_alloc`'s zone reservation in this slot's reported stats.
    pub fn bump_alloc_stats(&self, otype: ObjType, zcnt: u32) {
        let mut stats = self.stats.lock();
        match otype {
            ObjType::Mblock => stats.mblock_cnt += 1,
            ObjType::Mlog => stats.mlog_cnt += 1,
            ObjType::Undefined => {}
        }
        stats.bytes_allocated += u64::from(zcnt);
    }
}

impl std::fmt::Debug for MdcInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MdcInfo")
            .field("slot", &self.slot)
            .field("committed_len", &self.committed_len())
            .finish_non_exhaustive()
    }
}
