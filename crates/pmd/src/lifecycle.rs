//! Object lifecycle operations: allocate, commit, abort, delete, erase, and the
//! get/put/find_get reference-counted lookup trio.
//!
//! Layouts are handed out as `Arc<Layout>`; `obj_find_get`/`obj_put` bump and drop an explicit
//! domain-level refcount on top of Rust's own `Arc` strong count, so callers can track
//! outstanding logical references independently of how many clones of the handle exist.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::append::mdc_addrec;
use crate::error::{PmdError, PmdErrorKind, Result};
use crate::external::{ExtentIo, SpaceMap};
use crate::ids::{
    ObjId, ObjType, ALLOC_RETRY_DEFAULT, ALLOC_RETRY_WAIT_MAX_MICROS, ALLOC_RETRY_WAIT_MIN_MICROS,
};
use crate::layout::{Layout, LayoutDevice, LayoutState};
use crate::mdc_info::MdcInfo;
use crate::record::Record;

fn not_found(objid: ObjId) -> PmdError {
    PmdError::new(PmdErrorKind::NotFound, format!("no such object {objid:?}"))
}

/// Reserves `zcnt` zones on `pdh`, retrying with a brief backoff up to [`ALLOC_RETRY_DEFAULT`]
/// times before giving up with whatever error the space map last reported.
fn alloc_zones(space_map: &dyn SpaceMap, pdh: u16, zcnt: u32) -> Result<LayoutDevice> {
    let mut last_err = None;
    for attempt in 0..ALLOC_RETRY_DEFAULT {
        match space_map.alloc(pdh, zcnt) {
            Ok(ld) => return Ok(ld),
            Err(err) => last_err = Some(err),
        }
        let wait = if attempt.is_multiple_of(2) {
            ALLOC_RETRY_WAIT_MIN_MICROS
        } else {
            ALLOC_RETRY_WAIT_MAX_MICROS
        };
        thread::sleep(Duration::from_micros(wait));
    }
    Err(last_err.unwrap_or_else(|| {
        PmdError::new(PmdErrorKind::NoSpace, "zone allocation retry loop produced no error")
    }))
}

/// An erase must strictly advance the generation; shared by ordinary `obj_erase` and MDC0's
/// writeback-routed erase.
pub(crate) fn validate_erase_gen(layout: &Layout, gen: u64) -> Result<()> {
    if gen <= layout.gen() {
        return Err(PmdError::new(
            PmdErrorKind::InvalidArgument,
            format!("erase gen {gen} does not exceed current gen {}", layout.gen()),
        ));
    }
    Ok(())
}

/// Allocates a fresh objid in `info`'s uniq space, forcing a durable OIDCKPT whenever the
/// new id crosses an `OBJID_UNIQ_DELTA` boundary.
pub fn alloc_idgen(info: &MdcInfo, otype: ObjType) -> Result<ObjId> {
    let (uniq, needs_checkpoint) = info.alloc_uniq();
    let objid = ObjId::make(uniq, otype, info.slot);
    if needs_checkpoint {
        mdc_addrec(info, &Record::OIdCkpt { objid })?;
        info.record_checkpoint(uniq);
    }
    Ok(objid)
}

/// Allocates a new, uncommitted object: reserves `zcnt` zones on `pdh` through `space_map`
/// (retrying a bounded number of times on transient `NoSpace`), prepares the extent through
/// `extent_io`, and on success records the reservation in the slot's stats. Not yet visible to
/// lookups that only consult the committed set.
pub fn obj_alloc(
    info: &MdcInfo,
    otype: ObjType,
    pdh: u16,
    zcnt: u32,
    space_map: &dyn SpaceMap,
    extent_io: &dyn ExtentIo,
) -> Result<Arc<Layout>> {
    let objid = alloc_idgen(info, otype)?;
    let ld = alloc_zones(space_map, pdh, zcnt)?;
    extent_io.layout_alloc(ld)?;
    let layout = obj_alloc_with_id(info, objid, ld)?;
    info.bump_alloc_stats(otype, zcnt);
    Ok(layout)
}

/// As [`obj_alloc`], but with a caller-chosen objid instead of one from `info`'s own id
/// generator. Used only where an id is derived from something other than uniq allocation, e.g.
/// MDC0 recording a new MDC's paired mlogs under `logid_make`-derived ids.
pub fn obj_alloc_with_id(info: &MdcInfo, objid: ObjId, ld: LayoutDevice) -> Result<Arc<Layout>> {
    let layout = Arc::new(Layout::new_uncommitted(objid, ld));
    info.insert_uncommitted(Arc::clone(&layout));
    Ok(layout)
}

/// Makes an allocated object durable and visible: logs an OCREATE (or, if `objid` already has a
/// committed layout under it — the realloc case — OUPDATE), then moves it from `unco` to `co`.
///
/// Idempotent: if `objid` has no pending (uncommitted) layout but is already committed, this is a
/// no-op success returning the existing layout, rather than a `NotFound` error.
pub fn obj_commit(info: &MdcInfo, objid: ObjId) -> Result<Arc<Layout>> {
    let Some(layout) = info.pending(objid) else {
        if let Some(existing) = info.co.read().get(&objid).cloned() {
            return Ok(existing);
        }
        return Err(not_found(objid));
    };
    let replaces_existing = info.co.read().contains_key(&objid);
    let (gen, mblen) = {
        let mut mutable = layout.mutable.write();
        mutable.state.remove(LayoutState::UNCOMMITTED);
        mutable.state.insert(LayoutState::COMMITTED);
        (mutable.gen, mutable.mblen)
    };
    let record = if replaces_existing {
        Record::OUpdate { objid, ld: layout.ld, gen, mblen }
    } else {
        Record::OCreate { objid, ld: layout.ld, gen, mblen }
    };
    mdc_addrec(info, &record)?;
    info.commit(objid).ok_or_else(|| not_found(objid))?;
    if !replaces_existing {
        info.bump_pco_cobj();
    }
    Ok(layout)
}

/// Drops an allocated-but-never-committed object without touching the log: nothing durable ever
/// referenced it. Frees the object's reserved zones back to `space_map`.
pub fn obj_abort(info: &MdcInfo, objid: ObjId, space_map: &dyn SpaceMap) -> Result<()> {
    let layout = info.abort(objid).ok_or_else(|| not_found(objid))?;
    space_map.free(layout.ld)
}

/// Removes a committed object: logs an ODELETE, removes it from `co`, and frees its reserved
/// zones back to `space_map`.
pub fn obj_delete(info: &MdcInfo, objid: ObjId, space_map: &dyn SpaceMap) -> Result<()> {
    let layout = info.lookup(objid).ok_or_else(|| not_found(objid))?;
    mdc_addrec(info, &Record::ODelete { objid })?;
    {
        let mut mutable = layout.mutable.write();
        mutable.state.insert(LayoutState::REMOVED);
        mutable.isdel = true;
    }
    let removed = info.delete_committed(objid).ok_or_else(|| not_found(objid))?;
    info.drop_pco_cobj();
    space_map.free(removed.ld)
}

/// Bumps an mlog's generation to `gen` (which must exceed its current generation) and logs it.
pub fn obj_erase(info: &MdcInfo, objid: ObjId, gen: u64) -> Result<u64> {
    let layout = info.lookup(objid).ok_or_else(|| not_found(objid))?;
    validate_erase_gen(&layout, gen)?;
    mdc_addrec(info, &Record::OErase { objid, gen })?;
    layout.mutable.write().gen = gen;
    Ok(gen)
}

/// Plain lookup, no refcount change.
pub fn obj_get(info: &MdcInfo, objid: ObjId) -> Result<Arc<Layout>> {
    info.lookup(objid).ok_or_else(|| not_found(objid))
}

/// Releases a reference taken by [`obj_find_get`].
pub fn obj_put(layout: &Arc<Layout>) {
    let mut mutable = layout.mutable.write();
    mutable.refcnt = mutable.refcnt.saturating_sub(1);
}

/// Looks up an object and takes a reference on it atomically, so a
/// concurrent `obj_delete` can't remove it out from under the caller between the lookup and the
/// refcount bump.
pub fn obj_find_get(info: &MdcInfo, objid: ObjId) -> Option<Arc<Layout>> {
    let layout = info.lookup(objid)?;
    layout.mutable.write().refcnt += 1;
    Some(layout)
}
