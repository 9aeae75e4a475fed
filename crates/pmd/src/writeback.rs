//! MDC0 metadata writeback: keeping the superblock's mirror of MDC0's location and
//! generation numbers current.
//!
//! MDC0's own mlogs are themselves regular mlog objects, but an erase of one of them cannot be
//! recorded as an ordinary `OERASE` in MDC0's own log — there is nothing else to replay that
//! bootstrap pointer from. Instead the new generation and the active/standby extent locations
//! are pushed straight to the superblock, which is authoritative for MDC0 on activation.

use crate::error::Result;
use crate::external::{Mdc0Location, Superblock};
use crate::ids::{ObjId, ObjType};
use crate::mdc_info::MdcInfo;

/// Persists `loc` as the pool's current MDC0 pointer.
pub fn mdc0_meta_update(superblock: &dyn Superblock, loc: Mdc0Location) -> Result<()> {
    superblock.write_mdc0_location(loc)
}

/// Reads back the durable MDC0 pointer, e.g. to find the boot mlogs before any MDC can be
/// opened.
pub fn mdc0_meta_read(superblock: &dyn Superblock) -> Result<Mdc0Location> {
    superblock.read_mdc0_location()
}

/// Bumps the generation of one of MDC0's own mlogs to `gen` (which must exceed its current
/// generation) and writes the new location/generation back to the superblock, bypassing the
/// ordinary `OERASE` log path. `objid` must name a slot-0 mlog (one of MDC0's own paired boot
/// logs), not a user-object mlog.
pub fn erase_mdc0_mlog(
    mdc0: &MdcInfo,
    objid: ObjId,
    gen: u64,
    loc: Mdc0Location,
    superblock: &dyn Superblock,
) -> Result<u64> {
    debug_assert!(mdc0.is_mdc0());
    debug_assert_eq!(objid.otype(), ObjType::Mlog);

    let layout = mdc0.lookup(objid).ok_or_else(|| {
        crate::error::PmdError::new(
            crate::error::PmdErrorKind::NotFound,
            format!("no such MDC0 mlog {objid:?}"),
        )
    })?;
    crate::lifecycle::validate_erase_gen(&layout, gen)?;
    layout.mutable.write().gen = gen;
    mdc0_meta_update(superblock, loc)?;
    Ok(gen)
}
