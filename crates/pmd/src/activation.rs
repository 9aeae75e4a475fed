//! Pool activation and replay: reconstruct every slot's in-memory state from its log,
//! reconcile MDC0's device map against current truth, then validate the result.
//!
//! `objs_load` applies a slot's records in order, one pass, folding them into its committed
//! set and pool properties, and re-seeding the space map with every surviving object's zones.
//! Per-slot replay is independent, so non-MDC0 slots are replayed in parallel over a bounded
//! `crossbeam-channel` worker pool instead of one at a time.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use uuid::Uuid;

use crate::config::PmdConfig;
use crate::error::{PmdError, PmdErrorKind, Result};
use crate::external::{ExtentIo, SpaceMap};
use crate::ids::OBJID_UNIQ_DELTA;
use crate::layout::{Layout, LayoutState};
use crate::mda::Mda;
use crate::mdc_alloc::{mdc0_validate, ValidateMode};
use crate::mdc_info::MdcInfo;
use crate::record::{DefaultRecordCodec, DeviceConfig, MediaClass, Record, RecordCodec};
pub use crate::record::PoolProps;

/// Externally supplied "current truth" about one device, used to reconcile against whatever
/// MDC0's log last recorded. A device logged in MDC0 but absent here, and never explicitly
/// flagged unavailable, is a zombie: media activation can no longer account for at all.
#[derive(Debug, Clone, Copy)]
pub struct DeviceDescriptor {
    pub uuid:        Uuid,
    pub pdh:         u16,
    pub media_class: MediaClass,
    pub zone_total:  u64,
    /// True when the device is known but not currently reachable (as opposed to simply absent
    /// from the descriptor set entirely).
    pub unavail:     bool,
}

/// Replays every record in `info`'s active log into its `co`/`uq` state and pool properties,
/// then re-seeds `space_map` with the zone range of every object that ended up committed.
/// Idempotent: safe to call on an already-loaded slot, since it only ever adds/removes from maps
/// keyed by objid.
pub fn objs_load(info: &MdcInfo, space_map: &dyn SpaceMap) -> Result<PoolProps> {
    let raw_records = {
        let mut compact = info.compact.lock();
        let handle = compact
            .handle
            .as_mut()
            .ok_or_else(|| PmdError::new(PmdErrorKind::Internal, "mdc slot has no open log"))?;
        handle.read_all()?
    };

    let mut props = PoolProps::default();
    for raw in raw_records {
        let record = DefaultRecordCodec::decode(&raw)
            .map_err(|err| PmdError::with_source(PmdErrorKind::Io, "corrupt MDC record", err))?;
        apply_record(info, &mut props, record);
    }

    for layout in info.co.read().values() {
        space_map.insert(layout.ld)?;
    }
    Ok(props)
}

fn apply_record(info: &MdcInfo, props: &mut PoolProps, record: Record) {
    match record {
        Record::Version(v) => props.version = Some(v),
        Record::OCreate { objid, ld, gen, mblen } | Record::OUpdate { objid, ld, gen, mblen } => {
            let layout = Arc::new(Layout::new_uncommitted(objid, ld));
            {
                let mut mutable = layout.mutable.write();
                mutable.gen = gen;
                mutable.mblen = mblen;
                mutable.state.remove(LayoutState::UNCOMMITTED);
                mutable.state.insert(LayoutState::COMMITTED);
            }
            info.co.write().insert(objid, layout);
        }
        Record::ODelete { objid } => {
            info.co.write().remove(&objid);
        }
        Record::OErase { objid, gen } => {
            if let Some(layout) = info.co.read().get(&objid) {
                layout.mutable.write().gen = gen;
            }
        }
        Record::OIdCkpt { objid } => {
            info.record_checkpoint(objid.uniq());
            let mut uq = info.uq.lock();
            // Non-MDC0 slots force the next allocation straight to the following checkpoint
            // boundary: replay has no way to know how many uncheckpointed ids were handed out
            // before the crash, so it must assume the whole next delta window may be in use.
            let forced =
                if info.is_mdc0() { objid.uniq() + 1 } else { objid.uniq() + OBJID_UNIQ_DELTA - 1 };
            if forced > uq.luniq {
                uq.luniq = forced;
            }
        }
        Record::McConfig(dc) => props.devices.push(dc),
        Record::McSpare { media_class, spare_pct } => props.spares.push((media_class, spare_pct)),
        Record::MpConfig(pc) => props.pool = Some(pc),
    }
}

/// Reconciles MDC0's logged device map against `descriptors`: matches each descriptor to a
/// logged device by uuid, flags UNAVAIL devices (matched-but-unreachable, or a phantom never
/// logged), and fails on zombies — a logged device no descriptor accounts for at all. Also fails
/// if, after reconciliation, some media class that used to have a device has none available.
fn reconcile_devices(
    logged: &[DeviceConfig],
    descriptors: &[DeviceDescriptor],
) -> Result<(Vec<DeviceConfig>, HashSet<Uuid>)> {
    let mut accounted = HashSet::new();
    let mut unavail = HashSet::new();
    let mut devices = Vec::new();

    for descriptor in descriptors {
        accounted.insert(descriptor.uuid);
        match logged.iter().find(|dc| dc.uuid == descriptor.uuid) {
            Some(dc) => {
                if dc.pdh != descriptor.pdh
                    || dc.media_class != descriptor.media_class
                    || dc.zone_total != descriptor.zone_total
                {
                    return Err(PmdError::new(
                        PmdErrorKind::InvalidArgument,
                        format!(
                            "device {} media-class/parm mismatch against its logged config",
                            descriptor.uuid,
                        ),
                    ));
                }
                if descriptor.unavail {
                    tracing::warn!(
                        uuid = %descriptor.uuid,
                        "logged device is currently unavailable",
                    );
                    unavail.insert(descriptor.uuid);
                }
                devices.push(*dc);
            }
            None if descriptor.unavail => {
                tracing::warn!(
                    uuid = %descriptor.uuid,
                    "unavailable device has no logged config, treating as phantom",
                );
            }
            None => {
                devices.push(DeviceConfig {
                    uuid:        descriptor.uuid,
                    pdh:         descriptor.pdh,
                    media_class: descriptor.media_class,
                    zone_total:  descriptor.zone_total,
                });
            }
        }
    }

    for dc in logged {
        if !accounted.contains(&dc.uuid) {
            return Err(PmdError::new(
                PmdErrorKind::DeviceUnavailable,
                format!(
                    "device {} is logged in MDC0 but absent from the current device set (zombie)",
                    dc.uuid,
                ),
            ));
        }
    }

    for media_class in MediaClass::ALL {
        let was_logged = logged.iter().any(|dc| dc.media_class == media_class);
        let uacnt = devices
            .iter()
            .filter(|dc| dc.media_class == media_class && !unavail.contains(&dc.uuid))
            .count();
        if was_logged && uacnt == 0 {
            return Err(PmdError::new(
                PmdErrorKind::DeviceUnavailable,
                format!("media class {media_class:?} has no available device after reconciliation"),
            ));
        }
    }

    Ok((devices, unavail))
}

/// Keeps only the last spare-percentage entry logged per media class.
fn dedup_spares(spares: Vec<(MediaClass, u8)>) -> Vec<(MediaClass, u8)> {
    let mut by_class: BTreeMap<u8, (MediaClass, u8)> = BTreeMap::new();
    for (media_class, spare_pct) in spares {
        by_class.insert(media_class as u8, (media_class, spare_pct));
    }
    by_class.into_values().collect()
}

/// Replays MDC0 and reconciles its device map against `descriptors`, leaving the reconciled
/// properties cached on MDC0's own [`MdcInfo`] so compaction can re-emit them.
pub fn props_load(
    info: &MdcInfo,
    space_map: &dyn SpaceMap,
    descriptors: &[DeviceDescriptor],
) -> Result<PoolProps> {
    let mut props = objs_load(info, space_map)?;
    let (devices, unavail) = reconcile_devices(&props.devices, descriptors)?;
    props.devices = devices;
    props.unavail = unavail;
    props.spares = dedup_spares(props.spares);
    *info.mdc0_props.lock() = Some(props.clone());
    Ok(props)
}

/// Brings a whole `Mda` up from its logs: replays MDC0 and reconciles its device map, replays
/// every other slot (in parallel, bounded by `config.objloadjobs`), then validates MDC0's
/// bookkeeping.
pub fn activate(
    mda: &Mda,
    config: &PmdConfig,
    space_map: &dyn SpaceMap,
    extent_io: &dyn ExtentIo,
    descriptors: &[DeviceDescriptor],
) -> Result<PoolProps> {
    let mdc0_props = props_load(&mda.mdc0(), space_map, descriptors)?;

    let others: Vec<_> = mda.slots().skip(1).collect();
    if !others.is_empty() {
        replay_parallel(&others, config.objloadjobs.max(1), space_map)?;
    }

    mdc0_validate(mda, space_map, extent_io, ValidateMode::Activation)?;
    Ok(mdc0_props)
}

fn replay_parallel(slots: &[Arc<MdcInfo>], worker_count: usize, space_map: &dyn SpaceMap) -> Result<()> {
    let (work_tx, work_rx) = crossbeam_channel::unbounded::<Arc<MdcInfo>>();
    let (result_tx, result_rx) = crossbeam_channel::unbounded::<Result<()>>();

    for slot in slots {
        work_tx.send(Arc::clone(slot)).expect("receiver outlives this send");
    }
    drop(work_tx);

    std::thread::scope(|scope| {
        for _ in 0..worker_count.min(slots.len()) {
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                while let Ok(slot) = work_rx.recv() {
                    let outcome = objs_load(&slot, space_map).map(|_| ());
                    if result_tx.send(outcome).is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);
    });

    for outcome in result_rx.iter() {
        outcome?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::append::mdc_addrec;
    use crate::external::{InMemoryExtentIo, InMemoryMdcLog, InMemorySpaceMap};
    use crate::ids::{ObjId, ObjType};
    use crate::layout::LayoutDevice;
    use crate::record::{PoolConfig, LATEST_CONTENT_VERSION};

    fn slot_with_records(slot_num: u8, records: &[Record]) -> Arc<MdcInfo> {
        let info = Arc::new(MdcInfo::new(slot_num));
        info.compact.lock().handle = Some(Box::new(InMemoryMdcLog::new(1 << 20)));
        for record in records {
            mdc_addrec(&info, record).unwrap();
        }
        info
    }

    fn space_map() -> InMemorySpaceMap {
        InMemorySpaceMap::new(vec![1_000])
    }

    #[test]
    fn objs_load_replays_create_update_delete_in_order() {
        let objid = ObjId::make(1, ObjType::Mblock, 0);
        let other = ObjId::make(2, ObjType::Mblock, 0);
        let info = slot_with_records(
            0,
            &[
                Record::OCreate {
                    objid,
                    ld: LayoutDevice { pdh: 0, zaddr: 0, zcnt: 1 },
                    gen: 0,
                    mblen: 10,
                },
                Record::OCreate {
                    objid: other,
                    ld: LayoutDevice { pdh: 0, zaddr: 1, zcnt: 1 },
                    gen: 0,
                    mblen: 5,
                },
                Record::ODelete { objid: other },
            ],
        );
        let space_map = space_map();
        objs_load(&info, &space_map).unwrap();
        assert!(info.lookup(objid).is_some());
        assert!(info.lookup(other).is_none());
    }

    #[test]
    fn objs_load_reserves_zones_for_surviving_objects() {
        let objid = ObjId::make(1, ObjType::Mblock, 0);
        let info = slot_with_records(
            0,
            &[Record::OCreate {
                objid,
                ld: LayoutDevice { pdh: 0, zaddr: 0, zcnt: 3 },
                gen: 0,
                mblen: 10,
            }],
        );
        let space_map = space_map();
        objs_load(&info, &space_map).unwrap();
        assert_eq!(space_map.free_zones(0).unwrap(), 997);
    }

    #[test]
    fn objs_load_recovers_pool_props_from_mdc0() {
        let uuid = Uuid::from_u128(7);
        let info = slot_with_records(
            0,
            &[
                Record::Version(LATEST_CONTENT_VERSION),
                Record::McConfig(DeviceConfig {
                    uuid,
                    pdh: 0,
                    media_class: MediaClass::Capacity,
                    zone_total: 1_000,
                }),
                Record::MpConfig(PoolConfig { pool_uuid: uuid, pool_name: "pool-a".to_owned() }),
            ],
        );
        let space_map = space_map();
        let props = objs_load(&info, &space_map).unwrap();
        assert_eq!(props.version, Some(LATEST_CONTENT_VERSION));
        assert_eq!(props.devices.len(), 1);
        assert_eq!(props.pool.unwrap().pool_name, "pool-a");
    }

    #[test]
    fn oidckpt_advances_the_uniq_generator_past_the_checkpointed_value_on_mdc0() {
        let objid = ObjId::make(500, ObjType::Mblock, 0);
        let info = slot_with_records(0, &[Record::OIdCkpt { objid }]);
        let space_map = space_map();
        objs_load(&info, &space_map).unwrap();
        let (next, _) = info.alloc_uniq();
        assert_eq!(next, 501);
    }

    #[test]
    fn oidckpt_forces_the_next_delta_boundary_on_non_mdc0_slots() {
        let objid = ObjId::make(500, ObjType::Mblock, 1);
        let info = slot_with_records(1, &[Record::OIdCkpt { objid }]);
        let space_map = space_map();
        objs_load(&info, &space_map).unwrap();
        let (next, _) = info.alloc_uniq();
        assert_eq!(next, 500 + OBJID_UNIQ_DELTA - 1);
    }

    #[test]
    fn props_load_reconciles_a_matched_device_and_caches_props_on_mdc0() {
        let uuid = Uuid::from_u128(1);
        let info = slot_with_records(
            0,
            &[Record::McConfig(DeviceConfig {
                uuid,
                pdh: 0,
                media_class: MediaClass::Capacity,
                zone_total: 1_000,
            })],
        );
        let space_map = space_map();
        let descriptors = [DeviceDescriptor {
            uuid,
            pdh: 0,
            media_class: MediaClass::Capacity,
            zone_total: 1_000,
            unavail: false,
        }];
        let props = props_load(&info, &space_map, &descriptors).unwrap();
        assert_eq!(props.devices.len(), 1);
        assert!(props.unavail.is_empty());
        assert_eq!(info.mdc0_props.lock().as_ref().unwrap().devices.len(), 1);
    }

    #[test]
    fn props_load_rejects_a_zombie_device() {
        let uuid = Uuid::from_u128(2);
        let info = slot_with_records(
            0,
            &[Record::McConfig(DeviceConfig {
                uuid,
                pdh: 0,
                media_class: MediaClass::Capacity,
                zone_total: 1_000,
            })],
        );
        let space_map = space_map();
        let err = props_load(&info, &space_map, &[]).unwrap_err();
        assert_eq!(err.kind(), PmdErrorKind::DeviceUnavailable);
    }

    #[test]
    fn props_load_marks_an_unavailable_phantom_without_failing() {
        let info = slot_with_records(0, &[]);
        let space_map = space_map();
        let descriptors = [DeviceDescriptor {
            uuid:        Uuid::from_u128(3),
            pdh:         0,
            media_class: MediaClass::Staging,
            zone_total:  500,
            unavail:     true,
        }];
        let props = props_load(&info, &space_map, &descriptors).unwrap();
        assert!(props.devices.is_empty());
        assert!(props.unavail.is_empty());
    }

    #[test]
    fn activate_replays_every_slot_and_validates_mdc0() {
        let mda = Mda::new();
        mda.mdc0().compact.lock().handle = Some(Box::new(InMemoryMdcLog::new(1 << 20)));

        let space_map = InMemorySpaceMap::new(vec![1_000]);
        let extent_io = InMemoryExtentIo::new();
        crate::mdc_alloc::allocate_mdcs(&mda, &space_map, &extent_io, 0, 2).unwrap();

        let props = activate(&mda, &PmdConfig::default(), &space_map, &extent_io, &[]).unwrap();
        assert!(props.version.is_none());
    }
}
