//! MDC compaction: freeze the committed set, rewrite it into the
//! standby half, cut over.
//!
//! Records are written to a fresh log before anything durable points at it, and only the final
//! step makes the new log visible. `cstart`/`cend` bracket that staged commit; on failure the
//! whole attempt retries up to [`MDC_COMPACT_RETRY_DEFAULT`] times before giving up.

use crate::error::{PmdError, PmdErrorKind, Result};
use crate::ids::{ObjId, ObjType, MDC_COMPACT_RETRY_DEFAULT};
use crate::mdc_info::{MdcInfo, PreCompactCounters};
use crate::record::{DefaultRecordCodec, Record, RecordCodec};

/// Compacts one slot: writes a VERSION record, MDC0's own config records (slot 0) or an
/// OIDCKPT carrying the slot's last checkpoint (every other slot), then one OCREATE per
/// committed object, into the standby half, then swaps it in. Retries up to
/// [`MDC_COMPACT_RETRY_DEFAULT`] times before giving up and returning the last error.
pub fn compact_slot(info: &MdcInfo) -> Result<()> {
    let mut last_err = None;
    for _ in 0..MDC_COMPACT_RETRY_DEFAULT {
        match try_compact_once(info) {
            Ok(()) => return Ok(()),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        PmdError::new(PmdErrorKind::Internal, "compaction retry loop produced no error")
    }))
}

fn try_compact_once(info: &MdcInfo) -> Result<()> {
    let mut compact = info.compact.lock();
    let mdccver = compact.mdccver;
    let handle = compact
        .handle
        .as_mut()
        .ok_or_else(|| PmdError::new(PmdErrorKind::Internal, "mdc slot has no open log handle"))?;

    handle.cstart()?;

    let mut version_buf = Vec::new();
    DefaultRecordCodec::encode(&Record::Version(mdccver), &mut version_buf);
    handle.append(&version_buf)?;

    if info.is_mdc0() {
        if let Some(props) = info.mdc0_props.lock().clone() {
            for dc in &props.devices {
                let mut buf = Vec::new();
                DefaultRecordCodec::encode(&Record::McConfig(*dc), &mut buf);
                handle.append(&buf)?;
            }
            for &(media_class, spare_pct) in &props.spares {
                let mut buf = Vec::new();
                DefaultRecordCodec::encode(&Record::McSpare { media_class, spare_pct }, &mut buf);
                handle.append(&buf)?;
            }
            if let Some(pool) = &props.pool {
                let mut buf = Vec::new();
                DefaultRecordCodec::encode(&Record::MpConfig(pool.clone()), &mut buf);
                handle.append(&buf)?;
            }
        }
    } else {
        let lckpt = info.uq.lock().lckpt;
        let mut buf = Vec::new();
        let objid = ObjId::make(lckpt, ObjType::Undefined, info.slot);
        DefaultRecordCodec::encode(&Record::OIdCkpt { objid }, &mut buf);
        handle.append(&buf)?;
    }

    let mut written: u32 = 0;
    {
        let committed = info.co.read();
        for layout in committed.values() {
            let (gen, mblen) = {
                let mutable = layout.mutable.read();
                (mutable.gen, mutable.mblen)
            };
            let record =
                Record::OCreate { objid: layout.objid, ld: layout.ld, gen, mblen };
            let mut buf = Vec::new();
            DefaultRecordCodec::encode(&record, &mut buf);
            handle.append(&buf)?;
            written += 1;
        }
    }

    handle.cend()?;
    compact.pco_cnt = PreCompactCounters { cobj: written, ..PreCompactCounters::default() };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::InMemoryMdcLog;
    use crate::layout::{Layout, LayoutDevice};
    use std::sync::Arc;

    #[test]
    fn compaction_rewrites_committed_objects_and_resets_counters() {
        let info = MdcInfo::new(1);
        info.compact.lock().handle = Some(Box::new(InMemoryMdcLog::new(1 << 20)));
        info.compact.lock().pco_cnt.cr = 5;
        info.uq.lock().lckpt = 7;

        let objid = ObjId::make(1, ObjType::Mblock, 1);
        let layout = Arc::new(Layout::new_uncommitted(
            objid,
            LayoutDevice { pdh: 0, zaddr: 0, zcnt: 2 },
        ));
        info.insert_uncommitted(Arc::clone(&layout));
        info.commit(objid).unwrap();

        compact_slot(&info).unwrap();

        let mut compact = info.compact.lock();
        assert_eq!(compact.pco_cnt.cobj, 1);
        assert_eq!(compact.pco_cnt.cr, 0);

        let records = compact.handle.as_mut().unwrap().read_all().unwrap();
        assert_eq!(records.len(), 3); // VERSION + OIDCKPT + one OCREATE
        assert!(matches!(
            DefaultRecordCodec::decode(&records[1]).unwrap(),
            Record::OIdCkpt { .. }
        ));
        let decoded = DefaultRecordCodec::decode(&records[2]).unwrap();
        assert_eq!(decoded.objid(), Some(objid));
    }

    #[test]
    fn compacting_mdc0_re_emits_its_pool_properties() {
        let info = MdcInfo::new(0);
        info.compact.lock().handle = Some(Box::new(InMemoryMdcLog::new(1 << 20)));
        *info.mdc0_props.lock() = Some(crate::record::PoolProps {
            version: None,
            devices: vec![crate::record::DeviceConfig {
                uuid: uuid::Uuid::from_u128(1),
                pdh: 0,
                media_class: crate::record::MediaClass::Capacity,
                zone_total: 1_000,
            }],
            unavail: std::collections::HashSet::new(),
            spares: vec![(crate::record::MediaClass::Capacity, 10)],
            pool: Some(crate::record::PoolConfig {
                pool_uuid: uuid::Uuid::from_u128(1),
                pool_name: "pool-a".to_owned(),
            }),
        });

        compact_slot(&info).unwrap();

        let records = info.compact.lock().handle.as_mut().unwrap().read_all().unwrap();
        // VERSION, MCCONFIG, MCSPARE, MPCONFIG, no committed objects.
        assert_eq!(records.len(), 4);
        assert!(matches!(
            DefaultRecordCodec::decode(&records[1]).unwrap(),
            Record::McConfig(_)
        ));
        assert!(matches!(
            DefaultRecordCodec::decode(&records[2]).unwrap(),
            Record::McSpare { .. }
        ));
        assert!(matches!(
            DefaultRecordCodec::decode(&records[3]).unwrap(),
            Record::MpConfig(_)
        ));
    }

    /// A log double that fails `cstart` a fixed number of times before succeeding, to exercise
    /// the retry loop without needing a real log-full scenario.
    #[derive(Debug)]
    struct FlakyLog {
        inner:        InMemoryMdcLog,
        failures_left: u32,
    }

    impl crate::external::MdcLog for FlakyLog {
        fn append(&mut self, record: &[u8]) -> Result<()> {
            self.inner.append(record)
        }

        fn read_all(&mut self) -> Result<Vec<Vec<u8>>> {
            self.inner.read_all()
        }

        fn cstart(&mut self) -> Result<()> {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(PmdError::new(PmdErrorKind::Io, "simulated transient failure"));
            }
            self.inner.cstart()
        }

        fn cend(&mut self) -> Result<()> {
            self.inner.cend()
        }

        fn usage(&self) -> (u64, u64) {
            self.inner.usage()
        }
    }

    #[test]
    fn compaction_retries_transient_failures() {
        let info = MdcInfo::new(1);
        info.compact.lock().handle =
            Some(Box::new(FlakyLog { inner: InMemoryMdcLog::new(4096), failures_left: 2 }));
        compact_slot(&info).unwrap();
    }

    #[test]
    fn compaction_gives_up_after_retry_budget() {
        let info = MdcInfo::new(1);
        info.compact.lock().handle = Some(Box::new(FlakyLog {
            inner: InMemoryMdcLog::new(4096),
            failures_left: MDC_COMPACT_RETRY_DEFAULT + 1,
        }));
        assert_eq!(compact_slot(&info).unwrap_err().kind(), PmdErrorKind::Io);
    }
}
