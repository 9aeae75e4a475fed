//! Record append with log-full retry.
//!
//! An MDC's log is all-or-nothing per logical record: a failed append never leaves a partial
//! record behind. Appends fail closed and let the caller decide whether to retry; here that
//! means one compact-and-retry, since a single compaction is always expected to make room.

use crate::compaction;
use crate::error::{PmdError, PmdErrorKind, Result};
use crate::mdc_info::MdcInfo;
use crate::record::{DefaultRecordCodec, Record, RecordCodec};

/// Appends one record to `info`'s active log half. On `LogFull`, compacts the slot once and
/// retries; a second `LogFull` after compaction is reported as-is.
pub fn mdc_addrec(info: &MdcInfo, record: &Record) -> Result<()> {
    let mut buf = Vec::new();
    DefaultRecordCodec::encode(record, &mut buf);

    match append_encoded(info, &buf) {
        Err(err) if err.kind() == PmdErrorKind::LogFull => {
            compaction::compact_slot(info)?;
            append_encoded(info, &buf)
        }
        other => other,
    }
    .inspect(|_| bump_counters(info, record))
}

fn append_encoded(info: &MdcInfo, buf: &[u8]) -> Result<()> {
    let mut compact = info.compact.lock();
    let handle = compact
        .handle
        .as_mut()
        .ok_or_else(|| PmdError::new(PmdErrorKind::Internal, "mdc slot has no open log handle"))?;
    handle.append(buf)
}

fn bump_counters(info: &MdcInfo, record: &Record) {
    let mut compact = info.compact.lock();
    let pco = &mut compact.pco_cnt;
    match record {
        Record::OCreate { .. } => pco.cr += 1,
        Record::ODelete { .. } => pco.del += 1,
        Record::OErase { .. } => pco.er += 1,
        Record::OUpdate { .. } => pco.up += 1,
        Record::OIdCkpt { .. }
        | Record::Version(_)
        | Record::McConfig(_)
        | Record::McSpare { .. }
        | Record::MpConfig(_) => {}
    }
}
