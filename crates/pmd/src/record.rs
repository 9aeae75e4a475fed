//! OMF record model and codec adapter.
//!
//! Real OMF pack/unpack is an out-of-scope collaborator; this module is PMD's thin boundary to
//! it: tag-prefixed, varint-encoded fields, with an `injective_enum_map!` tag mapping between
//! record variants and their on-wire tag values.

use bijective_enum_map::injective_enum_map;
use integer_encoding::{VarInt as _, VarIntWriter as _};
use thiserror::Error;
use uuid::Uuid;

use crate::ids::ObjId;
use crate::layout::LayoutDevice;

/// On-media content-version, `major.minor.patch.dot`. Compared lexicographically, so
/// `ContentVersion::new(1, 0, 0, 1)` reads as "1.0.0.1".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ContentVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
    pub dot:   u16,
}

impl ContentVersion {
    #[must_use]
    pub const fn new(major: u16, minor: u16, patch: u16, dot: u16) -> Self {
        Self { major, minor, patch, dot }
    }
}

/// The version at which OIDCKPT-on-compaction and the MDC VERSION record were introduced;
/// compaction and allocation gate several behaviors on `content_version >= LATEST`.
pub const LATEST_CONTENT_VERSION: ContentVersion = ContentVersion::new(1, 0, 0, 1);

/// The pool's media classes. A concrete,
/// fixed-size enumeration rather than an open string set, matching `MP_MED_NUMBER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MediaClass {
    Capacity = 0,
    Staging  = 1,
    Class2   = 2,
    Class3   = 3,
}

impl MediaClass {
    pub const ALL: [Self; crate::ids::MP_MED_NUMBER] =
        [Self::Capacity, Self::Staging, Self::Class2, Self::Class3];
}

impl TryFrom<u8> for MediaClass {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Capacity),
            1 => Ok(Self::Staging),
            2 => Ok(Self::Class2),
            3 => Ok(Self::Class3),
            _ => Err(()),
        }
    }
}

/// One device, as recorded in an `MCCONFIG` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    pub uuid:        Uuid,
    pub pdh:         u16,
    pub media_class: MediaClass,
    pub zone_total:  u64,
}

/// Pool-wide config, as recorded in the single `MPCONFIG` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub pool_uuid: Uuid,
    pub pool_name: String,
}

/// Pool-wide properties carried by MDC0: device map, spare percentages, pool identity. Non-MDC0
/// slots never populate this. Kept here (rather than in the activation module that builds it) so
/// `MdcInfo` can hold a copy of MDC0's own properties for compaction to re-emit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolProps {
    pub version: Option<ContentVersion>,
    pub devices: Vec<DeviceConfig>,
    /// Device uuids that are currently marked UNAVAIL (either matched-but-unavailable, or a
    /// phantom never previously logged).
    pub unavail: std::collections::HashSet<Uuid>,
    pub spares:  Vec<(MediaClass, u8)>,
    pub pool:    Option<PoolConfig>,
}

/// One logical MDC record.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Version(ContentVersion),
    OCreate { objid: ObjId, ld: LayoutDevice, gen: u64, mblen: u64 },
    ODelete { objid: ObjId },
    OIdCkpt { objid: ObjId },
    OErase { objid: ObjId, gen: u64 },
    OUpdate { objid: ObjId, ld: LayoutDevice, gen: u64, mblen: u64 },
    McConfig(DeviceConfig),
    McSpare { media_class: MediaClass, spare_pct: u8 },
    MpConfig(PoolConfig),
}

impl Record {
    #[must_use]
    pub const fn objid(&self) -> Option<ObjId> {
        match self {
            Self::OCreate { objid, .. }
            | Self::ODelete { objid }
            | Self::OIdCkpt { objid }
            | Self::OErase { objid, .. }
            | Self::OUpdate { objid, .. } => Some(*objid),
            Self::Version(_) | Self::McConfig(_) | Self::McSpare { .. } | Self::MpConfig(_) => {
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum RecordTag {
    Version,
    OCreate,
    ODelete,
    OIdCkpt,
    OErase,
    OUpdate,
    McConfig,
    McSpare,
    MpConfig,
}

injective_enum_map! {
    RecordTag, u32,
    Version  <=> 1,
    OCreate  <=> 2,
    ODelete  <=> 3,
    OIdCkpt  <=> 4,
    OErase   <=> 5,
    OUpdate  <=> 6,
    McConfig <=> 7,
    McSpare  <=> 8,
    MpConfig <=> 9,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordCodecError {
    #[error("truncated or malformed record")]
    Malformed,
    #[error("unknown record tag `{0}`")]
    UnknownTag(u32),
    #[error("unknown media class `{0}`")]
    UnknownMediaClass(u8),
}

/// Pack/unpack of [`Record`]s. Each record stands alone (unlike a batched multi-field edit
/// record), so there is no "while input is nonempty, read one field" loop — just one tag and
/// its payload.
pub trait RecordCodec {
    fn encode(record: &Record, out: &mut Vec<u8>);
    fn decode(input: &[u8]) -> Result<Record, RecordCodecError>;
}

/// The default (and, in this crate, only) [`RecordCodec`] implementation.
pub struct DefaultRecordCodec;

impl RecordCodec for DefaultRecordCodec {
    fn encode(record: &Record, out: &mut Vec<u8>) {
        match record {
            Record::Version(v) => {
                write_tag(out, RecordTag::Version);
                write_u16(out, v.major);
                write_u16(out, v.minor);
                write_u16(out, v.patch);
                write_u16(out, v.dot);
            }
            Record::OCreate { objid, ld, gen, mblen } => {
                write_tag(out, RecordTag::OCreate);
                write_objid(out, *objid);
                write_ld(out, *ld);
                write_varint(out, *gen);
                write_varint(out, *mblen);
            }
            Record::ODelete { objid } => {
                write_tag(out, RecordTag::ODelete);
                write_objid(out, *objid);
            }
            Record::OIdCkpt { objid } => {
                write_tag(out, RecordTag::OIdCkpt);
                write_objid(out, *objid);
            }
            Record::OErase { objid, gen } => {
                write_tag(out, RecordTag::OErase);
                write_objid(out, *objid);
                write_varint(out, *gen);
            }
            Record::OUpdate { objid, ld, gen, mblen } => {
                write_tag(out, RecordTag::OUpdate);
                write_objid(out, *objid);
                write_ld(out, *ld);
                write_varint(out, *gen);
                write_varint(out, *mblen);
            }
            Record::McConfig(dc) => {
                write_tag(out, RecordTag::McConfig);
                out.extend_from_slice(dc.uuid.as_bytes());
                write_u16(out, dc.pdh);
                out.push(dc.media_class as u8);
                write_varint(out, dc.zone_total);
            }
            Record::McSpare { media_class, spare_pct } => {
                write_tag(out, RecordTag::McSpare);
                out.push(*media_class as u8);
                out.push(*spare_pct);
            }
            Record::MpConfig(pc) => {
                write_tag(out, RecordTag::MpConfig);
                out.extend_from_slice(pc.pool_uuid.as_bytes());
                write_bytes(out, pc.pool_name.as_bytes());
            }
        }
    }

    fn decode(mut input: &[u8]) -> Result<Record, RecordCodecError> {
        let tag = read_tag(&mut input)?;
        let record = match tag {
            RecordTag::Version => Record::Version(ContentVersion::new(
                read_u16(&mut input)?,
                read_u16(&mut input)?,
                read_u16(&mut input)?,
                read_u16(&mut input)?,
            )),
            RecordTag::OCreate => {
                let objid = read_objid(&mut input)?;
                let ld = read_ld(&mut input)?;
                let gen = read_varint(&mut input)?;
                let mblen = read_varint(&mut input)?;
                Record::OCreate { objid, ld, gen, mblen }
            }
            RecordTag::ODelete => Record::ODelete { objid: read_objid(&mut input)? },
            RecordTag::OIdCkpt => Record::OIdCkpt { objid: read_objid(&mut input)? },
            RecordTag::OErase => {
                let objid = read_objid(&mut input)?;
                let gen = read_varint(&mut input)?;
                Record::OErase { objid, gen }
            }
            RecordTag::OUpdate => {
                let objid = read_objid(&mut input)?;
                let ld = read_ld(&mut input)?;
                let gen = read_varint(&mut input)?;
                let mblen = read_varint(&mut input)?;
                Record::OUpdate { objid, ld, gen, mblen }
            }
            RecordTag::McConfig => {
                let uuid = read_uuid(&mut input)?;
                let pdh = read_u16(&mut input)?;
                let media_class = read_media_class(&mut input)?;
                let zone_total = read_varint(&mut input)?;
                Record::McConfig(DeviceConfig { uuid, pdh, media_class, zone_total })
            }
            RecordTag::McSpare => {
                let media_class = read_media_class(&mut input)?;
                let spare_pct = read_u8(&mut input)?;
                Record::McSpare { media_class, spare_pct }
            }
            RecordTag::MpConfig => {
                let pool_uuid = read_uuid(&mut input)?;
                let pool_name = String::from_utf8(read_bytes(&mut input)?.to_vec())
                    .map_err(|_| RecordCodecError::Malformed)?;
                Record::MpConfig(PoolConfig { pool_uuid, pool_name })
            }
        };
        Ok(record)
    }
}

fn write_tag(out: &mut Vec<u8>, tag: RecordTag) {
    out.write_varint(u32::from(tag)).expect("writing to a Vec does not fail");
}

fn read_tag(input: &mut &[u8]) -> Result<RecordTag, RecordCodecError> {
    let raw = read_varint_u32(input)?;
    RecordTag::try_from(raw).map_err(|()| RecordCodecError::UnknownTag(raw))
}

fn write_varint(out: &mut Vec<u8>, value: u64) {
    out.write_varint(value).expect("writing to a Vec does not fail");
}

fn read_varint(input: &mut &[u8]) -> Result<u64, RecordCodecError> {
    let (value, len) = u64::decode_var(input).ok_or(RecordCodecError::Malformed)?;
    *input = &input[len..];
    Ok(value)
}

fn read_varint_u32(input: &mut &[u8]) -> Result<u32, RecordCodecError> {
    let (value, len) = u32::decode_var(input).ok_or(RecordCodecError::Malformed)?;
    *input = &input[len..];
    Ok(value)
}

fn write_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn read_u16(input: &mut &[u8]) -> Result<u16, RecordCodecError> {
    let bytes: [u8; 2] = input.get(..2).ok_or(RecordCodecError::Malformed)?
        .try_into().expect("slice of length 2");
    *input = &input[2..];
    Ok(u16::from_le_bytes(bytes))
}

fn read_u8(input: &mut &[u8]) -> Result<u8, RecordCodecError> {
    let &byte = input.first().ok_or(RecordCodecError::Malformed)?;
    *input = &input[1..];
    Ok(byte)
}

fn write_bytes(out: &mut Vec<u8>, data: &[u8]) {
    #[expect(clippy::cast_possible_truncation, reason = "record payloads are far under 4GB")]
    write_varint(out, data.len() as u64);
    out.extend_from_slice(data);
}

fn read_bytes<'a>(input: &mut &'a [u8]) -> Result<&'a [u8], RecordCodecError> {
    let len = read_varint(input)? as usize;
    let data = input.get(..len).ok_or(RecordCodecError::Malformed)?;
    *input = &input[len..];
    Ok(data)
}

fn read_uuid(input: &mut &[u8]) -> Result<Uuid, RecordCodecError> {
    let bytes: [u8; 16] = input.get(..16).ok_or(RecordCodecError::Malformed)?
        .try_into().expect("slice of length 16");
    *input = &input[16..];
    Ok(Uuid::from_bytes(bytes))
}

fn read_media_class(input: &mut &[u8]) -> Result<MediaClass, RecordCodecError> {
    let byte = read_u8(input)?;
    MediaClass::try_from(byte).map_err(|()| RecordCodecError::UnknownMediaClass(byte))
}

fn write_objid(out: &mut Vec<u8>, objid: ObjId) {
    write_varint(out, objid.0);
}

fn read_objid(input: &mut &[u8]) -> Result<ObjId, RecordCodecError> {
    read_varint(input).map(ObjId)
}

fn write_ld(out: &mut Vec<u8>, ld: LayoutDevice) {
    write_u16(out, ld.pdh);
    write_varint(out, ld.zaddr);
    write_varint(out, u64::from(ld.zcnt));
}

fn read_ld(input: &mut &[u8]) -> Result<LayoutDevice, RecordCodecError> {
    let pdh = read_u16(input)?;
    let zaddr = read_varint(input)?;
    let zcnt = u32::try_from(read_varint(input)?).map_err(|_| RecordCodecError::Malformed)?;
    Ok(LayoutDevice { pdh, zaddr, zcnt })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ObjType;

    fn roundtrip(record: &Record) {
        let mut buf = Vec::new();
        DefaultRecordCodec::encode(record, &mut buf);
        let decoded = DefaultRecordCodec::decode(&buf).expect("decodes");
        assert_eq!(&decoded, record);
    }

    #[test]
    fn version_roundtrips() {
        roundtrip(&Record::Version(LATEST_CONTENT_VERSION));
    }

    #[test]
    fn ocreate_roundtrips() {
        roundtrip(&Record::OCreate {
            objid: ObjId::make(9, ObjType::Mblock, 3),
            ld:    LayoutDevice { pdh: 2, zaddr: 100, zcnt: 4 },
            gen:   0,
            mblen: 4096,
        });
    }

    #[test]
    fn odelete_and_oidckpt_and_oerase_roundtrip() {
        let id = ObjId::make(9, ObjType::Mlog, 3);
        roundtrip(&Record::ODelete { objid: id });
        roundtrip(&Record::OIdCkpt { objid: id });
        roundtrip(&Record::OErase { objid: id, gen: 5 });
    }

    #[test]
    fn mcconfig_mcspare_mpconfig_roundtrip() {
        let uuid = Uuid::from_u128(42);
        roundtrip(&Record::McConfig(DeviceConfig {
            uuid,
            pdh: 1,
            media_class: MediaClass::Capacity,
            zone_total: 1_000_000,
        }));
        roundtrip(&Record::McSpare { media_class: MediaClass::Staging, spare_pct: 10 });
        roundtrip(&Record::MpConfig(PoolConfig {
            pool_uuid: uuid,
            pool_name: "my-pool".to_owned(),
        }));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 999);
        let err = DefaultRecordCodec::decode(&buf).unwrap_err();
        assert_eq!(err, RecordCodecError::UnknownTag(999));
    }

    #[test]
    fn truncated_record_is_rejected() {
        let mut buf = Vec::new();
        write_tag(&mut buf, RecordTag::OErase);
        write_objid(&mut buf, ObjId::make(1, ObjType::Mlog, 0));
        // Missing the gen varint.
        assert_eq!(DefaultRecordCodec::decode(&buf).unwrap_err(), RecordCodecError::Malformed);
    }
}
