//! On-media physical log framing for one MDC half.
//!
//! Each half is framed as a sequence of `BLOCK_SIZE` blocks, each block a sequence of physical
//! records `[masked_crc32c(4) | length(2) | type(1) | payload]`, with Full/First/Middle/Last
//! types reassembling logical records split across a block boundary. [`PairedBlockLog`] applies
//! that framing to two halves (active/standby) and exposes the pair through
//! [`crate::external::MdcLog`].

use bijective_enum_map::injective_enum_map;
use thiserror::Error;

use crate::error::{PmdError, PmdErrorKind, Result};
use crate::external::MdcLog;

/// Block size physical records are packed into; a logical record never spans more bytes of a
/// block than `BLOCK_SIZE - HEADER_SIZE` without fragmenting.
pub const BLOCK_SIZE: usize = 32 * 1024;
const HEADER_SIZE: usize = 7;
/// leveldb-style checksum mask so that masked checksums of common bit patterns (all-zero, all-
/// one) don't collide with unmasked CRCs of other data.
const CHECKSUM_MASK_DELTA: u32 = 0xa282_ead8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PhysicalRecordType {
    Full,
    First,
    Middle,
    Last,
}

injective_enum_map! {
    PhysicalRecordType, u8,
    Full   <=> 1,
    First  <=> 2,
    Middle <=> 3,
    Last   <=> 4,
}

fn mask_checksum(unmasked: u32) -> u32 {
    unmasked.rotate_right(15).wrapping_add(CHECKSUM_MASK_DELTA)
}

fn unmask_checksum(masked: u32) -> u32 {
    masked.wrapping_sub(CHECKSUM_MASK_DELTA).rotate_left(15)
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogReadError {
    #[error("checksum mismatch at byte offset {0}")]
    ChecksumMismatch(usize),
    #[error("corrupted record length at byte offset {0}")]
    CorruptedLength(usize),
    #[error("unknown physical record type `{0}` at byte offset {1}")]
    UnknownType(u8, usize),
    #[error("middle/last record without a preceding first, at byte offset {0}")]
    FragmentWithoutFirst(usize),
}

/// One log half: an append-only byte buffer framed into `BLOCK_SIZE` blocks of physical
/// records. Mirrors `WriteLogWriter`'s fields (`remaining_space` tracking, precomputed type
/// checksums) minus the file handle, since the backing store here is an in-memory `Vec<u8>`
/// standing in for the extent an [`crate::external::ExtentIo`] would provide.
#[derive(Debug, Default)]
struct BlockHalf {
    buf: Vec<u8>,
}

impl BlockHalf {
    fn clear(&mut self) {
        self.buf.clear();
    }

    fn used(&self) -> usize {
        self.buf.len()
    }

    fn remaining_in_block(&self) -> usize {
        BLOCK_SIZE - (self.buf.len() % BLOCK_SIZE)
    }

    fn pad_to_block_boundary(&mut self) {
        let pad = self.remaining_in_block();
        if pad < BLOCK_SIZE {
            self.buf.resize(self.buf.len() + pad, 0);
        }
    }

    fn append_logical_record(&mut self, data: &[u8], capacity: usize) -> Result<()> {
        let mut offset = 0usize;
        let mut first = true;
        loop {
            if self.remaining_in_block() < HEADER_SIZE {
                self.pad_to_block_boundary();
            }
            let avail = self.remaining_in_block() - HEADER_SIZE;
            let frag_len = avail.min(data.len() - offset);
            let is_last_frag = offset + frag_len == data.len();
            let rtype = match (first, is_last_frag) {
                (true, true) => PhysicalRecordType::Full,
                (true, false) => PhysicalRecordType::First,
                (false, true) => PhysicalRecordType::Last,
                (false, false) => PhysicalRecordType::Middle,
            };
            self.emit_fragment(&data[offset..offset + frag_len], rtype, capacity)?;
            offset += frag_len;
            first = false;
            if offset >= data.len() {
                break;
            }
        }
        Ok(())
    }

    fn emit_fragment(
        &mut self,
        payload: &[u8],
        rtype: PhysicalRecordType,
        capacity: usize,
    ) -> Result<()> {
        if self.buf.len() + HEADER_SIZE + payload.len() > capacity {
            return Err(PmdError::new(PmdErrorKind::LogFull, "physical log half is full"));
        }
        let len = u16::try_from(payload.len())
            .map_err(|_| PmdError::new(PmdErrorKind::Internal, "record fragment too long"))?;
        let type_byte = u8::from(rtype);

        let mut checksummed = Vec::with_capacity(1 + payload.len());
        checksummed.push(type_byte);
        checksummed.extend_from_slice(payload);
        let checksum = mask_checksum(crc32c::crc32c(&checksummed));

        self.buf.extend_from_slice(&checksum.to_le_bytes());
        self.buf.extend_from_slice(&len.to_le_bytes());
        self.buf.push(type_byte);
        self.buf.extend_from_slice(payload);
        Ok(())
    }

    /// Reassembles every logical record in the half, in append order. A parse error aborts
    /// immediately and reports the byte offset it occurred at rather than silently truncating.
    fn read_all(&self) -> std::result::Result<Vec<Vec<u8>>, LogReadError> {
        let mut records = Vec::new();
        let mut current: Vec<u8> = Vec::new();
        let mut in_progress = false;
        let mut pos = 0usize;

        while pos + HEADER_SIZE <= self.buf.len() {
            let remaining_in_block = BLOCK_SIZE - (pos % BLOCK_SIZE);
            if remaining_in_block < HEADER_SIZE {
                pos += remaining_in_block;
                continue;
            }
            let checksum = u32::from_le_bytes(self.buf[pos..pos + 4].try_into().unwrap());
            let len = u16::from_le_bytes(self.buf[pos + 4..pos + 6].try_into().unwrap()) as usize;
            let type_byte = self.buf[pos + 6];
            let payload_start = pos + HEADER_SIZE;
            let payload_end = payload_start + len;
            if payload_end > self.buf.len() || payload_end > pos + BLOCK_SIZE {
                return Err(LogReadError::CorruptedLength(pos));
            }
            let payload = &self.buf[payload_start..payload_end];

            let mut checksummed = Vec::with_capacity(1 + payload.len());
            checksummed.push(type_byte);
            checksummed.extend_from_slice(payload);
            if unmask_checksum(checksum) != crc32c::crc32c(&checksummed) {
                return Err(LogReadError::ChecksumMismatch(pos));
            }

            let rtype = PhysicalRecordType::try_from(type_byte)
                .map_err(|()| LogReadError::UnknownType(type_byte, pos))?;
            match rtype {
                PhysicalRecordType::Full => {
                    records.push(payload.to_vec());
                    in_progress = false;
                    current.clear();
                }
                PhysicalRecordType::First => {
                    current.clear();
                    current.extend_from_slice(payload);
                    in_progress = true;
                }
                PhysicalRecordType::Middle => {
                    if !in_progress {
                        return Err(LogReadError::FragmentWithoutFirst(pos));
                    }
                    current.extend_from_slice(payload);
                }
                PhysicalRecordType::Last => {
                    if !in_progress {
                        return Err(LogReadError::FragmentWithoutFirst(pos));
                    }
                    current.extend_from_slice(payload);
                    records.push(std::mem::take(&mut current));
                    in_progress = false;
                }
            }
            pos = payload_end;
        }
        Ok(records)
    }
}

/// An MDC's active/standby log pair, framed in `BLOCK_SIZE` blocks. The
/// concrete [`MdcLog`] implementation used wherever this crate needs real on-media framing
/// instead of the test-only [`crate::external::InMemoryMdcLog`].
#[derive(Debug)]
pub struct PairedBlockLog {
    active:     BlockHalf,
    standby:    BlockHalf,
    compacting: bool,
    capacity:   usize,
}

impl PairedBlockLog {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { active: BlockHalf::default(), standby: BlockHalf::default(), compacting: false, capacity }
    }
}

impl MdcLog for PairedBlockLog {
    fn append(&mut self, record: &[u8]) -> Result<()> {
        let half = if self.compacting { &mut self.standby } else { &mut self.active };
        half.append_logical_record(record, self.capacity)
    }

    fn read_all(&mut self) -> Result<Vec<Vec<u8>>> {
        self.active
            .read_all()
            .map_err(|err| PmdError::with_source(PmdErrorKind::Io, "corrupt MDC log", err))
    }

    fn cstart(&mut self) -> Result<()> {
        self.standby.clear();
        self.compacting = true;
        Ok(())
    }

    fn cend(&mut self) -> Result<()> {
        if !self.compacting {
            return Err(PmdError::new(PmdErrorKind::Internal, "cend without matching cstart"));
        }
        std::mem::swap(&mut self.active, &mut self.standby);
        self.standby.clear();
        self.compacting = false;
        Ok(())
    }

    fn usage(&self) -> (u64, u64) {
        (self.active.used() as u64, self.capacity as u64)
    }
}
