//! External-collaborator seams: `SpaceMap`, `ExtentIo`, `MdcLog`, `Superblock`.
//!
//! These name the boundary to subsystems this crate does not implement (device space
//! accounting, physical extent I/O, superblock persistence). Each trait gets a minimal contract
//! plus an in-memory reference implementation used by this crate's own tests, with a real
//! implementation expected to live outside this crate.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::error::{PmdError, PmdErrorKind, Result};
use crate::layout::LayoutDevice;

/// Device-local space accounting. Real
/// implementations track per-zone free/used state across the whole pool; PMD only ever asks for
/// contiguous extents and returns them whole.
pub trait SpaceMap: fmt::Debug + Send + Sync {
    fn alloc(&self, pdh: u16, zcnt: u32) -> Result<LayoutDevice>;
    fn free(&self, ld: LayoutDevice) -> Result<()>;
    /// Free zone count on `pdh`, consulted by the selector and the allocator.
    fn free_zones(&self, pdh: u16) -> Result<u64>;
    /// Marks zones already known to be in use (replayed from a log, not freshly allocated) as
    /// reserved, without picking new ones. Used by activation to re-seed the space map from a
    /// slot's committed layouts.
    fn insert(&self, ld: LayoutDevice) -> Result<()>;
}

/// Physical extent I/O. PMD
/// itself never interprets mblock contents; it only ever erases or relocates whole extents.
pub trait ExtentIo: fmt::Debug + Send + Sync {
    fn erase(&self, ld: LayoutDevice) -> Result<()>;
    fn write(&self, ld: LayoutDevice, offset: u64, data: &[u8]) -> Result<()>;
    fn read(&self, ld: LayoutDevice, offset: u64, len: usize) -> Result<Vec<u8>>;
    /// Prepares a freshly reserved extent for use as the backing store of `ld`. Called once per
    /// successful `SpaceMap::alloc`, before the layout is handed to a caller.
    fn layout_alloc(&self, ld: LayoutDevice) -> Result<()>;
}

/// One MDC's paired active/standby log. `cstart`/`cend` bracket a compaction:
/// everything appended between them targets the standby half, and `cend` is the atomic cutover
/// that makes the standby active.
pub trait MdcLog: fmt::Debug + Send {
    /// Appends one already-encoded record to the currently active half. Returns `LogFull` if the
    /// active half has no room; the caller compacts and retries.
    fn append(&mut self, record: &[u8]) -> Result<()>;

    /// Replays every record in the currently active half, in append order.
    fn read_all(&mut self) -> Result<Vec<Vec<u8>>>;

    /// Begins a compaction: resets the standby half to empty and directs subsequent `append`s to
    /// it.
    fn cstart(&mut self) -> Result<()>;

    /// Completes a compaction: atomically swaps standby to active. Must not be called
    /// without a preceding `cstart`.
    fn cend(&mut self) -> Result<()>;

    /// Bytes used and total capacity of the active half, consulted by `need_compact`.
    fn usage(&self) -> (u64, u64);
}

/// Where the pool's root MDC (MDC0) pair lives on media.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mdc0Location {
    pub active:  LayoutDevice,
    pub standby: LayoutDevice,
}

/// Durable pointer to MDC0 plus whatever small amount of pool-identity data must be readable
/// before any MDC can be opened.
pub trait Superblock: fmt::Debug + Send + Sync {
    fn write_mdc0_location(&self, loc: Mdc0Location) -> Result<()>;
    fn read_mdc0_location(&self) -> Result<Mdc0Location>;
}

/// In-memory [`SpaceMap`] used by this crate's own tests: one shared free-zone counter per
/// device, no notion of fragmentation.
#[derive(Debug)]
pub struct InMemorySpaceMap {
    free_by_device: Mutex<Vec<u64>>,
    next_zaddr:     AtomicU32,
}

impl InMemorySpaceMap {
    #[must_use]
    pub fn new(free_zones_per_device: Vec<u64>) -> Self {
        Self { free_by_device: Mutex::new(free_zones_per_device), next_zaddr: AtomicU32::new(0) }
    }
}

impl SpaceMap for InMemorySpaceMap {
    fn alloc(&self, pdh: u16, zcnt: u32) -> Result<LayoutDevice> {
        let mut free = self.free_by_device.lock();
        let slot = free.get_mut(pdh as usize).ok_or_else(|| {
            PmdError::new(PmdErrorKind::DeviceUnavailable, format!("no such device {pdh}"))
        })?;
        if *slot < u64::from(zcnt) {
            return Err(PmdError::new(
                PmdErrorKind::NoSpace,
                format!("device {pdh} has {slot} zones free, need {zcnt}"),
            ));
        }
        *slot -= u64::from(zcnt);
        let zaddr = u64::from(self.next_zaddr.fetch_add(zcnt, Ordering::Relaxed));
        Ok(LayoutDevice { pdh, zaddr, zcnt })
    }

    fn free(&self, ld: LayoutDevice) -> Result<()> {
        let mut free = self.free_by_device.lock();
        let slot = free.get_mut(ld.pdh as usize).ok_or_else(|| {
            PmdError::new(PmdErrorKind::DeviceUnavailable, format!("no such device {}", ld.pdh))
        })?;
        *slot += u64::from(ld.zcnt);
        Ok(())
    }

    fn free_zones(&self, pdh: u16) -> Result<u64> {
        self.free_by_device
            .lock()
            .get(pdh as usize)
            .copied()
            .ok_or_else(|| PmdError::new(PmdErrorKind::DeviceUnavailable, format!("no such device {pdh}")))
    }

    fn insert(&self, ld: LayoutDevice) -> Result<()> {
        let mut free = self.free_by_device.lock();
        let slot = free.get_mut(ld.pdh as usize).ok_or_else(|| {
            PmdError::new(PmdErrorKind::DeviceUnavailable, format!("no such device {}", ld.pdh))
        })?;
        *slot = slot.saturating_sub(u64::from(ld.zcnt));
        Ok(())
    }
}

/// In-memory [`ExtentIo`]: extents are just zeroed byte vectors keyed by `(pdh, zaddr)`.
#[derive(Debug, Default)]
pub struct InMemoryExtentIo {
    extents: Mutex<std::collections::HashMap<(u16, u64), Vec<u8>>>,
}

impl InMemoryExtentIo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExtentIo for InMemoryExtentIo {
    fn erase(&self, ld: LayoutDevice) -> Result<()> {
        self.extents.lock().remove(&(ld.pdh, ld.zaddr));
        Ok(())
    }

    fn layout_alloc(&self, ld: LayoutDevice) -> Result<()> {
        self.extents.lock().entry((ld.pdh, ld.zaddr)).or_default();
        Ok(())
    }

    fn write(&self, ld: LayoutDevice, offset: u64, data: &[u8]) -> Result<()> {
        let mut extents = self.extents.lock();
        let buf = extents.entry((ld.pdh, ld.zaddr)).or_default();
        let start = offset as usize;
        let end = start + data.len();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[start..end].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, ld: LayoutDevice, offset: u64, len: usize) -> Result<Vec<u8>> {
        let extents = self.extents.lock();
        let buf = extents.get(&(ld.pdh, ld.zaddr)).ok_or_else(|| {
            PmdError::new(PmdErrorKind::NotFound, format!("no extent at {}:{}", ld.pdh, ld.zaddr))
        })?;
        let start = offset as usize;
        let end = start + len;
        buf.get(start..end)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| PmdError::new(PmdErrorKind::InvalidArgument, "read past extent end"))
    }
}

/// In-memory [`MdcLog`]: each half is a plain queue of already-encoded records, with no block
/// framing. `write_log.rs` provides the on-media framing this stands in for.
#[derive(Debug, Default)]
pub struct InMemoryMdcLog {
    active:        VecDeque<Vec<u8>>,
    standby:       VecDeque<Vec<u8>>,
    compacting:    bool,
    capacity_hint: u64,
}

impl InMemoryMdcLog {
    #[must_use]
    pub fn new(capacity_hint: u64) -> Self {
        Self { active: VecDeque::new(), standby: VecDeque::new(), compacting: false, capacity_hint }
    }
}

impl MdcLog for InMemoryMdcLog {
    fn append(&mut self, record: &[u8]) -> Result<()> {
        let (used, cap) = self.usage();
        if used + record.len() as u64 > cap {
            return Err(PmdError::new(PmdErrorKind::LogFull, "active log half is full"));
        }
        let target = if self.compacting { &mut self.standby } else { &mut self.active };
        target.push_back(record.to_vec());
        Ok(())
    }

    fn read_all(&mut self) -> Result<Vec<Vec<u8>>> {
        Ok(self.active.iter().cloned().collect())
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
        let used: u64 = self.active.iter().map(|r| r.len() as u64).sum();
        (used, self.capacity_hint)
    }
}

/// In-memory [`Superblock`]: one cell, overwritten on every write.
#[derive(Debug, Default)]
pub struct InMemorySuperblock {
    location: Mutex<Option<Mdc0Location>>,
}

impl InMemorySuperblock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Superblock for InMemorySuperblock {
    fn write_mdc0_location(&self, loc: Mdc0Location) -> Result<()> {
        *self.location.lock() = Some(loc);
        Ok(())
    }

    fn read_mdc0_location(&self) -> Result<Mdc0Location> {
        self.location.lock().ok_or_else(|| PmdError::new(PmdErrorKind::NotFound, "superblock not written"))
    }
}
