//! Sector-addressed block devices.
//!
//! ```text
//!   filesystem ── read(offset, size) / write(offset, data)
//!        │
//!      Disk ──── byte range → sector range, read-modify-write of edges
//!        │
//!   DiskCache ── (when caching is on) LRU, dirty write-back
//!        │
//!  DiskBackend ─ IDE PIO / IDE DMA / memory / DiskSlice
//! ```

pub mod cache;
pub mod completion;
pub mod partition;
pub mod ram;
pub mod registry;
pub mod slice;

#[cfg(test)]
pub mod testing;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use crate::memory::MemoryGauge;
use crate::tasking::SleepLock;
pub use cache::{CacheStats, DiskCache};
pub use registry::{DiskRegistry, DISKS};
pub use slice::DiskSlice;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskError {
    BadSector,
    NoMedia,
    Aborted,
    Unknown,
    TimeOut,
}

impl fmt::Display for DiskError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DiskError::BadSector => write!(f, "Bad sector"),
            DiskError::NoMedia => write!(f, "No media"),
            DiskError::Aborted => write!(f, "Command aborted"),
            DiskError::Unknown => write!(f, "Unknown disk error"),
            DiskError::TimeOut => write!(f, "Timed out"),
        }
    }
}

pub type DiskResult<T> = Result<T, DiskError>;

/// A registered disk. The lock may be held across blocking I/O.
pub type SharedDisk = Arc<SleepLock<Disk>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    HardDisk,
    Optical,
    Memory,
}

/// Sector-granular device. Implemented by the hardware drivers, the memory
/// disk and `DiskSlice`.
pub trait DiskBackend: Send {
    fn drive_name(&self) -> &str;

    fn media_type(&self) -> MediaType {
        MediaType::HardDisk
    }

    fn sector_size(&self) -> usize;

    /// Capacity in bytes.
    fn disk_size(&self) -> u64;

    /// Read `count` sectors starting at `sector`; returns `count * sector_size()` bytes.
    fn read_sector(&mut self, sector: u64, count: usize) -> DiskResult<Vec<u8>>;

    /// Write whole sectors starting at `sector`.
    fn write_sector(&mut self, sector: u64, data: &[u8]) -> DiskResult<()>;

    fn flush_hardware_cache(&mut self) -> DiskResult<()> {
        Ok(())
    }
}

/// A block device as seen by filesystems: byte-range access on top of a
/// backend, optionally through a sector cache.
pub struct Disk {
    backend: Box<dyn DiskBackend>,
    cache: DiskCache,
    caching: bool,
}

impl Disk {
    /// Wrap `backend` with a cache governed by the kernel heap gauge.
    pub fn new(backend: Box<dyn DiskBackend>) -> Self {
        Self::with_gauge(backend, Arc::new(crate::memory::HeapGauge))
    }

    pub fn with_gauge(backend: Box<dyn DiskBackend>, gauge: Arc<dyn MemoryGauge>) -> Self {
        let cache = DiskCache::new(backend.sector_size(), gauge);
        Disk {
            backend,
            cache,
            caching: true,
        }
    }

    pub fn drive_name(&self) -> &str {
        self.backend.drive_name()
    }

    pub fn media_type(&self) -> MediaType {
        self.backend.media_type()
    }

    pub fn sector_size(&self) -> usize {
        self.backend.sector_size()
    }

    pub fn disk_size(&self) -> u64 {
        self.backend.disk_size()
    }

    pub fn sector_count(&self) -> u64 {
        self.disk_size() / self.sector_size() as u64
    }

    pub fn caching(&self) -> bool {
        self.caching
    }

    /// Toggle the cache. Turning it off does not flush; call `flush_cache`
    /// first if dirty sectors must reach the device.
    pub fn enable_caching(&mut self, enabled: bool) {
        if enabled && !self.caching {
            // Direct reads/writes may have moved the device on meanwhile.
            self.cache.discard_clean();
        }
        self.caching = enabled;
    }

    pub fn cache(&self) -> &DiskCache {
        &self.cache
    }

    pub fn gauge(&self) -> Arc<dyn MemoryGauge> {
        self.cache.gauge()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn set_cache_ratio(&mut self, ratio: u8) -> DiskResult<()> {
        self.cache.set_ratio(&mut *self.backend, ratio)
    }

    /// Write back and drop every cached sector, then flush the device.
    pub fn flush_cache(&mut self) -> DiskResult<()> {
        self.cache.flush(&mut *self.backend)?;
        self.backend.flush_hardware_cache()
    }

    /// Write back dirty sectors but keep them cached.
    pub fn sync(&mut self) -> DiskResult<()> {
        self.cache.sync(&mut *self.backend)?;
        self.backend.flush_hardware_cache()
    }

    /// Sector-granular read, through the cache when enabled.
    pub fn read_sectors(&mut self, sector: u64, count: usize) -> DiskResult<Vec<u8>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        if self.caching {
            self.cache.read_sector(&mut *self.backend, sector, count)
        } else {
            // Dirty sectors left over from cached operation are newer than
            // the device.
            self.cache.evict_span(&mut *self.backend, sector, count)?;
            self.backend.read_sector(sector, count)
        }
    }

    /// Sector-granular write, through the cache when enabled.
    pub fn write_sectors(&mut self, sector: u64, data: &[u8]) -> DiskResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        if data.len() % self.sector_size() != 0 {
            return Err(DiskError::Aborted);
        }
        if self.caching {
            self.cache.write_sector(&mut *self.backend, sector, data)
        } else {
            let count = data.len() / self.sector_size();
            self.cache.evict_span(&mut *self.backend, sector, count)?;
            self.backend.write_sector(sector, data)
        }
    }

    fn check_range(&self, offset: u64, size: usize) -> DiskResult<()> {
        match offset.checked_add(size as u64) {
            Some(end) if end <= self.disk_size() => Ok(()),
            _ => Err(DiskError::BadSector),
        }
    }

    /// Read `size` bytes at byte `offset`.
    pub fn read(&mut self, offset: u64, size: usize) -> DiskResult<Vec<u8>> {
        if size == 0 {
            return Ok(Vec::new());
        }
        self.check_range(offset, size)?;

        let ss = self.sector_size() as u64;
        let first = offset / ss;
        let last = (offset + size as u64 - 1) / ss;
        let mut data = self.read_sectors(first, (last - first + 1) as usize)?;

        let start = (offset % ss) as usize;
        data.truncate(start + size);
        data.drain(..start);
        Ok(data)
    }

    /// Write `data` at byte `offset`. Partially covered edge sectors are
    /// read first so their untouched bytes survive.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> DiskResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.check_range(offset, data.len())?;

        let ss = self.sector_size() as u64;
        let end = offset + data.len() as u64;
        let first = offset / ss;
        let last = (end - 1) / ss;
        let count = (last - first + 1) as usize;
        let head = (offset % ss) as usize;

        if head == 0 && end % ss == 0 {
            return self.write_sectors(first, data);
        }

        let ss = ss as usize;
        let mut buf = vec![0u8; count * ss];
        if head != 0 {
            let sector = self.read_sectors(first, 1)?;
            buf[..ss].copy_from_slice(&sector);
        }
        if end % ss as u64 != 0 && (last != first || head == 0) {
            let sector = self.read_sectors(last, 1)?;
            buf[(count - 1) * ss..].copy_from_slice(&sector);
        }
        buf[head..head + data.len()].copy_from_slice(data);
        self.write_sectors(first, &buf)
    }
}
