//! Host-side doubles for the disk layer tests.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

use super::{DiskBackend, DiskError, DiskResult};
use crate::memory::MemoryGauge;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Read(u64, usize),
    Write(u64, usize),
}

struct Inner {
    image: Vec<u8>,
    ops: Vec<Op>,
    failing_sector: Option<u64>,
    hardware_flushes: usize,
}

/// Memory-backed disk that logs every backend call. Clones share state, so
/// a test can keep a handle after boxing one into a `Disk`.
#[derive(Clone)]
pub struct RecordingDisk {
    name: String,
    sector_size: usize,
    inner: Arc<Mutex<Inner>>,
}

impl RecordingDisk {
    pub fn new(name: &str, sector_size: usize, sectors: u64) -> Self {
        RecordingDisk {
            name: String::from(name),
            sector_size,
            inner: Arc::new(Mutex::new(Inner {
                image: vec![0; sector_size * sectors as usize],
                ops: Vec::new(),
                failing_sector: None,
                hardware_flushes: 0,
            })),
        }
    }

    pub fn ops(&self) -> Vec<Op> {
        self.inner.lock().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.inner.lock().ops.clear();
    }

    pub fn writes(&self) -> Vec<Op> {
        self.ops().into_iter().filter(|op| matches!(op, Op::Write(..))).collect()
    }

    pub fn sector(&self, sector: u64) -> Vec<u8> {
        let start = sector as usize * self.sector_size;
        self.inner.lock().image[start..start + self.sector_size].to_vec()
    }

    pub fn fill(&self, byte: u8) {
        self.inner.lock().image.fill(byte);
    }

    pub fn load(&self, offset: usize, data: &[u8]) {
        self.inner.lock().image[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Make every write touching `sector` fail with `BadSector`.
    pub fn fail_writes_to(&self, sector: Option<u64>) {
        self.inner.lock().failing_sector = sector;
    }

    pub fn hardware_flushes(&self) -> usize {
        self.inner.lock().hardware_flushes
    }
}

impl DiskBackend for RecordingDisk {
    fn drive_name(&self) -> &str {
        &self.name
    }

    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn disk_size(&self) -> u64 {
        self.inner.lock().image.len() as u64
    }

    fn read_sector(&mut self, sector: u64, count: usize) -> DiskResult<Vec<u8>> {
        let mut inner = self.inner.lock();
        inner.ops.push(Op::Read(sector, count));
        let start = sector as usize * self.sector_size;
        let end = start + count * self.sector_size;
        if end > inner.image.len() {
            return Err(DiskError::BadSector);
        }
        Ok(inner.image[start..end].to_vec())
    }

    fn write_sector(&mut self, sector: u64, data: &[u8]) -> DiskResult<()> {
        let mut inner = self.inner.lock();
        let count = data.len() / self.sector_size;
        inner.ops.push(Op::Write(sector, count));
        if let Some(bad) = inner.failing_sector {
            if (sector..sector + count as u64).contains(&bad) {
                return Err(DiskError::BadSector);
            }
        }
        let start = sector as usize * self.sector_size;
        if start + data.len() > inner.image.len() {
            return Err(DiskError::BadSector);
        }
        inner.image[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn flush_hardware_cache(&mut self) -> DiskResult<()> {
        self.inner.lock().hardware_flushes += 1;
        Ok(())
    }
}

/// Gauge reporting whatever the test last set.
pub struct FixedGauge(AtomicUsize);

impl FixedGauge {
    pub fn new(percent: usize) -> Self {
        FixedGauge(AtomicUsize::new(percent))
    }

    pub fn set(&self, percent: usize) {
        self.0.store(percent, Ordering::Relaxed);
    }
}

impl MemoryGauge for FixedGauge {
    fn usage_percent(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}
