use alloc::string::String;
use alloc::vec::Vec;

use super::{DiskBackend, DiskError, DiskResult, MediaType, SharedDisk};

/// Window of `size` sectors starting at `offset` on a shared base disk.
///
/// Sector I/O goes through the base `Disk`, and with it the base disk's
/// cache. A `Disk` wrapping a slice should therefore run with caching
/// disabled so no sector is cached twice.
pub struct DiskSlice {
    name: String,
    base: SharedDisk,
    offset: u64,
    size: u64,
    sector_size: usize,
    media_type: MediaType,
}

impl DiskSlice {
    pub fn new(name: &str, base: SharedDisk, offset: u64, size: u64) -> Self {
        let (sector_size, media_type) = {
            let disk = base.lock();
            (disk.sector_size(), disk.media_type())
        };
        DiskSlice {
            name: String::from(name),
            base,
            offset,
            size,
            sector_size,
            media_type,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn sectors(&self) -> u64 {
        self.size
    }

    fn check(&self, sector: u64, count: u64) -> DiskResult<()> {
        match sector.checked_add(count) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(DiskError::BadSector),
        }
    }
}

impl DiskBackend for DiskSlice {
    fn drive_name(&self) -> &str {
        &self.name
    }

    fn media_type(&self) -> MediaType {
        self.media_type
    }

    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn disk_size(&self) -> u64 {
        self.size * self.sector_size as u64
    }

    fn read_sector(&mut self, sector: u64, count: usize) -> DiskResult<Vec<u8>> {
        self.check(sector, count as u64)?;
        self.base.lock().read_sectors(sector + self.offset, count)
    }

    fn write_sector(&mut self, sector: u64, data: &[u8]) -> DiskResult<()> {
        self.check(sector, (data.len() / self.sector_size) as u64)?;
        self.base.lock().write_sectors(sector + self.offset, data)
    }

    fn flush_hardware_cache(&mut self) -> DiskResult<()> {
        self.base.lock().sync()
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{FixedGauge, Op, RecordingDisk};
    use super::super::Disk;
    use super::*;
    use crate::tasking::SleepLock;
    use alloc::boxed::Box;
    use alloc::sync::Arc;

    fn base(sectors: u64) -> (SharedDisk, RecordingDisk) {
        let backend = RecordingDisk::new("hda", 512, sectors);
        let disk = Disk::with_gauge(Box::new(backend.clone()), Arc::new(FixedGauge::new(0)));
        (Arc::new(SleepLock::new(disk)), backend)
    }

    #[test]
    fn test_offsets_every_access() {
        let (base, backend) = base(64);
        base.lock().enable_caching(false);
        let mut slice = DiskSlice::new("hda1", base.clone(), 10, 20);

        slice.write_sector(2, &[3; 1024]).unwrap();
        slice.read_sector(0, 1).unwrap();
        assert_eq!(backend.ops(), vec![Op::Write(12, 2), Op::Read(10, 1)]);
        assert_eq!(backend.sector(13), vec![3; 512]);
    }

    #[test]
    fn test_size_is_clamped_to_window() {
        let (base, _) = base(64);
        let mut slice = DiskSlice::new("hda1", base, 10, 20);
        assert_eq!(slice.disk_size(), 20 * 512);
        assert_eq!(slice.read_sector(19, 2), Err(DiskError::BadSector));
        assert_eq!(slice.write_sector(20, &[0; 512]), Err(DiskError::BadSector));
    }

    #[test]
    fn test_slice_disk_shares_base_cache() {
        let (base, backend) = base(64);
        let slice = DiskSlice::new("hda1", base.clone(), 8, 16);
        let mut part = Disk::with_gauge(Box::new(slice), Arc::new(FixedGauge::new(0)));
        part.enable_caching(false);

        part.write(4, b"hello").unwrap();
        assert!(backend.writes().is_empty());
        assert_eq!(base.lock().read(8 * 512 + 4, 5).unwrap(), b"hello");

        part.flush_cache().unwrap();
        assert_eq!(&backend.sector(8)[4..9], b"hello");
    }
}
