//! The surface filesystem drivers build on: byte-range access to registered
//! disks with disk failures mapped to `FsError`.

pub mod error;

use alloc::vec::Vec;

use crate::disk::{registry, Disk, SharedDisk, DISKS};
use crate::tasking::SleepLock;
pub use error::{FsError, FsResult};

pub fn open_disk(name: &str) -> FsResult<SharedDisk> {
    DISKS.lock().find(name).ok_or(FsError::NotFound)
}

pub fn read_at(disk: &SleepLock<Disk>, offset: u64, len: usize) -> FsResult<Vec<u8>> {
    disk.lock().read(offset, len).map_err(FsError::read)
}

pub fn write_at(disk: &SleepLock<Disk>, offset: u64, data: &[u8]) -> FsResult<()> {
    disk.lock().write(offset, data).map_err(FsError::write)
}

/// Push every dirty cached sector of every disk to its device.
pub fn sync() -> FsResult<()> {
    registry::sync_all(&DISKS).map_err(FsError::write)
}

/// Write back and drop all caches. Called before power-off.
pub fn unmount_all() -> FsResult<()> {
    registry::flush_all(&DISKS).map_err(FsError::write)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::testing::{FixedGauge, RecordingDisk};
    use crate::disk::DiskError;
    use alloc::boxed::Box;
    use alloc::sync::Arc;

    fn disk() -> SleepLock<Disk> {
        let backend = RecordingDisk::new("fst", 512, 8);
        SleepLock::new(Disk::with_gauge(Box::new(backend), Arc::new(FixedGauge::new(0))))
    }

    #[test]
    fn test_byte_range_round_trip() {
        let disk = disk();
        write_at(&disk, 1000, b"atomic").unwrap();
        assert_eq!(read_at(&disk, 1000, 6).unwrap(), b"atomic");
    }

    #[test]
    fn test_out_of_range_maps_to_fs_errors() {
        let disk = disk();
        assert_eq!(read_at(&disk, 4096, 1), Err(FsError::ReadError(DiskError::BadSector)));
        assert_eq!(write_at(&disk, 4095, &[0, 0]), Err(FsError::WriteError(DiskError::BadSector)));
    }

    #[test]
    fn test_unmount_all_writes_back_registered_disks() {
        let backend = RecordingDisk::new("fsu", 512, 8);
        let disk = Disk::with_gauge(Box::new(backend.clone()), Arc::new(FixedGauge::new(0)));
        let disk = DISKS.lock().register(disk).unwrap();
        write_at(&disk, 0, &[5; 512]).unwrap();
        assert_eq!(backend.sector(0), vec![0; 512]);

        unmount_all().unwrap();
        assert_eq!(backend.sector(0), vec![5; 512]);
        assert!(disk.lock().cache().is_empty());
        assert_eq!(open_disk("fsu").ok().map(|d| Arc::ptr_eq(&d, &disk)), Some(true));
    }

    #[test]
    fn test_unknown_disk() {
        assert_eq!(open_disk("nonexistent").err(), Some(FsError::NotFound));
    }
}
