use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;

use super::{partition, Disk, DiskError, DiskResult, DiskSlice, SharedDisk};
use crate::memory::MemoryGauge;
use crate::tasking::SleepLock;

lazy_static! {
    pub static ref DISKS: Mutex<DiskRegistry> = Mutex::new(DiskRegistry::new());
}

/// Every disk known to the kernel, in registration order.
///
/// The registry lock is never held while a disk is locked: callers take a
/// `snapshot` and do their I/O after releasing it.
pub struct DiskRegistry {
    disks: Vec<(String, SharedDisk)>,
}

impl DiskRegistry {
    pub const fn new() -> Self {
        DiskRegistry { disks: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.disks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.disks.is_empty()
    }

    /// Add `disk`. Names are unique; a clash is rejected with `Aborted`.
    pub fn register(&mut self, disk: Disk) -> DiskResult<SharedDisk> {
        if self.find(disk.drive_name()).is_some() {
            crate::log_warn!("Disk {} is already registered.", disk.drive_name());
            return Err(DiskError::Aborted);
        }
        crate::log_info!(
            "Registered disk {}: {} sectors of {} bytes, {:?}.",
            disk.drive_name(),
            disk.sector_count(),
            disk.sector_size(),
            disk.media_type()
        );
        let name = String::from(disk.drive_name());
        let disk = Arc::new(SleepLock::new(disk));
        self.disks.push((name, disk.clone()));
        Ok(disk)
    }

    /// Register one uncached disk per slice. Returns how many were added.
    pub fn register_slices(&mut self, slices: Vec<DiskSlice>, gauge: &Arc<dyn MemoryGauge>) -> usize {
        let mut count = 0;
        for slice in slices {
            let mut disk = Disk::with_gauge(Box::new(slice), gauge.clone());
            disk.enable_caching(false);
            if self.register(disk).is_ok() {
                count += 1;
            }
        }
        count
    }

    pub fn find(&self, name: &str) -> Option<SharedDisk> {
        self.disks
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, disk)| disk.clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.disks.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Handles to every disk, for use once the registry lock is dropped.
    pub fn snapshot(&self) -> Vec<SharedDisk> {
        self.disks.iter().map(|(_, disk)| disk.clone()).collect()
    }
}

impl Default for DiskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Scan `base` for MBR partitions and register them in `registry`. The
/// sector 0 read happens before the registry is locked.
pub fn register_partitions(registry: &Mutex<DiskRegistry>, base: &SharedDisk) -> DiskResult<usize> {
    let gauge = base.lock().gauge();
    let slices = partition::scan(base)?;
    Ok(registry.lock().register_slices(slices, &gauge))
}

/// `register_partitions` for each of `bases`. A failed scan is logged and
/// does not stop the others. Returns the number of partitions added.
pub fn register_all_partitions(registry: &Mutex<DiskRegistry>, bases: &[SharedDisk]) -> usize {
    let mut count = 0;
    for base in bases {
        match register_partitions(registry, base) {
            Ok(n) => count += n,
            Err(e) => {
                let name = String::from(base.lock().drive_name());
                crate::log_warn!("Partition scan of {} failed: {}", name, e);
            }
        }
    }
    count
}

/// Flush every disk in `registry`, slices first so their dirty sectors reach
/// the base disk's cache before it is flushed. Returns the first error.
pub fn flush_all(registry: &Mutex<DiskRegistry>) -> DiskResult<()> {
    let disks = registry.lock().snapshot();
    each_newest_first(&disks, |disk| disk.flush_cache())
}

/// Like `flush_all`, but cached sectors stay resident.
pub fn sync_all(registry: &Mutex<DiskRegistry>) -> DiskResult<()> {
    let disks = registry.lock().snapshot();
    each_newest_first(&disks, |disk| disk.sync())
}

fn each_newest_first(disks: &[SharedDisk], mut op: impl FnMut(&mut Disk) -> DiskResult<()>) -> DiskResult<()> {
    let mut first_error = None;
    for disk in disks.iter().rev() {
        let mut disk = disk.lock();
        if let Err(e) = op(&mut disk) {
            crate::log_error!("Writing back {} failed: {}", disk.drive_name(), e);
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{FixedGauge, RecordingDisk};
    use super::super::{DiskBackend, MediaType};
    use super::*;
    use alloc::vec;
    use core::sync::atomic::{AtomicBool, Ordering};

    fn recording(name: &str) -> (Disk, RecordingDisk) {
        let backend = RecordingDisk::new(name, 512, 64);
        let disk = Disk::with_gauge(Box::new(backend.clone()), Arc::new(FixedGauge::new(0)));
        (disk, backend)
    }

    fn one_partition(backend: &RecordingDisk, start: u8, count: u8) {
        let mut mbr = vec![0u8; 512];
        mbr[446 + 4] = 0x83;
        mbr[446 + 8] = start;
        mbr[446 + 12] = count;
        mbr[510] = 0x55;
        mbr[511] = 0xAA;
        backend.load(0, &mbr);
    }

    #[test]
    fn test_register_and_find() {
        let mut registry = DiskRegistry::new();
        let (hda, _) = recording("hda");
        let (dup, _) = recording("hda");
        registry.register(hda).unwrap();
        assert_eq!(registry.register(dup).err(), Some(DiskError::Aborted));
        assert!(registry.find("hda").is_some());
        assert!(registry.find("hdb").is_none());
        assert_eq!(registry.names(), vec![String::from("hda")]);
    }

    #[test]
    fn test_find_does_not_touch_busy_disk() {
        let mut registry = DiskRegistry::new();
        let (hda, _) = recording("hda");
        let disk = registry.register(hda).unwrap();
        let _busy = disk.lock();
        assert!(registry.find("hda").is_some());
        assert_eq!(registry.names().len(), 1);
    }

    #[test]
    fn test_partitions_registered_uncached() {
        let registry = Mutex::new(DiskRegistry::new());
        let (disk, backend) = recording("hda");
        one_partition(&backend, 4, 8);

        let base = registry.lock().register(disk).unwrap();
        assert_eq!(register_partitions(&registry, &base).unwrap(), 1);
        let part = registry.lock().find("hdap1").unwrap();
        assert!(!part.lock().caching());
        assert_eq!(part.lock().sector_count(), 8);
    }

    #[test]
    fn test_flush_all_pushes_slice_writes_to_device() {
        let registry = Mutex::new(DiskRegistry::new());
        let (disk, backend) = recording("hda");
        one_partition(&backend, 4, 8);

        let base = registry.lock().register(disk).unwrap();
        register_partitions(&registry, &base).unwrap();
        let part = registry.lock().find("hdap1").unwrap();
        part.lock().write(0, &[0x42; 512]).unwrap();
        assert_eq!(backend.sector(4), vec![0; 512]);

        flush_all(&registry).unwrap();
        assert_eq!(backend.sector(4), vec![0x42; 512]);
        assert!(base.lock().cache().is_empty());
    }

    #[test]
    fn test_sync_all_keeps_cache_warm() {
        let registry = Mutex::new(DiskRegistry::new());
        let (disk, backend) = recording("hdb");
        let disk = registry.lock().register(disk).unwrap();
        disk.lock().write(512, &[1; 512]).unwrap();

        sync_all(&registry).unwrap();
        assert_eq!(backend.sector(1), vec![1; 512]);
        assert_eq!(disk.lock().cache().is_dirty(1), Some(false));
        assert_eq!(backend.hardware_flushes(), 1);
    }

    #[test]
    fn test_partition_scan_of_every_base_after_registration() {
        let registry = Mutex::new(DiskRegistry::new());
        let (hda, a) = recording("hda");
        let (hdb, _) = recording("hdb");
        let (hdc, c) = recording("hdc");
        one_partition(&a, 4, 8);
        one_partition(&c, 2, 2);
        let hda = registry.lock().register(hda).unwrap();
        let hdb = registry.lock().register(hdb).unwrap();
        let hdc = registry.lock().register(hdc).unwrap();
        // hdb carries no partition table.
        let bases = vec![hda, hdb, hdc];

        assert_eq!(register_all_partitions(&registry, &bases), 2);
        assert_eq!(
            registry.lock().names(),
            vec!["hda", "hdb", "hdc", "hdap1", "hdcp1"]
        );
    }

    #[test]
    fn test_failed_partition_scan_does_not_stop_others() {
        let registry = Mutex::new(DiskRegistry::new());
        let tiny = Disk::with_gauge(Box::new(RecordingDisk::new("hdz", 512, 0)), Arc::new(FixedGauge::new(0)));
        let (hda, a) = recording("hda");
        one_partition(&a, 4, 8);
        let tiny = registry.lock().register(tiny).unwrap();
        let hda = registry.lock().register(hda).unwrap();

        assert_eq!(register_all_partitions(&registry, &[tiny, hda]), 1);
        assert!(registry.lock().find("hdap1").is_some());
    }

    static WATCHED: Mutex<DiskRegistry> = Mutex::new(DiskRegistry::new());

    /// Notes whether the registry lock is held while the device is written.
    struct RegistryWatch {
        inner: RecordingDisk,
        saw_registry_locked: Arc<AtomicBool>,
    }

    impl DiskBackend for RegistryWatch {
        fn drive_name(&self) -> &str {
            self.inner.drive_name()
        }

        fn media_type(&self) -> MediaType {
            self.inner.media_type()
        }

        fn sector_size(&self) -> usize {
            self.inner.sector_size()
        }

        fn disk_size(&self) -> u64 {
            self.inner.disk_size()
        }

        fn read_sector(&mut self, sector: u64, count: usize) -> DiskResult<Vec<u8>> {
            self.inner.read_sector(sector, count)
        }

        fn write_sector(&mut self, sector: u64, data: &[u8]) -> DiskResult<()> {
            if WATCHED.is_locked() {
                self.saw_registry_locked.store(true, Ordering::SeqCst);
            }
            self.inner.write_sector(sector, data)
        }
    }

    #[test]
    fn test_sync_releases_registry_before_disk_io() {
        let saw_registry_locked = Arc::new(AtomicBool::new(false));
        let backend = RegistryWatch {
            inner: RecordingDisk::new("hdw", 512, 8),
            saw_registry_locked: saw_registry_locked.clone(),
        };
        let disk = Disk::with_gauge(Box::new(backend), Arc::new(FixedGauge::new(0)));
        let disk = WATCHED.lock().register(disk).unwrap();
        disk.lock().write(0, &[3; 512]).unwrap();

        sync_all(&WATCHED).unwrap();
        flush_all(&WATCHED).unwrap();
        assert_eq!(disk.lock().cache().stats().writebacks, 1);
        assert!(!saw_registry_locked.load(Ordering::SeqCst));
    }
}
