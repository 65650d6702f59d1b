//! Per-disk sector cache.
//!
//! Entries live in a slot arena threaded onto a doubly linked recency list
//! (`newest` .. `oldest`) and are found through a sector index. Touching an
//! entry relinks it at the newest end, so eviction always takes `oldest`.
//!
//! Writes only dirty the cache. Dirty sectors reach the backend when they
//! are evicted, on `sync` and on `flush`. A write-back that fails leaves the
//! entry resident and dirty: it is moved to the newest end and the error is
//! returned from the next persistence point (`flush`, `sync`, `set_ratio`).

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::{DiskBackend, DiskError, DiskResult};
use crate::config::DEFAULT_CACHE_RATIO;
use crate::memory::MemoryGauge;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub backend_reads: u64,
    pub writebacks: u64,
    pub writeback_errors: u64,
}

struct Slot {
    sector: u64,
    data: Box<[u8]>,
    dirty: bool,
    access_time: u64,
    newer: Option<usize>,
    older: Option<usize>,
}

pub struct DiskCache {
    sector_size: usize,
    index: BTreeMap<u64, usize>,
    slots: Vec<Slot>,
    free: Vec<usize>,
    newest: Option<usize>,
    oldest: Option<usize>,
    clock: u64,
    size_ratio: u8,
    gauge: Arc<dyn MemoryGauge>,
    stats: CacheStats,
}

impl DiskCache {
    pub fn new(sector_size: usize, gauge: Arc<dyn MemoryGauge>) -> Self {
        DiskCache {
            sector_size,
            index: BTreeMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            newest: None,
            oldest: None,
            clock: 0,
            size_ratio: DEFAULT_CACHE_RATIO,
            gauge,
            stats: CacheStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, sector: u64) -> bool {
        self.index.contains_key(&sector)
    }

    pub fn is_dirty(&self, sector: u64) -> Option<bool> {
        self.index.get(&sector).map(|&i| self.slots[i].dirty)
    }

    pub fn access_time(&self, sector: u64) -> Option<u64> {
        self.index.get(&sector).map(|&i| self.slots[i].access_time)
    }

    pub fn ratio(&self) -> u8 {
        self.size_ratio
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn gauge(&self) -> Arc<dyn MemoryGauge> {
        self.gauge.clone()
    }

    /// Resident sectors, least recently used first.
    pub fn lru_order(&self) -> Vec<u64> {
        let mut order = Vec::with_capacity(self.len());
        let mut cursor = self.oldest;
        while let Some(i) = cursor {
            order.push(self.slots[i].sector);
            cursor = self.slots[i].newer;
        }
        order
    }

    fn unlink(&mut self, i: usize) {
        let (newer, older) = (self.slots[i].newer, self.slots[i].older);
        match newer {
            Some(n) => self.slots[n].older = older,
            None => self.newest = older,
        }
        match older {
            Some(o) => self.slots[o].newer = newer,
            None => self.oldest = newer,
        }
        self.slots[i].newer = None;
        self.slots[i].older = None;
    }

    fn push_newest(&mut self, i: usize) {
        self.slots[i].older = self.newest;
        self.slots[i].newer = None;
        match self.newest {
            Some(n) => self.slots[n].newer = Some(i),
            None => self.oldest = Some(i),
        }
        self.newest = Some(i);
    }

    fn touch(&mut self, i: usize) {
        self.clock += 1;
        self.slots[i].access_time = self.clock;
        if self.newest != Some(i) {
            self.unlink(i);
            self.push_newest(i);
        }
    }

    fn release(&mut self, i: usize) {
        self.unlink(i);
        self.index.remove(&self.slots[i].sector);
        self.slots[i].data = Box::new([]);
        self.slots[i].dirty = false;
        self.free.push(i);
    }

    /// Insert or overwrite one sector. The entry becomes the most recent.
    /// A clean store never clears the dirty flag of an existing entry.
    pub fn add_to_cache(&mut self, sector: u64, data: &[u8], dirty: bool) {
        let mut buf = alloc::vec![0u8; self.sector_size].into_boxed_slice();
        let len = data.len().min(self.sector_size);
        buf[..len].copy_from_slice(&data[..len]);

        if let Some(&i) = self.index.get(&sector) {
            self.slots[i].data = buf;
            self.slots[i].dirty |= dirty;
            self.touch(i);
            return;
        }

        let slot = Slot {
            sector,
            data: buf,
            dirty,
            access_time: 0,
            newer: None,
            older: None,
        };
        let i = match self.free.pop() {
            Some(i) => {
                self.slots[i] = slot;
                i
            }
            None => {
                self.slots.push(slot);
                self.slots.len() - 1
            }
        };
        self.index.insert(sector, i);
        self.push_newest(i);
        self.touch(i);
    }

    /// Make `[sector, sector + count)` resident. Missing sectors are fetched
    /// in contiguous runs, one backend read per run.
    pub fn add_span(&mut self, backend: &mut dyn DiskBackend, sector: u64, count: usize) -> DiskResult<()> {
        let end = sector + count as u64;
        let mut run_start = None;

        for s in sector..=end {
            let missing = s < end && !self.contains(s);
            match (run_start, missing) {
                (None, true) => run_start = Some(s),
                (Some(start), false) => {
                    self.fetch(backend, start, (s - start) as usize)?;
                    run_start = None;
                }
                _ => {}
            }
            if s < end && !missing {
                self.stats.hits += 1;
            }
        }
        Ok(())
    }

    fn fetch(&mut self, backend: &mut dyn DiskBackend, sector: u64, count: usize) -> DiskResult<()> {
        let data = backend.read_sector(sector, count)?;
        if data.len() < count * self.sector_size {
            return Err(DiskError::Unknown);
        }
        self.stats.backend_reads += 1;
        self.stats.misses += count as u64;
        for (i, chunk) in data.chunks_exact(self.sector_size).take(count).enumerate() {
            self.add_to_cache(sector + i as u64, chunk, false);
        }
        Ok(())
    }

    pub fn read_sector(&mut self, backend: &mut dyn DiskBackend, sector: u64, count: usize) -> DiskResult<Vec<u8>> {
        self.add_span(backend, sector, count)?;

        let mut out = Vec::with_capacity(count * self.sector_size);
        for s in sector..sector + count as u64 {
            let i = *self.index.get(&s).ok_or(DiskError::Unknown)?;
            self.touch(i);
            out.extend_from_slice(&self.slots[i].data);
        }

        self.prune_in_background(backend);
        Ok(out)
    }

    pub fn write_sector(&mut self, backend: &mut dyn DiskBackend, sector: u64, data: &[u8]) -> DiskResult<()> {
        for (i, chunk) in data.chunks(self.sector_size).enumerate() {
            self.add_to_cache(sector + i as u64, chunk, true);
        }
        self.prune_in_background(backend);
        Ok(())
    }

    fn prune_in_background(&mut self, backend: &mut dyn DiskBackend) {
        if let Err(e) = self.prune_cache(backend) {
            crate::log_warn!("{}: cache pruning stalled: {}", backend.drive_name(), e);
        }
    }

    /// Write `sector` back if dirty, then drop it. On write-back failure the
    /// entry is left untouched.
    pub fn remove_entry(&mut self, backend: &mut dyn DiskBackend, sector: u64) -> DiskResult<()> {
        let Some(&i) = self.index.get(&sector) else {
            return Ok(());
        };
        if self.slots[i].dirty {
            self.write_back(backend, i)?;
        }
        self.release(i);
        Ok(())
    }

    fn write_back(&mut self, backend: &mut dyn DiskBackend, i: usize) -> DiskResult<()> {
        let sector = self.slots[i].sector;
        match backend.write_sector(sector, &self.slots[i].data) {
            Ok(()) => {
                self.slots[i].dirty = false;
                self.stats.writebacks += 1;
                Ok(())
            }
            Err(e) => {
                self.stats.writeback_errors += 1;
                crate::log_error!("{}: write-back of sector {} failed: {}", backend.drive_name(), sector, e);
                Err(e)
            }
        }
    }

    /// Evict oldest entries while `keep_going` holds. Entries whose write-back
    /// fails are moved to the newest end; each entry is tried at most once.
    fn evict_while(
        &mut self,
        backend: &mut dyn DiskBackend,
        mut keep_going: impl FnMut(&Self) -> bool,
    ) -> DiskResult<()> {
        let mut first_error = None;
        let mut attempts = self.len();

        while attempts > 0 && keep_going(self) {
            attempts -= 1;
            let Some(i) = self.oldest else { break };
            let sector = self.slots[i].sector;
            if let Err(e) = self.remove_entry(backend, sector) {
                self.touch(i);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Evict least recently used entries while memory usage is above the ratio.
    pub fn prune_cache(&mut self, backend: &mut dyn DiskBackend) -> DiskResult<()> {
        self.evict_while(backend, |cache| {
            !cache.is_empty() && cache.gauge.usage_percent() > cache.size_ratio as usize
        })
    }

    /// Write back and drop every entry.
    pub fn flush(&mut self, backend: &mut dyn DiskBackend) -> DiskResult<()> {
        self.evict_while(backend, |cache| !cache.is_empty())
    }

    /// Write back every dirty entry, oldest first, keeping it cached.
    pub fn sync(&mut self, backend: &mut dyn DiskBackend) -> DiskResult<()> {
        let mut first_error = None;
        let mut cursor = self.oldest;
        while let Some(i) = cursor {
            cursor = self.slots[i].newer;
            if self.slots[i].dirty {
                if let Err(e) = self.write_back(backend, i) {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn set_ratio(&mut self, backend: &mut dyn DiskBackend, ratio: u8) -> DiskResult<()> {
        self.size_ratio = ratio.min(100);
        self.prune_cache(backend)
    }

    /// Write back and drop the entries for `[sector, sector + count)`. Stops
    /// at the first failed write-back, leaving that entry dirty.
    pub fn evict_span(&mut self, backend: &mut dyn DiskBackend, sector: u64, count: usize) -> DiskResult<()> {
        let resident: Vec<u64> = self
            .index
            .range(sector..sector + count as u64)
            .map(|(&s, _)| s)
            .collect();
        for s in resident {
            self.remove_entry(backend, s)?;
        }
        Ok(())
    }

    /// Drop every clean entry.
    pub fn discard_clean(&mut self) {
        let clean: Vec<usize> = self
            .index
            .values()
            .copied()
            .filter(|&i| !self.slots[i].dirty)
            .collect();
        for i in clean {
            self.release(i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{FixedGauge, Op, RecordingDisk};
    use super::*;

    fn setup(sectors: u64) -> (DiskCache, RecordingDisk, Arc<FixedGauge>) {
        let gauge = Arc::new(FixedGauge::new(0));
        let cache = DiskCache::new(512, gauge.clone());
        (cache, RecordingDisk::new("hdc", 512, sectors), gauge)
    }

    fn pattern(seed: u8, sectors: usize) -> Vec<u8> {
        (0..sectors * 512).map(|i| (i as u8).wrapping_mul(7) ^ seed).collect()
    }

    #[test]
    fn test_write_then_read_without_flush() {
        let (mut cache, mut disk, _) = setup(32);
        let data = pattern(0x5A, 4);

        cache.write_sector(&mut disk, 3, &data).unwrap();
        assert_eq!(cache.read_sector(&mut disk, 3, 4).unwrap(), data);
        assert!(disk.ops().is_empty());
        assert_eq!(disk.sector(3), vec![0; 512]);
    }

    #[test]
    fn test_eviction_writes_back_latest_data() {
        let (mut cache, mut disk, gauge) = setup(8);
        cache.write_sector(&mut disk, 2, &[1; 512]).unwrap();
        cache.write_sector(&mut disk, 2, &[2; 512]).unwrap();

        gauge.set(10);
        cache.set_ratio(&mut disk, 0).unwrap();

        assert_eq!(disk.writes(), vec![Op::Write(2, 1)]);
        assert_eq!(disk.sector(2), vec![2; 512]);
        assert!(!cache.contains(2));
        assert_eq!(cache.stats().writebacks, 1);
    }

    #[test]
    fn test_clean_eviction_does_not_write() {
        let (mut cache, mut disk, gauge) = setup(8);
        cache.read_sector(&mut disk, 0, 2).unwrap();
        gauge.set(50);
        cache.set_ratio(&mut disk, 0).unwrap();
        assert!(cache.is_empty());
        assert!(disk.writes().is_empty());
    }

    #[test]
    fn test_lru_evicts_oldest_first() {
        let (mut cache, mut disk, gauge) = setup(8);
        cache.read_sector(&mut disk, 1, 1).unwrap(); // A
        cache.write_sector(&mut disk, 2, &[2; 512]).unwrap(); // B
        cache.read_sector(&mut disk, 3, 1).unwrap(); // C
        assert_eq!(cache.lru_order(), vec![1, 2, 3]);

        // Re-touching A makes B the oldest.
        cache.read_sector(&mut disk, 1, 1).unwrap();
        assert_eq!(cache.lru_order(), vec![2, 3, 1]);
        assert!(cache.access_time(1) > cache.access_time(3));

        gauge.set(50);
        cache.set_ratio(&mut disk, 40).unwrap();
        // The gauge never drops in this test, so pruning drains everything
        // in recency order: B's write-back is the first backend write.
        assert_eq!(disk.writes(), vec![Op::Write(2, 1)]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_single_eviction_takes_oldest() {
        let (mut cache, mut disk, _) = setup(8);
        for s in [4, 5, 6] {
            cache.write_sector(&mut disk, s, &[s as u8; 512]).unwrap();
        }
        let oldest = cache.lru_order()[0];
        cache.remove_entry(&mut disk, oldest).unwrap();
        assert_eq!(oldest, 4);
        assert_eq!(cache.lru_order(), vec![5, 6]);
        assert_eq!(disk.sector(4), vec![4; 512]);
    }

    #[test]
    fn test_coalesced_fetch_skips_resident() {
        let (mut cache, mut disk, _) = setup(16);
        cache.read_sector(&mut disk, 6, 2).unwrap();
        disk.clear_ops();

        let data = cache.read_sector(&mut disk, 5, 5).unwrap();
        assert_eq!(data.len(), 5 * 512);
        assert_eq!(disk.ops(), vec![Op::Read(5, 1), Op::Read(8, 2)]);
        assert_eq!(cache.stats().hits, 2);
    }

    #[test]
    fn test_fetch_error_propagates() {
        let (mut cache, mut disk, _) = setup(4);
        assert_eq!(cache.read_sector(&mut disk, 3, 2), Err(DiskError::BadSector));
        assert!(!cache.contains(4));
    }

    #[test]
    fn test_failed_writeback_keeps_dirty_entry() {
        let (mut cache, mut disk, gauge) = setup(8);
        cache.write_sector(&mut disk, 1, &[1; 512]).unwrap();
        cache.write_sector(&mut disk, 2, &[2; 512]).unwrap();
        disk.fail_writes_to(Some(1));

        gauge.set(90);
        assert_eq!(cache.set_ratio(&mut disk, 10), Err(DiskError::BadSector));
        // Sector 2 still went out; sector 1 stays resident and dirty.
        assert_eq!(disk.sector(2), vec![2; 512]);
        assert_eq!(cache.is_dirty(1), Some(true));
        assert!(!cache.contains(2));
        assert_eq!(cache.stats().writeback_errors, 1);

        disk.fail_writes_to(None);
        cache.flush(&mut disk).unwrap();
        assert_eq!(disk.sector(1), vec![1; 512]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_failed_writeback_does_not_fail_reads() {
        let (mut cache, mut disk, gauge) = setup(8);
        cache.write_sector(&mut disk, 0, &[9; 512]).unwrap();
        disk.fail_writes_to(Some(0));
        gauge.set(90);
        cache.size_ratio = 10;

        assert_eq!(cache.read_sector(&mut disk, 0, 1).unwrap(), vec![9; 512]);
        assert_eq!(cache.is_dirty(0), Some(true));
    }

    #[test]
    fn test_sync_keeps_entries_clean() {
        let (mut cache, mut disk, _) = setup(8);
        cache.write_sector(&mut disk, 0, &pattern(1, 2)).unwrap();
        cache.sync(&mut disk).unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.is_dirty(0), Some(false));
        assert_eq!(disk.writes().len(), 2);

        cache.flush(&mut disk).unwrap();
        assert_eq!(disk.writes().len(), 2);
    }

    #[test]
    fn test_under_ratio_keeps_everything() {
        let (mut cache, mut disk, gauge) = setup(8);
        gauge.set(DEFAULT_CACHE_RATIO as usize);
        cache.read_sector(&mut disk, 0, 8).unwrap();
        assert_eq!(cache.len(), 8);
    }

    #[test]
    fn test_slots_are_reused() {
        let (mut cache, mut disk, _) = setup(8);
        cache.read_sector(&mut disk, 0, 4).unwrap();
        cache.flush(&mut disk).unwrap();
        cache.read_sector(&mut disk, 4, 4).unwrap();
        assert_eq!(cache.slots.len(), 4);
        assert_eq!(cache.lru_order(), vec![4, 5, 6, 7]);
    }

    #[test]
    fn test_discard_clean_keeps_dirty() {
        let (mut cache, mut disk, _) = setup(8);
        cache.read_sector(&mut disk, 0, 3).unwrap();
        cache.write_sector(&mut disk, 5, &[5; 512]).unwrap();

        cache.discard_clean();
        assert_eq!(cache.lru_order(), vec![5]);
        assert!(disk.writes().is_empty());
    }

    #[test]
    fn test_evict_span_writes_back_dirty() {
        let (mut cache, mut disk, _) = setup(8);
        cache.read_sector(&mut disk, 3, 1).unwrap();
        cache.write_sector(&mut disk, 4, &[4; 512]).unwrap();
        cache.write_sector(&mut disk, 6, &[6; 512]).unwrap();

        cache.evict_span(&mut disk, 3, 2).unwrap();
        assert_eq!(disk.writes(), vec![Op::Write(4, 1)]);
        assert_eq!(disk.sector(4), vec![4; 512]);
        assert_eq!(cache.lru_order(), vec![6]);
    }

    #[test]
    fn test_evict_span_stops_on_failed_writeback() {
        let (mut cache, mut disk, _) = setup(8);
        cache.write_sector(&mut disk, 2, &[2; 512]).unwrap();
        disk.fail_writes_to(Some(2));

        assert_eq!(cache.evict_span(&mut disk, 0, 4), Err(DiskError::BadSector));
        assert_eq!(cache.is_dirty(2), Some(true));
    }
}
