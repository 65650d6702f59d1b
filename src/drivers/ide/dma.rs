//! Bus-master DMA transfers. The issuing task sleeps in `IoWait` until the
//! channel's IRQ publishes the result, or until `DMA_TIMEOUT_MS` passes.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::string::String;
use alloc::vec::Vec;
use x86_64::instructions::port::Port;

use super::{
    Channel, ChannelClaim, TaskFile, BM_CMD_READ, BM_CMD_START, BM_COMMAND, BM_PRDT, BM_STATUS,
    BM_STATUS_ERROR, BM_STATUS_IRQ, CMD_READ_DMA, CMD_WRITE_DMA, COMPLETIONS,
};
use crate::config::{DMA_MAX_SECTORS, DMA_TIMEOUT_MS};
use crate::disk::{DiskBackend, DiskError, DiskResult};
use crate::{tasking, time};

const SECTOR_SIZE: usize = 512;
const BUFFER_SIZE: usize = DMA_MAX_SECTORS * SECTOR_SIZE;
const PRD_END_OF_TABLE: u16 = 0x8000;

/// Physically contiguous heap allocation. The heap lives in the identity
/// mapped low memory, so its addresses double as bus addresses.
struct DmaRegion {
    ptr: *mut u8,
    layout: Layout,
}

// The region is owned by exactly one DmaDisk.
unsafe impl Send for DmaRegion {}

impl DmaRegion {
    /// `align` keeps the region from straddling a 64 KiB boundary, which a
    /// PRD entry may not cross.
    fn new(size: usize, align: usize) -> Option<Self> {
        let layout = Layout::from_size_align(size, align).ok()?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() || (ptr as u64) >= u32::MAX as u64 {
            return None;
        }
        Some(DmaRegion { ptr, layout })
    }

    fn bus_address(&self) -> u32 {
        self.ptr as u32
    }

    fn as_slice(&self, len: usize) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.ptr, len.min(self.layout.size())) }
    }

    fn as_mut_slice(&mut self, len: usize) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.ptr, len.min(self.layout.size())) }
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

pub struct DmaDisk {
    channel: Channel,
    slave: bool,
    name: String,
    sectors: u64,
    bus_master: u16,
    prdt: DmaRegion,
    buffer: DmaRegion,
}

impl DmaDisk {
    /// `None` when the bounce buffer cannot be placed below 4 GiB.
    pub fn new(channel: Channel, slave: bool, name: String, sectors: u64, bus_master: u16) -> Option<Self> {
        Some(DmaDisk {
            channel,
            slave,
            name,
            sectors,
            bus_master,
            prdt: DmaRegion::new(8, 4)?,
            buffer: DmaRegion::new(BUFFER_SIZE, 0x1_0000)?,
        })
    }

    fn bm_read(&self, reg: u16) -> u8 {
        unsafe { Port::<u8>::new(self.bus_master + reg).read() }
    }

    fn bm_write(&self, reg: u16, val: u8) {
        unsafe { Port::<u8>::new(self.bus_master + reg).write(val) }
    }

    fn check(&self, lba: u64, count: usize) -> DiskResult<()> {
        match lba.checked_add(count as u64) {
            Some(end) if end <= self.sectors => Ok(()),
            _ => Err(DiskError::BadSector),
        }
    }

    /// One bus-master command over the first `count` sectors of the buffer.
    fn transfer(&mut self, lba: u64, count: usize, write: bool) -> DiskResult<()> {
        let tf = TaskFile::lba28(lba, count, self.slave)?;
        let bytes = count * SECTOR_SIZE;

        // Single PRD entry: address, byte count (0 means 64 KiB), end of table.
        let mut entry = [0u8; 8];
        entry[0..4].copy_from_slice(&self.buffer.bus_address().to_le_bytes());
        entry[4..6].copy_from_slice(&(bytes as u16).to_le_bytes());
        entry[6..8].copy_from_slice(&PRD_END_OF_TABLE.to_le_bytes());
        self.prdt.as_mut_slice(8).copy_from_slice(&entry);

        self.channel.wait_bsy()?;

        self.bm_write(BM_COMMAND, 0);
        unsafe { Port::<u32>::new(self.bus_master + BM_PRDT).write(self.prdt.bus_address()) };
        self.bm_write(BM_COMMAND, if write { 0 } else { BM_CMD_READ });
        let status = self.bm_read(BM_STATUS);
        self.bm_write(BM_STATUS, status | BM_STATUS_ERROR | BM_STATUS_IRQ);

        let completion = &COMPLETIONS[self.channel.index];
        completion.arm(tasking::current_pid());
        self.channel.issue(&tf, if write { CMD_WRITE_DMA } else { CMD_READ_DMA });
        self.bm_write(BM_COMMAND, self.bm_read(BM_COMMAND) | BM_CMD_START);

        let deadline = time::ticks() + time::ms_to_ticks(DMA_TIMEOUT_MS);
        let result = loop {
            if let Some(result) = completion.take() {
                break result;
            }
            if time::ticks() >= deadline {
                completion.cancel();
                crate::log_error!("{}: DMA command at LBA {} timed out.", self.name, lba);
                break Err(DiskError::TimeOut);
            }
            tasking::block_on_io(Some(deadline), || completion.is_ready());
        };

        self.bm_write(BM_COMMAND, self.bm_read(BM_COMMAND) & !BM_CMD_START);
        result
    }
}

impl DiskBackend for DmaDisk {
    fn drive_name(&self) -> &str {
        &self.name
    }

    fn sector_size(&self) -> usize {
        SECTOR_SIZE
    }

    fn disk_size(&self) -> u64 {
        self.sectors * SECTOR_SIZE as u64
    }

    fn read_sector(&mut self, sector: u64, count: usize) -> DiskResult<Vec<u8>> {
        self.check(sector, count)?;
        let _claim = ChannelClaim::acquire(self.channel.index);

        let mut out = Vec::with_capacity(count * SECTOR_SIZE);
        let mut lba = sector;
        let mut left = count;
        while left > 0 {
            let n = left.min(DMA_MAX_SECTORS);
            self.transfer(lba, n, false)?;
            out.extend_from_slice(self.buffer.as_slice(n * SECTOR_SIZE));
            lba += n as u64;
            left -= n;
        }
        Ok(out)
    }

    fn write_sector(&mut self, sector: u64, data: &[u8]) -> DiskResult<()> {
        if data.len() % SECTOR_SIZE != 0 {
            return Err(DiskError::Aborted);
        }
        self.check(sector, data.len() / SECTOR_SIZE)?;
        let _claim = ChannelClaim::acquire(self.channel.index);

        for (i, chunk) in data.chunks(BUFFER_SIZE).enumerate() {
            self.buffer.as_mut_slice(chunk.len()).copy_from_slice(chunk);
            self.transfer(sector + (i * DMA_MAX_SECTORS) as u64, chunk.len() / SECTOR_SIZE, true)?;
        }
        Ok(())
    }

    fn flush_hardware_cache(&mut self) -> DiskResult<()> {
        let _claim = ChannelClaim::acquire(self.channel.index);
        self.channel.flush_cache(self.slave)?;
        Ok(())
    }
}
