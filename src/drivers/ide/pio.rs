use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use super::{Channel, ChannelClaim, TaskFile, CMD_READ_SECTORS, CMD_WRITE_SECTORS};
use crate::config::PIO_MAX_SECTORS;
use crate::disk::{DiskBackend, DiskError, DiskResult};

const SECTOR_SIZE: usize = 512;

/// ATA drive driven by programmed I/O. Polls the status register with
/// interrupts left enabled.
pub struct PioDisk {
    channel: Channel,
    slave: bool,
    name: String,
    sectors: u64,
}

impl PioDisk {
    pub fn new(channel: Channel, slave: bool, name: String, sectors: u64) -> Self {
        PioDisk {
            channel,
            slave,
            name,
            sectors,
        }
    }

    fn check(&self, lba: u64, count: usize) -> DiskResult<()> {
        match lba.checked_add(count as u64) {
            Some(end) if end <= self.sectors => Ok(()),
            _ => Err(DiskError::BadSector),
        }
    }

    fn read_chunk(&self, lba: u64, buf: &mut [u8]) -> DiskResult<()> {
        let count = buf.len() / SECTOR_SIZE;
        let tf = TaskFile::lba28(lba, count, self.slave)?;

        self.channel.wait_bsy()?;
        self.channel.issue(&tf, CMD_READ_SECTORS);

        for sector in buf.chunks_exact_mut(SECTOR_SIZE) {
            self.channel.wait_bsy()?;
            self.channel.wait_drq()?;
            for word in sector.chunks_exact_mut(2) {
                word.copy_from_slice(&self.channel.read_data().to_le_bytes());
            }
        }
        Ok(())
    }

    fn write_chunk(&self, lba: u64, data: &[u8]) -> DiskResult<()> {
        let count = data.len() / SECTOR_SIZE;
        let tf = TaskFile::lba28(lba, count, self.slave)?;

        self.channel.wait_bsy()?;
        self.channel.issue(&tf, CMD_WRITE_SECTORS);

        for sector in data.chunks_exact(SECTOR_SIZE) {
            self.channel.wait_bsy()?;
            self.channel.wait_drq()?;
            for word in sector.chunks_exact(2) {
                self.channel.write_data(u16::from_le_bytes([word[0], word[1]]));
            }
        }
        self.channel.wait_bsy()?;
        Ok(())
    }
}

impl DiskBackend for PioDisk {
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
        let mut buf = vec![0u8; count * SECTOR_SIZE];
        let _claim = ChannelClaim::acquire(self.channel.index);

        for (i, chunk) in buf.chunks_mut(PIO_MAX_SECTORS * SECTOR_SIZE).enumerate() {
            self.read_chunk(sector + (i * PIO_MAX_SECTORS) as u64, chunk)?;
        }
        Ok(buf)
    }

    fn write_sector(&mut self, sector: u64, data: &[u8]) -> DiskResult<()> {
        if data.len() % SECTOR_SIZE != 0 {
            return Err(DiskError::Aborted);
        }
        self.check(sector, data.len() / SECTOR_SIZE)?;
        let _claim = ChannelClaim::acquire(self.channel.index);

        for (i, chunk) in data.chunks(PIO_MAX_SECTORS * SECTOR_SIZE).enumerate() {
            self.write_chunk(sector + (i * PIO_MAX_SECTORS) as u64, chunk)?;
        }
        Ok(())
    }

    fn flush_hardware_cache(&mut self) -> DiskResult<()> {
        let _claim = ChannelClaim::acquire(self.channel.index);
        self.channel.flush_cache(self.slave)?;
        Ok(())
    }
}
