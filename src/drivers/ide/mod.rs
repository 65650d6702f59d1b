//! Legacy IDE controller: two channels, each with a master and a slave.
//!
//! Commands use LBA28 addressing. Drives are driven by PIO, or by bus-master
//! DMA when the caller supplies the controller's bus-master I/O base.

#[cfg(not(test))]
pub mod dma;
#[cfg(not(test))]
pub mod pio;

use alloc::string::String;
use bit_field::BitField;
use core::fmt;
use core::sync::atomic::{AtomicU16, Ordering};
use x86_64::instructions::port::Port;

use crate::disk::completion::Completion;
use crate::disk::{DiskError, DiskResult};
#[cfg(not(test))]
use crate::disk::SharedDisk;
#[cfg(not(test))]
use alloc::vec::Vec;

// Port offsets relative to the channel's I/O base
const DATA_REG: u16 = 0;
const ERROR_REG: u16 = 1; // R: error / W: features
const SECTOR_COUNT: u16 = 2;
const LBA_LOW: u16 = 3;
const LBA_MID: u16 = 4;
const LBA_HIGH: u16 = 5;
const DRIVE_HEAD: u16 = 6;
const CMD_STATUS: u16 = 7; // R: status / W: command

pub const STATUS_BSY: u8 = 0x80;
pub const STATUS_DF: u8 = 0x20;
pub const STATUS_DRQ: u8 = 0x08;
pub const STATUS_ERR: u8 = 0x01;

pub const CMD_READ_SECTORS: u8 = 0x20;
pub const CMD_WRITE_SECTORS: u8 = 0x30;
pub const CMD_READ_DMA: u8 = 0xC8;
pub const CMD_WRITE_DMA: u8 = 0xCA;
pub const CMD_CACHE_FLUSH: u8 = 0xE7;
pub const CMD_IDENTIFY: u8 = 0xEC;

const CTRL_NIEN: u8 = 0x02;

// Bus-master register block, relative to the channel's bus-master base
pub const BM_COMMAND: u16 = 0;
pub const BM_STATUS: u16 = 2;
pub const BM_PRDT: u16 = 4;

pub const BM_CMD_START: u8 = 0x01;
pub const BM_CMD_READ: u8 = 0x08; // device to memory
pub const BM_STATUS_ERROR: u8 = 0x02;
pub const BM_STATUS_IRQ: u8 = 0x04;

const LBA28_LIMIT: u64 = 1 << 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtaError {
    DeviceNotFound,
    DeviceFault,
    BusyTimeout,
    DrqTimeout,
    /// ERR was set; carries the error register.
    Command(u8),
}

impl fmt::Display for AtaError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AtaError::DeviceNotFound => write!(f, "Device not found"),
            AtaError::DeviceFault => write!(f, "Device fault"),
            AtaError::BusyTimeout => write!(f, "BSY timeout"),
            AtaError::DrqTimeout => write!(f, "DRQ timeout"),
            AtaError::Command(err) => write!(f, "Command failed (error {:#04x})", err),
        }
    }
}

pub type AtaResult<T> = Result<T, AtaError>;

impl From<AtaError> for DiskError {
    fn from(err: AtaError) -> Self {
        match err {
            AtaError::DeviceNotFound => DiskError::NoMedia,
            AtaError::DeviceFault => DiskError::Aborted,
            AtaError::BusyTimeout | AtaError::DrqTimeout => DiskError::TimeOut,
            AtaError::Command(reg) => error_from_register(reg),
        }
    }
}

/// Classify the ATA error register.
pub fn error_from_register(reg: u8) -> DiskError {
    const AMNF: u8 = 0x01;
    const ABRT: u8 = 0x04;
    const MCR: u8 = 0x08;
    const IDNF: u8 = 0x10;
    const MC: u8 = 0x20;
    const UNC: u8 = 0x40;
    const BBK: u8 = 0x80;

    if reg & (UNC | BBK | IDNF | AMNF) != 0 {
        DiskError::BadSector
    } else if reg & (MC | MCR) != 0 {
        DiskError::NoMedia
    } else if reg & ABRT != 0 {
        DiskError::Aborted
    } else {
        DiskError::Unknown
    }
}

/// Register values for an LBA28 command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskFile {
    pub drive_head: u8,
    pub sector_count: u8,
    pub lba_low: u8,
    pub lba_mid: u8,
    pub lba_high: u8,
}

impl TaskFile {
    /// `count` must be 1..=256; 256 is encoded as 0.
    pub fn lba28(lba: u64, count: usize, slave: bool) -> DiskResult<Self> {
        if count == 0 || count > 256 {
            return Err(DiskError::Aborted);
        }
        if lba + count as u64 > LBA28_LIMIT {
            return Err(DiskError::BadSector);
        }
        let mut drive_head: u8 = 0xA0;
        drive_head.set_bit(6, true);
        drive_head.set_bit(4, slave);
        drive_head.set_bits(0..4, lba.get_bits(24..28) as u8);

        Ok(TaskFile {
            drive_head,
            sector_count: count as u8,
            lba_low: lba.get_bits(0..8) as u8,
            lba_mid: lba.get_bits(8..16) as u8,
            lba_high: lba.get_bits(16..24) as u8,
        })
    }
}

/// What IDENTIFY DEVICE told us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifyInfo {
    pub model: String,
    pub sectors: u64,
    pub dma: bool,
    pub lba48: bool,
}

impl IdentifyInfo {
    pub fn parse(words: &[u16; 256]) -> Self {
        let mut model = String::new();
        // Model string: words 27..47, two ASCII bytes per word, high byte first.
        for word in &words[27..47] {
            for byte in [(*word >> 8) as u8, *word as u8] {
                model.push(if byte.is_ascii_graphic() { byte as char } else { ' ' });
            }
        }
        let model = String::from(model.trim_end());

        let sectors = (words[61] as u64) << 16 | words[60] as u64;
        IdentifyInfo {
            model,
            sectors: sectors.min(LBA28_LIMIT),
            dma: words[49].get_bit(8),
            lba48: words[83].get_bit(10),
        }
    }
}

/// One IDE channel's register block.
#[derive(Debug, Clone, Copy)]
pub struct Channel {
    pub index: usize,
    pub io_base: u16,
    pub ctrl_base: u16,
}

pub const PRIMARY: Channel = Channel { index: 0, io_base: 0x1F0, ctrl_base: 0x3F6 };
pub const SECONDARY: Channel = Channel { index: 1, io_base: 0x170, ctrl_base: 0x376 };
pub const CHANNELS: [Channel; 2] = [PRIMARY, SECONDARY];

/// Command completions, one per channel, filled by the IRQ 14/15 handlers.
pub static COMPLETIONS: [Completion; 2] = [Completion::new(), Completion::new()];

/// Bus-master register base per channel; 0 when DMA is unavailable.
static BUS_MASTER: [AtomicU16; 2] = [AtomicU16::new(0), AtomicU16::new(0)];

pub fn bus_master(channel: usize) -> Option<u16> {
    match BUS_MASTER[channel].load(Ordering::Relaxed) {
        0 => None,
        base => Some(base),
    }
}

#[cfg(not(test))]
static CHANNEL_BUSY: [core::sync::atomic::AtomicBool; 2] =
    [core::sync::atomic::AtomicBool::new(false), core::sync::atomic::AtomicBool::new(false)];

/// Exclusive use of a channel for one command. Contending tasks yield.
#[cfg(not(test))]
pub struct ChannelClaim(usize);

#[cfg(not(test))]
impl ChannelClaim {
    pub fn acquire(channel: usize) -> Self {
        while CHANNEL_BUSY[channel]
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            crate::tasking::kernel_yield();
        }
        ChannelClaim(channel)
    }
}

#[cfg(not(test))]
impl Drop for ChannelClaim {
    fn drop(&mut self) {
        CHANNEL_BUSY[self.0].store(false, Ordering::Release);
    }
}

/// Drive naming: hda, hdb on the primary channel, hdc, hdd on the secondary.
pub fn drive_name(channel: usize, slave: bool) -> String {
    let letter = (b'a' + (channel * 2 + slave as usize) as u8) as char;
    alloc::format!("hd{}", letter)
}

impl Channel {
    pub fn read_reg(&self, offset: u16) -> u8 {
        let mut port = Port::<u8>::new(self.io_base + offset);
        unsafe { port.read() }
    }

    pub fn write_reg(&self, offset: u16, val: u8) {
        let mut port = Port::<u8>::new(self.io_base + offset);
        unsafe { port.write(val) }
    }

    pub fn read_data(&self) -> u16 {
        let mut port = Port::<u16>::new(self.io_base + DATA_REG);
        unsafe { port.read() }
    }

    pub fn write_data(&self, val: u16) {
        let mut port = Port::<u16>::new(self.io_base + DATA_REG);
        unsafe { port.write(val) }
    }

    /// Reading the status register acknowledges a pending INTRQ.
    pub fn status(&self) -> u8 {
        self.read_reg(CMD_STATUS)
    }

    pub fn error(&self) -> u8 {
        self.read_reg(ERROR_REG)
    }

    fn alt_status(&self) -> u8 {
        let mut port = Port::<u8>::new(self.ctrl_base);
        unsafe { port.read() }
    }

    pub fn set_interrupts(&self, enabled: bool) {
        let mut port = Port::<u8>::new(self.ctrl_base);
        unsafe { port.write(if enabled { 0 } else { CTRL_NIEN }) }
    }

    /// Four alternate-status reads give the drive its 400ns.
    pub fn delay_400ns(&self) {
        for _ in 0..4 {
            let _ = self.alt_status();
        }
    }

    pub fn wait_bsy(&self) -> AtaResult<()> {
        for _ in 0..100_000 {
            if self.status() & STATUS_BSY == 0 {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(AtaError::BusyTimeout)
    }

    pub fn wait_drq(&self) -> AtaResult<()> {
        for _ in 0..100_000 {
            let status = self.status();
            if status & STATUS_ERR != 0 {
                return Err(AtaError::Command(self.error()));
            }
            if status & STATUS_DF != 0 {
                return Err(AtaError::DeviceFault);
            }
            if status & STATUS_DRQ != 0 {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(AtaError::DrqTimeout)
    }

    pub fn select(&self, slave: bool) {
        self.write_reg(DRIVE_HEAD, if slave { 0xB0 } else { 0xA0 });
        self.delay_400ns();
    }

    /// Load the task file and issue `command`.
    pub fn issue(&self, tf: &TaskFile, command: u8) {
        self.write_reg(DRIVE_HEAD, tf.drive_head);
        self.delay_400ns();
        self.write_reg(ERROR_REG, 0); // features
        self.write_reg(SECTOR_COUNT, tf.sector_count);
        self.write_reg(LBA_LOW, tf.lba_low);
        self.write_reg(LBA_MID, tf.lba_mid);
        self.write_reg(LBA_HIGH, tf.lba_high);
        self.write_reg(CMD_STATUS, command);
    }

    pub fn flush_cache(&self, slave: bool) -> AtaResult<()> {
        self.wait_bsy()?;
        self.select(slave);
        self.write_reg(CMD_STATUS, CMD_CACHE_FLUSH);
        self.wait_bsy()?;
        if self.status() & STATUS_ERR != 0 {
            return Err(AtaError::Command(self.error()));
        }
        Ok(())
    }

    /// IDENTIFY DEVICE. ATAPI and absent drives report `DeviceNotFound`.
    pub fn identify(&self, slave: bool) -> AtaResult<IdentifyInfo> {
        self.select(slave);
        self.write_reg(SECTOR_COUNT, 0);
        self.write_reg(LBA_LOW, 0);
        self.write_reg(LBA_MID, 0);
        self.write_reg(LBA_HIGH, 0);
        self.write_reg(CMD_STATUS, CMD_IDENTIFY);

        if self.status() == 0 {
            return Err(AtaError::DeviceNotFound);
        }
        self.wait_bsy()?;
        if self.read_reg(LBA_MID) != 0 || self.read_reg(LBA_HIGH) != 0 {
            return Err(AtaError::DeviceNotFound);
        }
        self.wait_drq()?;

        let mut words = [0u16; 256];
        for word in words.iter_mut() {
            *word = self.read_data();
        }
        Ok(IdentifyInfo::parse(&words))
    }
}

/// IRQ 14/15 body: acknowledge the drive, collect the outcome and wake the
/// task that issued the command.
pub fn handle_interrupt(channel: usize) {
    let ch = &CHANNELS[channel];
    let status = ch.status();
    let mut result = if status & STATUS_ERR != 0 {
        Err(error_from_register(ch.error()))
    } else {
        Ok(())
    };

    if let Some(base) = bus_master(channel) {
        let mut port = Port::<u8>::new(base + BM_STATUS);
        let bm_status = unsafe { port.read() };
        if bm_status & BM_STATUS_ERROR != 0 && result.is_ok() {
            result = Err(DiskError::Unknown);
        }
        // Interrupt and error bits are write-one-to-clear.
        unsafe { port.write(bm_status | BM_STATUS_ERROR | BM_STATUS_IRQ) };
    }

    if let Some(pid) = COMPLETIONS[channel].publish(result) {
        crate::tasking::complete_io(pid);
    }
}

/// Scan all four drive positions and register a disk for each ATA drive
/// found. `bus_master_base` is BAR4 of the IDE controller when the platform
/// exposes one.
///
/// Returns the registered disks. Their partition tables are read by the
/// caller: a DMA read completes through IRQ 14/15, which the drive only
/// raises once its channel has interrupts enabled at the end of probing.
#[cfg(not(test))]
pub fn init(bus_master_base: Option<u16>) -> Vec<SharedDisk> {
    use alloc::boxed::Box;
    use crate::disk::{Disk, DiskBackend, DISKS};

    if let Some(base) = bus_master_base {
        BUS_MASTER[0].store(base, Ordering::Relaxed);
        BUS_MASTER[1].store(base + 8, Ordering::Relaxed);
    }

    let mut found = Vec::new();
    for channel in CHANNELS {
        channel.set_interrupts(false);
        for slave in [false, true] {
            let name = drive_name(channel.index, slave);
            let info = match channel.identify(slave) {
                Ok(info) => info,
                Err(_) => continue,
            };
            crate::log_info!("IDE: {} \"{}\", {} sectors.", name, info.model, info.sectors);

            let backend: Box<dyn DiskBackend> = match bus_master(channel.index) {
                Some(bm) if info.dma => match dma::DmaDisk::new(channel, slave, name.clone(), info.sectors, bm) {
                    Some(disk) => Box::new(disk),
                    None => Box::new(pio::PioDisk::new(channel, slave, name.clone(), info.sectors)),
                },
                _ => Box::new(pio::PioDisk::new(channel, slave, name.clone(), info.sectors)),
            };

            match DISKS.lock().register(Disk::new(backend)) {
                Ok(disk) => found.push(disk),
                Err(e) => crate::log_warn!("IDE: {} not registered: {}", name, e),
            }
        }
        if bus_master(channel.index).is_some() {
            channel.set_interrupts(true);
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_file_packs_lba28() {
        let tf = TaskFile::lba28(0x0ABC_DEF1, 3, true).unwrap();
        assert_eq!(tf.drive_head, 0xA0 | 0x40 | 0x10 | 0x0A);
        assert_eq!((tf.lba_low, tf.lba_mid, tf.lba_high), (0xF1, 0xDE, 0xBC));
        assert_eq!(tf.sector_count, 3);

        let tf = TaskFile::lba28(0, 256, false).unwrap();
        assert_eq!(tf.sector_count, 0);
        assert_eq!(tf.drive_head, 0xE0);
    }

    #[test]
    fn test_task_file_limits() {
        assert_eq!(TaskFile::lba28(0, 0, false), Err(DiskError::Aborted));
        assert_eq!(TaskFile::lba28(0, 257, false), Err(DiskError::Aborted));
        assert_eq!(TaskFile::lba28(LBA28_LIMIT - 1, 2, false), Err(DiskError::BadSector));
        assert!(TaskFile::lba28(LBA28_LIMIT - 1, 1, false).is_ok());
    }

    #[test]
    fn test_error_register_classification() {
        assert_eq!(error_from_register(0x40), DiskError::BadSector);
        assert_eq!(error_from_register(0x10), DiskError::BadSector);
        assert_eq!(error_from_register(0x20), DiskError::NoMedia);
        assert_eq!(error_from_register(0x04), DiskError::Aborted);
        assert_eq!(error_from_register(0x00), DiskError::Unknown);
        assert_eq!(DiskError::from(AtaError::DrqTimeout), DiskError::TimeOut);
        assert_eq!(DiskError::from(AtaError::Command(0x44)), DiskError::BadSector);
    }

    #[test]
    fn test_identify_parsing() {
        let mut words = [0u16; 256];
        for (i, pair) in b"QEMU HARDDISK   ".chunks(2).enumerate() {
            words[27 + i] = (pair[0] as u16) << 8 | pair[1] as u16;
        }
        words[49] = 1 << 8;
        words[60] = 0x0000;
        words[61] = 0x0002;

        let info = IdentifyInfo::parse(&words);
        assert_eq!(info.model, "QEMU HARDDISK");
        assert_eq!(info.sectors, 0x20000);
        assert!(info.dma);
        assert!(!info.lba48);
    }

    #[test]
    fn test_drive_names() {
        assert_eq!(drive_name(0, false), "hda");
        assert_eq!(drive_name(0, true), "hdb");
        assert_eq!(drive_name(1, true), "hdd");
    }
}
