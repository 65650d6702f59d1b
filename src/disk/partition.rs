//! MBR partition table scanning. Each valid primary entry becomes a
//! `DiskSlice` over the base disk.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use super::{DiskResult, DiskSlice, SharedDisk};

const ENTRY_TABLE: usize = 446;
const ENTRY_SIZE: usize = 16;
const PROTECTIVE_GPT: u8 = 0xEE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbrEntry {
    pub bootable: bool,
    pub partition_type: u8,
    pub start_lba: u32,
    pub sector_count: u32,
}

impl MbrEntry {
    fn from_bytes(data: &[u8]) -> Self {
        // CHS fields at [1..4] and [5..8] are ignored.
        MbrEntry {
            bootable: data[0] == 0x80,
            partition_type: data[4],
            start_lba: u32::from_le_bytes([data[8], data[9], data[10], data[11]]),
            sector_count: u32::from_le_bytes([data[12], data[13], data[14], data[15]]),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.partition_type != 0 && self.sector_count > 0
    }

    pub fn is_extended(&self) -> bool {
        matches!(self.partition_type, 0x05 | 0x0F | 0x85)
    }
}

/// Parsed sector 0. `None` unless the 0x55AA signature is present.
pub fn parse_mbr(sector: &[u8]) -> Option<[MbrEntry; 4]> {
    if sector.len() < 512 || sector[510] != 0x55 || sector[511] != 0xAA {
        return None;
    }
    let mut entries = [MbrEntry {
        bootable: false,
        partition_type: 0,
        start_lba: 0,
        sector_count: 0,
    }; 4];
    for (i, entry) in entries.iter_mut().enumerate() {
        let offset = ENTRY_TABLE + i * ENTRY_SIZE;
        *entry = MbrEntry::from_bytes(&sector[offset..offset + ENTRY_SIZE]);
    }
    Some(entries)
}

/// Slices for the primary partitions of `base`, named `<base>p<n>` with
/// `n` the 1-based table slot. Extended containers, protective GPT entries
/// and entries reaching past the end of the disk are skipped.
pub fn scan(base: &SharedDisk) -> DiskResult<Vec<DiskSlice>> {
    let (sector0, total, name) = {
        let mut disk = base.lock();
        let sector0 = disk.read_sectors(0, 1)?;
        (sector0, disk.sector_count(), String::from(disk.drive_name()))
    };

    let Some(entries) = parse_mbr(&sector0) else {
        return Ok(Vec::new());
    };

    let mut slices = Vec::new();
    for (i, entry) in entries.iter().enumerate() {
        if !entry.is_valid() || entry.is_extended() || entry.partition_type == PROTECTIVE_GPT {
            continue;
        }
        let start = entry.start_lba as u64;
        let count = entry.sector_count as u64;
        if start == 0 || start + count > total {
            crate::log_warn!("{}: partition {} lies outside the disk, skipped.", name, i + 1);
            continue;
        }
        slices.push(DiskSlice::new(&format!("{}p{}", name, i + 1), base.clone(), start, count));
    }
    Ok(slices)
}
