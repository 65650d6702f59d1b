use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use super::{DiskBackend, DiskError, DiskResult, MediaType};

/// RAM-backed disk, used for boot modules and as a scratch device.
pub struct MemoryDisk {
    name: String,
    sector_size: usize,
    data: Vec<u8>,
}

impl MemoryDisk {
    pub fn new(name: &str, sector_size: usize, sectors: usize) -> Self {
        MemoryDisk {
            name: String::from(name),
            sector_size,
            data: vec![0; sector_size * sectors],
        }
    }

    /// Wrap an existing image; a partial trailing sector is zero-padded.
    pub fn from_image(name: &str, sector_size: usize, mut image: Vec<u8>) -> Self {
        let rem = image.len() % sector_size;
        if rem != 0 {
            image.resize(image.len() + sector_size - rem, 0);
        }
        MemoryDisk {
            name: String::from(name),
            sector_size,
            data: image,
        }
    }

    fn span(&self, sector: u64, len: usize) -> DiskResult<core::ops::Range<usize>> {
        let start = (sector as usize).checked_mul(self.sector_size).ok_or(DiskError::BadSector)?;
        let end = start.checked_add(len).ok_or(DiskError::BadSector)?;
        if end > self.data.len() {
            return Err(DiskError::BadSector);
        }
        Ok(start..end)
    }
}

impl DiskBackend for MemoryDisk {
    fn drive_name(&self) -> &str {
        &self.name
    }

    fn media_type(&self) -> MediaType {
        MediaType::Memory
    }

    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn disk_size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_sector(&mut self, sector: u64, count: usize) -> DiskResult<Vec<u8>> {
        let range = self.span(sector, count * self.sector_size)?;
        Ok(self.data[range].to_vec())
    }

    fn write_sector(&mut self, sector: u64, data: &[u8]) -> DiskResult<()> {
        if data.len() % self.sector_size != 0 {
            return Err(DiskError::Aborted);
        }
        let range = self.span(sector, data.len())?;
        self.data[range].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_is_padded() {
        let disk = MemoryDisk::from_image("ram0", 512, vec![1; 700]);
        assert_eq!(disk.disk_size(), 1024);
    }

    #[test]
    fn test_bounds() {
        let mut disk = MemoryDisk::new("ram0", 512, 2);
        assert_eq!(disk.read_sector(1, 2), Err(DiskError::BadSector));
        assert_eq!(disk.write_sector(2, &[0; 512]), Err(DiskError::BadSector));
        assert_eq!(disk.write_sector(0, &[0; 100]), Err(DiskError::Aborted));
        assert_eq!(disk.read_sector(u64::MAX, 1), Err(DiskError::BadSector));

        disk.write_sector(1, &[7; 512]).unwrap();
        assert_eq!(disk.read_sector(0, 2).unwrap()[512..], [7; 512]);
    }
}
