use crate::sync::SpinLock;
use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

/// Size of a block device sector in bytes.
///
/// All IDE disks use this sector size, as do most USB and SCSI disks.
pub const BLOCK_SECTOR_SIZE: usize = 512;

/// Index of a block device sector.
///
/// Good enough for devices up to 2 TB.
pub type BlockSector = u32;

/// Lower-level interface to block device drivers.
pub trait BlockOp {
    /// Read a block sector into `buf` (`BLOCK_SECTOR_SIZE` bytes).
    fn read(&self, sector: BlockSector, buf: &mut [u8]);
    /// Write a block sector from `buf` (`BLOCK_SECTOR_SIZE` bytes).
    fn write(&self, sector: BlockSector, buf: &[u8]);
}

/// A block device.
///
/// Wraps a driver with sector bounds checks and I/O accounting.
pub struct Block {
    driver: Box<dyn BlockOp>,
    /// The size of the block device in sectors.
    size: BlockSector,
    read_count: usize,
    write_count: usize,
}

impl Block {
    pub fn new(driver: Box<dyn BlockOp>, size: BlockSector) -> Self {
        Block {
            driver,
            size,
            read_count: 0,
            write_count: 0,
        }
    }

    /// Verifies that `buf` is a valid buffer for reading or writing a block sector.
    ///
    /// Panics if the buffer is not the correct size (i.e., `BLOCK_SECTOR_SIZE` bytes).
    fn verify_buffer(buf: &[u8]) {
        if buf.len() != BLOCK_SECTOR_SIZE {
            panic!("Invalid buffer size {}", buf.len());
        }
    }

    /// Verifies that `sector` is a valid offset within the block device.
    ///
    /// Panics if the sector is out of bounds.
    fn check_sector(&self, sector: BlockSector) {
        if sector >= self.size {
            panic!("Invalid sector {} (block size: {})", sector, self.size);
        }
    }

    /// Reads sector `sector` from the block device into `buf`, which must have
    /// room for `BLOCK_SECTOR_SIZE` bytes.
    pub fn read(&mut self, sector: BlockSector, buf: &mut [u8]) {
        self.check_sector(sector);
        Self::verify_buffer(buf);

        self.driver.read(sector, buf);
        self.read_count += 1;
    }

    /// Writes sector `sector` from `buf`, which must contain `BLOCK_SECTOR_SIZE`
    /// bytes. Returns after the block device has acknowledged receiving the data.
    pub fn write(&mut self, sector: BlockSector, buf: &[u8]) {
        self.check_sector(sector);
        Self::verify_buffer(buf);

        self.driver.write(sector, buf);
        self.write_count += 1;
    }

    pub fn size(&self) -> BlockSector {
        self.size
    }
    pub fn read_count(&self) -> usize {
        self.read_count
    }
    pub fn write_count(&self) -> usize {
        self.write_count
    }
}

/// Memory-backed block device, for the host test harness and for kernels
/// that reserve a RAM region as scratch swap before real drivers come up.
pub struct RamDisk {
    data: SpinLock<Vec<u8>>,
}

impl RamDisk {
    pub fn new(sectors: BlockSector) -> Self {
        RamDisk {
            data: SpinLock::new(vec![0; sectors as usize * BLOCK_SECTOR_SIZE]),
        }
    }

    /// A `Block` wrapping a fresh ram disk of `sectors` sectors.
    pub fn block(sectors: BlockSector) -> Block {
        Block::new(Box::new(RamDisk::new(sectors)), sectors)
    }
}

impl BlockOp for RamDisk {
    fn read(&self, sector: BlockSector, buf: &mut [u8]) {
        let data = self.data.lock();
        let start = sector as usize * BLOCK_SECTOR_SIZE;
        buf.copy_from_slice(&data[start..start + BLOCK_SECTOR_SIZE]);
    }

    fn write(&self, sector: BlockSector, buf: &[u8]) {
        let mut data = self.data.lock();
        let start = sector as usize * BLOCK_SECTOR_SIZE;
        data[start..start + BLOCK_SECTOR_SIZE].copy_from_slice(buf);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ram_disk_round_trip() {
        let mut block = RamDisk::block(4);
        let mut sector = [0xabu8; BLOCK_SECTOR_SIZE];
        block.write(2, &sector);
        sector.fill(0);
        block.read(2, &mut sector);
        assert!(sector.iter().all(|&b| b == 0xab));
        // untouched sectors read back zeroed
        block.read(3, &mut sector);
        assert!(sector.iter().all(|&b| b == 0));
        assert_eq!(block.read_count(), 2);
        assert_eq!(block.write_count(), 1);
    }

    #[test]
    #[should_panic(expected = "Invalid sector")]
    fn out_of_bounds_sector() {
        let mut block = RamDisk::block(2);
        let mut buf = [0u8; BLOCK_SECTOR_SIZE];
        block.read(2, &mut buf);
    }

    #[test]
    #[should_panic(expected = "Invalid buffer size")]
    fn wrong_buffer_size() {
        let mut block = RamDisk::block(2);
        block.write(0, &[0u8; 10]);
    }
}
