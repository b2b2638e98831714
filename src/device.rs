//! Block device interface consumed by the ext2 driver.
//!
//! Devices are sector addressed. The driver translates filesystem block
//! numbers to sector numbers itself (see `ext2::Ext2State::block_lba`), so a
//! device only ever sees whole-sector transfers.

use alloc::{sync::Arc, vec, vec::Vec};

use spin::Mutex;

use crate::error::DeviceError;

/// Sector size assumed by the driver when the device does not say otherwise.
pub const SECTOR_SIZE: usize = 512;

/// API provided for the filesystem driver
pub trait BlockDevice: Send + Sync {
    /// Sector size in bytes
    fn sector_size(&self) -> usize {
        SECTOR_SIZE
    }

    /// Read `buf.len()` bytes starting at sector `lba`.
    fn read(&self, lba: u64, buf: &mut [u8]) -> Result<(), DeviceError>;

    /// Write `buf.len()` bytes starting at sector `lba`.
    fn write(&self, lba: u64, buf: &[u8]) -> Result<(), DeviceError>;
}

/// In-memory disk. Clones share the same storage, so a test can keep a
/// handle to inspect the image while the filesystem owns another.
#[derive(Clone)]
pub struct RamDisk {
    data: Arc<Mutex<Vec<u8>>>,
    /// Fail every transfer once set. Used to exercise I/O error paths.
    broken: Arc<Mutex<bool>>,
}

impl core::fmt::Debug for RamDisk {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RamDisk")
            .field("bytes", &self.data.lock().len())
            .finish()
    }
}

impl RamDisk {
    /// A zero-filled disk of `sectors` sectors.
    pub fn new(sectors: usize) -> Self {
        Self::from_bytes(vec![0u8; sectors * SECTOR_SIZE])
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            data: Arc::new(Mutex::new(bytes)),
            broken: Arc::new(Mutex::new(false)),
        }
    }

    /// Copy of the whole image.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_broken(&self, broken: bool) {
        *self.broken.lock() = broken;
    }

    fn range(&self, lba: u64, len: usize, total: usize) -> Result<core::ops::Range<usize>, DeviceError> {
        if len % SECTOR_SIZE != 0 {
            return Err(DeviceError::Unaligned(len));
        }
        let start = (lba as usize)
            .checked_mul(SECTOR_SIZE)
            .ok_or(DeviceError::OutOfRange(lba))?;
        let end = start.checked_add(len).ok_or(DeviceError::OutOfRange(lba))?;
        if end > total {
            return Err(DeviceError::OutOfRange(lba));
        }
        Ok(start..end)
    }
}

impl BlockDevice for RamDisk {
    fn read(&self, lba: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        if *self.broken.lock() {
            return Err(DeviceError::Transfer);
        }
        let data = self.data.lock();
        let range = self.range(lba, buf.len(), data.len())?;
        buf.copy_from_slice(&data[range]);
        Ok(())
    }

    fn write(&self, lba: u64, buf: &[u8]) -> Result<(), DeviceError> {
        if *self.broken.lock() {
            return Err(DeviceError::Transfer);
        }
        let mut data = self.data.lock();
        let range = self.range(lba, buf.len(), data.len())?;
        data[range].copy_from_slice(buf);
        Ok(())
    }
}
