#![cfg_attr(not(test), no_std)]
extern crate alloc;

// Generic power-of-two region allocator, no filesystem knowledge
pub mod bitmap;
// Block device collaborator interface
pub mod device;
pub mod error;
// EXT2-like on-disk driver
pub mod ext2;
pub mod vfs;

#[cfg(test)]
mod fs_test;

pub use device::{BlockDevice, RamDisk, SECTOR_SIZE};
pub use error::{DeviceError, FsError, FsResult, RegionError, VfsResult};
pub use ext2::{mkfs, Ext2Fs, MkfsOptions, MountOptions};
pub use vfs::{Dentry, File, FsStat, Inode, InodeMode, SuperBlock, Vfs, Whence};

/// Block size picked by `MkfsOptions::default()`.
#[cfg(feature = "bs4k")]
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;
#[cfg(all(feature = "bs2k", not(feature = "bs4k")))]
pub const DEFAULT_BLOCK_SIZE: u32 = 2048;
#[cfg(not(any(feature = "bs2k", feature = "bs4k")))]
pub const DEFAULT_BLOCK_SIZE: u32 = 1024;

/// Little-endian `u32` at byte offset `$off`.
#[macro_export]
macro_rules! u32 {
    ($buf:expr, $off:expr) => {{
        let off = $off;
        u32::from_le_bytes([$buf[off], $buf[off + 1], $buf[off + 2], $buf[off + 3]])
    }};
}

/// Little-endian `u16` at byte offset `$off`.
#[macro_export]
macro_rules! u16 {
    ($buf:expr, $off:expr) => {{
        let off = $off;
        u16::from_le_bytes([$buf[off], $buf[off + 1]])
    }};
}

/// Stores `$val` little-endian at byte offset `$off`.
#[macro_export]
macro_rules! put_le {
    ($buf:expr, $off:expr, $val:expr) => {{
        let off = $off;
        let bytes = $val.to_le_bytes();
        $buf[off..off + bytes.len()].copy_from_slice(&bytes);
    }};
}
