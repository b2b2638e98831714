//! Formatter for empty single-group volumes.
//!
//! Layout, in blocks: boot block and superblock, group descriptor at 2,
//! block bitmap at 3, inode bitmap at 4, inode table from 5, then the root
//! directory block and free data.

use alloc::{string::String, sync::Arc, vec};

use log::info;

use super::{
    layout::{
        DiskInode, Ext2SuperBlock, GroupDesc, EXT2_DYNAMIC_REV, EXT2_ERRORS_CONTINUE, EXT2_MAGIC,
        EXT2_VALID_FS, GOOD_OLD_FIRST_INO, GROUP_DESC_BLOCK, INODE_SIZE, ROOT_INO,
    },
    Ext2State,
};
use crate::{
    bitmap,
    device::{BlockDevice, SECTOR_SIZE},
    error::{FsError, FsResult},
    vfs::InodeMode,
    DEFAULT_BLOCK_SIZE,
};

const BLOCK_BITMAP_BLOCK: u32 = GROUP_DESC_BLOCK + 1;
const INODE_BITMAP_BLOCK: u32 = GROUP_DESC_BLOCK + 2;
const INODE_TABLE_BLOCK: u32 = GROUP_DESC_BLOCK + 3;

/// Geometry of a new volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MkfsOptions {
    /// 1024, 2048 or 4096.
    pub block_size: u32,
    pub blocks_count: u32,
    pub inodes_count: u32,
    /// First sector of the partition.
    pub base_lba: u64,
    /// At most 16 bytes are kept.
    pub volume_name: String,
}

impl Default for MkfsOptions {
    /// A 1 MiB volume with 128 inodes.
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            blocks_count: (1 << 20) / DEFAULT_BLOCK_SIZE,
            inodes_count: 128,
            base_lba: 0,
            volume_name: String::from("ext2kfs"),
        }
    }
}

impl MkfsOptions {
    /// Sectors the device must have, partition offset included.
    pub fn device_sectors(&self) -> usize {
        self.base_lba as usize + self.blocks_count as usize * self.block_size as usize / SECTOR_SIZE
    }

    fn inode_table_blocks(&self) -> u32 {
        (self.inodes_count * INODE_SIZE as u32 + self.block_size - 1) / self.block_size
    }

    fn first_data_block(&self) -> u32 {
        if self.block_size == 1024 {
            1
        } else {
            0
        }
    }

    fn validate(&self) -> FsResult<()> {
        if !matches!(self.block_size, 1024 | 2048 | 4096) {
            log::error!("mkfs: unsupported block size {}", self.block_size);
            return Err(FsError::InvalidArgument);
        }
        let bits = self.block_size * 8;
        if self.inodes_count < GOOD_OLD_FIRST_INO || self.inodes_count > bits {
            log::error!("mkfs: {} inodes do not fit one group", self.inodes_count);
            return Err(FsError::InvalidArgument);
        }
        let root_block = INODE_TABLE_BLOCK + self.inode_table_blocks();
        if self.blocks_count <= root_block + 1 || self.blocks_count - self.first_data_block() > bits {
            log::error!("mkfs: {} blocks do not fit one group", self.blocks_count);
            return Err(FsError::InvalidArgument);
        }
        Ok(())
    }
}

/// Writes a bitmap block with bits `0..used` set, plus every bit from
/// `usable` to the end of the block.
fn write_bitmap(state: &Ext2State, blkno: u32, used: u32, usable: u32) -> FsResult<()> {
    let bits = (state.block_size() * 8) as u32;
    let mut words = vec![0u32; bitmap::words_for(bits)];
    for bit in (0..used).chain(usable..bits) {
        bitmap::set_bit(&mut words, bit);
    }
    let mut block = state.new_block_buf();
    bitmap::bytes_from_words(&words, &mut block);
    state.write_block(blkno, &block)
}

/// Formats `dev` as an empty volume holding only the root directory.
pub fn mkfs(dev: Arc<dyn BlockDevice>, opts: &MkfsOptions) -> FsResult<()> {
    opts.validate()?;
    let first_data_block = opts.first_data_block();
    let root_block = INODE_TABLE_BLOCK + opts.inode_table_blocks();
    let used_blocks = root_block + 1 - first_data_block;
    let data_bits = opts.blocks_count - first_data_block;
    let reserved_inodes = GOOD_OLD_FIRST_INO - 1;

    let mut sb = Ext2SuperBlock {
        inodes_count: opts.inodes_count,
        blocks_count: opts.blocks_count,
        free_blocks_count: data_bits - used_blocks,
        free_inodes_count: opts.inodes_count - reserved_inodes,
        first_data_block,
        log_block_size: (opts.block_size / 1024).trailing_zeros(),
        log_frag_size: (opts.block_size / 1024).trailing_zeros(),
        blocks_per_group: opts.block_size * 8,
        frags_per_group: opts.block_size * 8,
        inodes_per_group: opts.inodes_count,
        max_mnt_count: 20,
        magic: EXT2_MAGIC,
        state: EXT2_VALID_FS,
        errors: EXT2_ERRORS_CONTINUE,
        rev_level: EXT2_DYNAMIC_REV,
        first_ino: GOOD_OLD_FIRST_INO,
        inode_size: INODE_SIZE as u16,
        ..Default::default()
    };
    let label = opts.volume_name.as_bytes();
    let label_len = label.len().min(sb.volume_name.len());
    sb.volume_name[..label_len].copy_from_slice(&label[..label_len]);

    let state = Ext2State::new(dev, opts.base_lba, sb)?;
    let zero = state.new_block_buf();
    for blkno in 0..=root_block {
        state.write_block(blkno, &zero)?;
    }
    state.write_superblock()?;
    state.write_group_desc(&GroupDesc {
        block_bitmap: BLOCK_BITMAP_BLOCK,
        inode_bitmap: INODE_BITMAP_BLOCK,
        inode_table: INODE_TABLE_BLOCK,
        free_blocks_count: (data_bits - used_blocks) as u16,
        free_inodes_count: (opts.inodes_count - reserved_inodes) as u16,
        used_dirs_count: 1,
    })?;
    write_bitmap(&state, BLOCK_BITMAP_BLOCK, used_blocks, data_bits)?;
    write_bitmap(&state, INODE_BITMAP_BLOCK, reserved_inodes, opts.inodes_count)?;

    let mut root = DiskInode::new(InodeMode::from_bits_truncate(0x41ED));
    root.links_count = 2;
    root.size = opts.block_size;
    root.blocks = 1;
    root.block[0] = root_block;
    state.write_inode(ROOT_INO, &root)?;
    state.init_dir_block(root_block, ROOT_INO, ROOT_INO)?;

    info!(
        "mkfs: {} blocks of {} bytes, {} inodes, data from block {}",
        opts.blocks_count,
        opts.block_size,
        opts.inodes_count,
        root_block + 1
    );
    Ok(())
}
