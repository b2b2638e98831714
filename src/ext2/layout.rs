//! Byte-exact on-disk structures. Everything is little-endian.

use alloc::vec::Vec;

use crate::{
    error::{FsError, FsResult},
    put_le, u16, u32,
    vfs::{FileType, InodeMode, KEY_LEN},
};

pub const EXT2_MAGIC: u16 = 0xEF53;
/// Byte offset of the superblock from the start of the volume.
pub const SUPERBLOCK_OFFSET: usize = 1024;
pub const SUPERBLOCK_SIZE: usize = 1024;
/// Block holding the (only) group descriptor.
pub const GROUP_DESC_BLOCK: u32 = 2;
pub const GROUP_DESC_SIZE: usize = 32;
pub const INODE_SIZE: usize = 128;
pub const ROOT_INO: u32 = 2;
/// First non-reserved inode for revision 0 volumes.
pub const GOOD_OLD_FIRST_INO: u32 = 11;
pub const DIRECT_BLOCKS: usize = 12;
/// `i_block` slot of the single indirect block.
pub const INDIRECT_SLOT: usize = 12;
pub const N_BLOCKS: usize = 15;
pub const DIRENT_HEADER_LEN: usize = 8;

pub const EXT2_VALID_FS: u16 = 1;
pub const EXT2_ERRORS_CONTINUE: u16 = 1;
pub const EXT2_DYNAMIC_REV: u32 = 1;

pub const EXT2_FT_UNKNOWN: u8 = 0;
pub const EXT2_FT_REG_FILE: u8 = 1;
pub const EXT2_FT_DIR: u8 = 2;
pub const EXT2_FT_CHRDEV: u8 = 3;
pub const EXT2_FT_BLKDEV: u8 = 4;
pub const EXT2_FT_FIFO: u8 = 5;
pub const EXT2_FT_SOCK: u8 = 6;
pub const EXT2_FT_SYMLINK: u8 = 7;

/// Directory record file type for an inode mode.
pub fn imode_to_ft(mode: InodeMode) -> u8 {
    match mode.file_type() {
        FileType::RegularFile => EXT2_FT_REG_FILE,
        FileType::Directory => EXT2_FT_DIR,
        FileType::CharDevice => EXT2_FT_CHRDEV,
        FileType::BlockDevice => EXT2_FT_BLKDEV,
        FileType::Fifo => EXT2_FT_FIFO,
        FileType::Socket => EXT2_FT_SOCK,
        FileType::Symlink => EXT2_FT_SYMLINK,
        FileType::Unknown => EXT2_FT_UNKNOWN,
    }
}

/// Name length rounded up to a multiple of 4.
#[inline]
pub fn pad4(len: usize) -> usize {
    (len + 3) & !3
}

/// Smallest record able to hold a name of `name_len` bytes.
#[inline]
pub fn rec_len_for(name_len: usize) -> usize {
    DIRENT_HEADER_LEN + pad4(name_len)
}

/// In-memory mirror of the on-disk superblock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ext2SuperBlock {
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub r_blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub log_frag_size: u32,
    pub blocks_per_group: u32,
    pub frags_per_group: u32,
    pub inodes_per_group: u32,
    pub mtime: u32,
    pub wtime: u32,
    pub mnt_count: u16,
    pub max_mnt_count: u16,
    pub magic: u16,
    pub state: u16,
    pub errors: u16,
    pub minor_rev_level: u16,
    pub lastcheck: u32,
    pub checkinterval: u32,
    pub creator_os: u32,
    pub rev_level: u32,
    pub def_resuid: u16,
    pub def_resgid: u16,
    pub first_ino: u32,
    pub inode_size: u16,
    pub block_group_nr: u16,
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,
    pub uuid: [u8; 16],
    pub volume_name: [u8; 16],
    pub last_mounted: [u8; 64],
    pub algo_bitmap: u32,
}

impl Default for Ext2SuperBlock {
    fn default() -> Self {
        Self {
            inodes_count: 0,
            blocks_count: 0,
            r_blocks_count: 0,
            free_blocks_count: 0,
            free_inodes_count: 0,
            first_data_block: 0,
            log_block_size: 0,
            log_frag_size: 0,
            blocks_per_group: 0,
            frags_per_group: 0,
            inodes_per_group: 0,
            mtime: 0,
            wtime: 0,
            mnt_count: 0,
            max_mnt_count: 0,
            magic: 0,
            state: 0,
            errors: 0,
            minor_rev_level: 0,
            lastcheck: 0,
            checkinterval: 0,
            creator_os: 0,
            rev_level: 0,
            def_resuid: 0,
            def_resgid: 0,
            first_ino: 0,
            inode_size: 0,
            block_group_nr: 0,
            feature_compat: 0,
            feature_incompat: 0,
            feature_ro_compat: 0,
            uuid: [0; 16],
            volume_name: [0; 16],
            last_mounted: [0; 64],
            algo_bitmap: 0,
        }
    }
}

impl Ext2SuperBlock {
    pub fn parse(raw: &[u8]) -> FsResult<Self> {
        if raw.len() < SUPERBLOCK_SIZE {
            return Err(FsError::Corrupted);
        }
        let mut sb = Self {
            inodes_count: u32!(raw, 0),
            blocks_count: u32!(raw, 4),
            r_blocks_count: u32!(raw, 8),
            free_blocks_count: u32!(raw, 12),
            free_inodes_count: u32!(raw, 16),
            first_data_block: u32!(raw, 20),
            log_block_size: u32!(raw, 24),
            log_frag_size: u32!(raw, 28),
            blocks_per_group: u32!(raw, 32),
            frags_per_group: u32!(raw, 36),
            inodes_per_group: u32!(raw, 40),
            mtime: u32!(raw, 44),
            wtime: u32!(raw, 48),
            mnt_count: u16!(raw, 52),
            max_mnt_count: u16!(raw, 54),
            magic: u16!(raw, 56),
            state: u16!(raw, 58),
            errors: u16!(raw, 60),
            minor_rev_level: u16!(raw, 62),
            lastcheck: u32!(raw, 64),
            checkinterval: u32!(raw, 68),
            creator_os: u32!(raw, 72),
            rev_level: u32!(raw, 76),
            def_resuid: u16!(raw, 80),
            def_resgid: u16!(raw, 82),
            first_ino: u32!(raw, 84),
            inode_size: u16!(raw, 88),
            block_group_nr: u16!(raw, 90),
            feature_compat: u32!(raw, 92),
            feature_incompat: u32!(raw, 96),
            feature_ro_compat: u32!(raw, 100),
            algo_bitmap: u32!(raw, 200),
            ..Default::default()
        };
        sb.uuid.copy_from_slice(&raw[104..120]);
        sb.volume_name.copy_from_slice(&raw[120..136]);
        sb.last_mounted.copy_from_slice(&raw[136..200]);
        if sb.rev_level == 0 {
            sb.first_ino = GOOD_OLD_FIRST_INO;
            sb.inode_size = INODE_SIZE as u16;
        }
        Ok(sb)
    }

    /// Serializes into a `SUPERBLOCK_SIZE` buffer. Bytes past the known
    /// fields are zero.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut raw = alloc::vec![0u8; SUPERBLOCK_SIZE];
        put_le!(raw, 0, self.inodes_count);
        put_le!(raw, 4, self.blocks_count);
        put_le!(raw, 8, self.r_blocks_count);
        put_le!(raw, 12, self.free_blocks_count);
        put_le!(raw, 16, self.free_inodes_count);
        put_le!(raw, 20, self.first_data_block);
        put_le!(raw, 24, self.log_block_size);
        put_le!(raw, 28, self.log_frag_size);
        put_le!(raw, 32, self.blocks_per_group);
        put_le!(raw, 36, self.frags_per_group);
        put_le!(raw, 40, self.inodes_per_group);
        put_le!(raw, 44, self.mtime);
        put_le!(raw, 48, self.wtime);
        put_le!(raw, 52, self.mnt_count);
        put_le!(raw, 54, self.max_mnt_count);
        put_le!(raw, 56, self.magic);
        put_le!(raw, 58, self.state);
        put_le!(raw, 60, self.errors);
        put_le!(raw, 62, self.minor_rev_level);
        put_le!(raw, 64, self.lastcheck);
        put_le!(raw, 68, self.checkinterval);
        put_le!(raw, 72, self.creator_os);
        put_le!(raw, 76, self.rev_level);
        put_le!(raw, 80, self.def_resuid);
        put_le!(raw, 82, self.def_resgid);
        put_le!(raw, 84, self.first_ino);
        put_le!(raw, 88, self.inode_size);
        put_le!(raw, 90, self.block_group_nr);
        put_le!(raw, 92, self.feature_compat);
        put_le!(raw, 96, self.feature_incompat);
        put_le!(raw, 100, self.feature_ro_compat);
        raw[104..120].copy_from_slice(&self.uuid);
        raw[120..136].copy_from_slice(&self.volume_name);
        raw[136..200].copy_from_slice(&self.last_mounted);
        put_le!(raw, 200, self.algo_bitmap);
        raw
    }

    pub fn block_size(&self) -> u32 {
        1024 << self.log_block_size
    }

    /// Rejects volumes this driver cannot address.
    pub fn validate(&self) -> FsResult<()> {
        if self.magic != EXT2_MAGIC {
            log::error!("bad superblock magic {:#06x}", self.magic);
            return Err(FsError::Corrupted);
        }
        if self.log_block_size > 2 {
            log::error!("unsupported block size 1024 << {}", self.log_block_size);
            return Err(FsError::Corrupted);
        }
        let inode_size = self.inode_size as u32;
        if inode_size < INODE_SIZE as u32 || inode_size > self.block_size() || !inode_size.is_power_of_two() {
            log::error!("unsupported inode size {}", inode_size);
            return Err(FsError::Corrupted);
        }
        if self.inodes_per_group == 0 || self.blocks_per_group == 0 || self.blocks_count <= GROUP_DESC_BLOCK {
            log::error!("bad group geometry");
            return Err(FsError::Corrupted);
        }
        if self.first_ino <= ROOT_INO || self.inodes_count <= ROOT_INO {
            log::error!("bad inode geometry");
            return Err(FsError::Corrupted);
        }
        Ok(())
    }

    /// Volume label up to the first NUL.
    pub fn volume_label(&self) -> &[u8] {
        let end = self
            .volume_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.volume_name.len());
        &self.volume_name[..end]
    }
}

/// Block group descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupDesc {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
}

impl GroupDesc {
    pub fn parse(raw: &[u8]) -> FsResult<Self> {
        if raw.len() < GROUP_DESC_SIZE {
            return Err(FsError::Corrupted);
        }
        Ok(Self {
            block_bitmap: u32!(raw, 0),
            inode_bitmap: u32!(raw, 4),
            inode_table: u32!(raw, 8),
            free_blocks_count: u16!(raw, 12),
            free_inodes_count: u16!(raw, 14),
            used_dirs_count: u16!(raw, 16),
        })
    }

    pub fn to_bytes(&self) -> [u8; GROUP_DESC_SIZE] {
        let mut raw = [0u8; GROUP_DESC_SIZE];
        put_le!(raw, 0, self.block_bitmap);
        put_le!(raw, 4, self.inode_bitmap);
        put_le!(raw, 8, self.inode_table);
        put_le!(raw, 12, self.free_blocks_count);
        put_le!(raw, 14, self.free_inodes_count);
        put_le!(raw, 16, self.used_dirs_count);
        raw
    }
}

/// On-disk inode. The 16-byte `key` sits where ext2 keeps its four
/// timestamps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskInode {
    pub mode: u16,
    pub uid: u16,
    /// File size in bytes
    pub size: u32,
    pub key: [u8; KEY_LEN],
    pub gid: u16,
    pub links_count: u16,
    /// Data blocks in use, in filesystem blocks. The indirect block itself
    /// is not counted.
    pub blocks: u32,
    pub flags: u32,
    pub osd1: u32,
    pub block: [u32; N_BLOCKS],
    pub generation: u32,
    pub file_acl: u32,
    pub dir_acl: u32,
    pub faddr: u32,
    pub osd2: [u8; 12],
}

impl DiskInode {
    pub fn new(mode: InodeMode) -> Self {
        Self {
            mode: mode.bits(),
            links_count: 1,
            ..Default::default()
        }
    }

    pub fn parse(raw: &[u8]) -> FsResult<Self> {
        if raw.len() < INODE_SIZE {
            return Err(FsError::Corrupted);
        }
        let mut inode = Self {
            mode: u16!(raw, 0),
            uid: u16!(raw, 2),
            size: u32!(raw, 4),
            gid: u16!(raw, 24),
            links_count: u16!(raw, 26),
            blocks: u32!(raw, 28),
            flags: u32!(raw, 32),
            osd1: u32!(raw, 36),
            generation: u32!(raw, 100),
            file_acl: u32!(raw, 104),
            dir_acl: u32!(raw, 108),
            faddr: u32!(raw, 112),
            ..Default::default()
        };
        inode.key.copy_from_slice(&raw[8..24]);
        for (i, slot) in inode.block.iter_mut().enumerate() {
            *slot = u32!(raw, 40 + i * 4);
        }
        inode.osd2.copy_from_slice(&raw[116..128]);
        Ok(inode)
    }

    pub fn to_bytes(&self) -> [u8; INODE_SIZE] {
        let mut raw = [0u8; INODE_SIZE];
        put_le!(raw, 0, self.mode);
        put_le!(raw, 2, self.uid);
        put_le!(raw, 4, self.size);
        raw[8..24].copy_from_slice(&self.key);
        put_le!(raw, 24, self.gid);
        put_le!(raw, 26, self.links_count);
        put_le!(raw, 28, self.blocks);
        put_le!(raw, 32, self.flags);
        put_le!(raw, 36, self.osd1);
        for (i, ptr) in self.block.iter().enumerate() {
            put_le!(raw, 40 + i * 4, *ptr);
        }
        put_le!(raw, 100, self.generation);
        put_le!(raw, 104, self.file_acl);
        put_le!(raw, 108, self.dir_acl);
        put_le!(raw, 112, self.faddr);
        raw[116..128].copy_from_slice(&self.osd2);
        raw
    }

    pub fn mode(&self) -> InodeMode {
        InodeMode::from_bits_truncate(self.mode)
    }

    pub fn is_dir(&self) -> bool {
        self.mode().is_dir()
    }
}

/// Fixed 8-byte head of a directory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntryHeader {
    pub inode: u32,
    pub rec_len: u16,
    pub name_len: u8,
    pub file_type: u8,
}

impl DirEntryHeader {
    pub fn new(inode: u32, rec_len: usize, name_len: usize, file_type: u8) -> Self {
        Self {
            inode,
            rec_len: rec_len as u16,
            name_len: name_len as u8,
            file_type,
        }
    }

    pub fn read_at(block: &[u8], off: usize) -> FsResult<Self> {
        if off + DIRENT_HEADER_LEN > block.len() {
            return Err(FsError::Corrupted);
        }
        Ok(Self {
            inode: u32!(block, off),
            rec_len: u16!(block, off + 4),
            name_len: block[off + 6],
            file_type: block[off + 7],
        })
    }

    pub fn write_at(&self, block: &mut [u8], off: usize) {
        put_le!(block, off, self.inode);
        put_le!(block, off + 4, self.rec_len);
        block[off + 6] = self.name_len;
        block[off + 7] = self.file_type;
    }

    /// The name following the header at `off`.
    pub fn name<'a>(&self, block: &'a [u8], off: usize) -> FsResult<&'a [u8]> {
        let start = off + DIRENT_HEADER_LEN;
        block
            .get(start..start + self.name_len as usize)
            .ok_or(FsError::Corrupted)
    }

    /// End-of-directory sentinel.
    pub fn is_sentinel(&self) -> bool {
        self.file_type == EXT2_FT_UNKNOWN
    }

    /// Space the record actually needs.
    pub fn used_len(&self) -> usize {
        rec_len_for(self.name_len as usize)
    }

    /// A record must hold its own name and stay inside the block.
    pub fn check(&self, off: usize, block_size: usize) -> FsResult<()> {
        let rec_len = self.rec_len as usize;
        if rec_len < self.used_len() || rec_len % 4 != 0 || off + rec_len > block_size {
            log::error!(
                "malformed directory record at {}: rec_len {} name_len {}",
                off,
                rec_len,
                self.name_len
            );
            return Err(FsError::Corrupted);
        }
        Ok(())
    }
}

/// Writes a whole record (header and name) at `off`.
pub fn write_dirent(block: &mut [u8], off: usize, inode: u32, rec_len: usize, name: &[u8], file_type: u8) {
    DirEntryHeader::new(inode, rec_len, name.len(), file_type).write_at(block, off);
    let start = off + DIRENT_HEADER_LEN;
    block[start..start + name.len()].copy_from_slice(name);
}
