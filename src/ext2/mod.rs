//! EXT2-like on-disk filesystem driver.
//!
//! One block group, located unconditionally: superblock at byte 1024, group
//! descriptor at block 2. Files address 12 direct blocks plus one single
//! indirect block. Every inode carries a 16-byte key in place of the ext2
//! timestamps.
//!
//! All driver state sits in [`Ext2State`] behind one lock in [`Ext2Fs`].
//! Public entry points take the lock for their whole duration; the helpers in
//! the submodules take `&mut Ext2State` and never lock.

mod balloc;
mod data;
mod dir;
pub mod layout;
mod mkfs;
mod ops;

use alloc::{
    sync::{Arc, Weak},
    vec,
    vec::Vec,
};

use log::{debug, info};
use spin::Mutex;

use self::balloc::BitmapKind;
pub use mkfs::{mkfs, MkfsOptions};
pub use ops::{Ext2DirOps, Ext2FileOps, Ext2InodeOps};

use self::layout::{
    DiskInode, Ext2SuperBlock, GroupDesc, GROUP_DESC_BLOCK, GROUP_DESC_SIZE, INODE_SIZE, ROOT_INO,
    SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE,
};
use crate::{
    device::BlockDevice,
    error::{FsError, FsResult, VfsResult},
    vfs::{FileOps, FsStat, Inode, InodeOps, SuperBlock, SuperOps, Vfs, FNAME_LEN},
};

/// Where the volume starts on the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MountOptions {
    /// First sector of the partition.
    pub base_lba: u64,
}

/// Device handle and superblock mirror. Only reachable through the lock in
/// [`Ext2Fs`].
pub struct Ext2State {
    dev: Arc<dyn BlockDevice>,
    base_lba: u64,
    block_size: usize,
    sb: Ext2SuperBlock,
}

impl Ext2State {
    fn new(dev: Arc<dyn BlockDevice>, base_lba: u64, sb: Ext2SuperBlock) -> FsResult<Self> {
        sb.validate()?;
        let block_size = sb.block_size() as usize;
        let sector = dev.sector_size();
        if sector == 0 || block_size % sector != 0 || SUPERBLOCK_OFFSET % sector != 0 {
            log::error!("block size {} does not fit sector size {}", block_size, sector);
            return Err(FsError::InvalidArgument);
        }
        Ok(Self {
            dev,
            base_lba,
            block_size,
            sb,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn superblock(&self) -> &Ext2SuperBlock {
        &self.sb
    }

    /// First sector of block `blkno`.
    pub fn block_lba(&self, blkno: u32) -> u64 {
        let sectors_per_block = (self.block_size / self.dev.sector_size()) as u64;
        self.base_lba + blkno as u64 * sectors_per_block
    }

    fn check_block(&self, blkno: u32, len: usize) -> FsResult<()> {
        if blkno >= self.sb.blocks_count {
            log::error!("block {} past end of volume ({})", blkno, self.sb.blocks_count);
            return Err(FsError::Corrupted);
        }
        if len != self.block_size {
            return Err(FsError::InvalidArgument);
        }
        Ok(())
    }

    /// A zeroed block-sized buffer.
    pub fn new_block_buf(&self) -> Vec<u8> {
        vec![0u8; self.block_size]
    }

    pub fn read_block(&self, blkno: u32, buf: &mut [u8]) -> FsResult<()> {
        self.check_block(blkno, buf.len())?;
        self.dev.read(self.block_lba(blkno), buf)?;
        Ok(())
    }

    pub fn write_block(&self, blkno: u32, buf: &[u8]) -> FsResult<()> {
        self.check_block(blkno, buf.len())?;
        self.dev.write(self.block_lba(blkno), buf)?;
        Ok(())
    }

    /// Reads `buf.len()` bytes at `offset` inside block `blkno`.
    pub fn read_block_bytes(&self, blkno: u32, offset: usize, buf: &mut [u8]) -> FsResult<()> {
        if offset + buf.len() > self.block_size {
            return Err(FsError::InvalidArgument);
        }
        let mut block = self.new_block_buf();
        self.read_block(blkno, &mut block)?;
        buf.copy_from_slice(&block[offset..offset + buf.len()]);
        Ok(())
    }

    /// Read-modify-write of `buf.len()` bytes at `offset` inside block `blkno`.
    pub fn write_block_bytes(&self, blkno: u32, offset: usize, buf: &[u8]) -> FsResult<()> {
        if offset + buf.len() > self.block_size {
            return Err(FsError::InvalidArgument);
        }
        let mut block = self.new_block_buf();
        self.read_block(blkno, &mut block)?;
        block[offset..offset + buf.len()].copy_from_slice(buf);
        self.write_block(blkno, &block)
    }

    pub fn read_group_desc(&self) -> FsResult<GroupDesc> {
        let mut raw = [0u8; GROUP_DESC_SIZE];
        self.read_block_bytes(GROUP_DESC_BLOCK, 0, &mut raw)?;
        GroupDesc::parse(&raw)
    }

    pub fn write_group_desc(&self, gd: &GroupDesc) -> FsResult<()> {
        self.write_block_bytes(GROUP_DESC_BLOCK, 0, &gd.to_bytes())
    }

    /// Writes the superblock mirror back to byte offset 1024.
    pub fn write_superblock(&self) -> FsResult<()> {
        let raw = self.sb.to_bytes();
        let blkno = (SUPERBLOCK_OFFSET / self.block_size) as u32;
        let offset = SUPERBLOCK_OFFSET % self.block_size;
        self.write_block_bytes(blkno, offset, &raw[..SUPERBLOCK_SIZE])
    }

    /// Block and byte offset of inode `ino` inside the inode table.
    fn inode_location(&self, ino: u32) -> FsResult<(u32, usize)> {
        if ino == 0 || ino > self.sb.inodes_count {
            return Err(FsError::NotFound);
        }
        let group = (ino - 1) / self.sb.inodes_per_group;
        if group != 0 {
            log::warn!("inode {} lives in group {}, only group 0 is read", ino, group);
            return Err(FsError::NotFound);
        }
        let index = ((ino - 1) % self.sb.inodes_per_group) as usize;
        let gd = self.read_group_desc()?;
        let byte = index * self.sb.inode_size as usize;
        let blkno = gd.inode_table + (byte / self.block_size) as u32;
        Ok((blkno, byte % self.block_size))
    }

    pub fn read_inode(&self, ino: u32) -> FsResult<DiskInode> {
        if !self.ino_exist(ino)? {
            return Err(FsError::NotFound);
        }
        let (blkno, offset) = self.inode_location(ino)?;
        let mut raw = [0u8; INODE_SIZE];
        self.read_block_bytes(blkno, offset, &mut raw)?;
        DiskInode::parse(&raw)
    }

    pub fn write_inode(&self, ino: u32, inode: &DiskInode) -> FsResult<()> {
        if !self.ino_exist(ino)? {
            return Err(FsError::NotFound);
        }
        let (blkno, offset) = self.inode_location(ino)?;
        self.write_block_bytes(blkno, offset, &inode.to_bytes())
    }

    fn statfs(&self) -> FsResult<FsStat> {
        let inodes = self.load_bitmap(BitmapKind::Inode)?;
        let blocks = self.load_bitmap(BitmapKind::Block)?;
        Ok(FsStat {
            block_size: self.block_size as u32,
            blocks_count: self.sb.blocks_count,
            free_blocks: blocks.free(),
            inodes_count: self.sb.inodes_count,
            free_inodes: inodes.free(),
            name_max: (FNAME_LEN - 1) as u32,
        })
    }
}

/// A mounted volume.
///
/// Built with [`Arc::new_cyclic`]: the op tables handed out with every inode
/// snapshot point back here through `Weak`, so dropping the last `Arc`
/// unmounts.
pub struct Ext2Fs {
    state: Mutex<Ext2State>,
    iops: Arc<dyn InodeOps>,
    file_ops: Arc<dyn FileOps>,
    dir_ops: Arc<dyn FileOps>,
}

impl core::fmt::Debug for Ext2Fs {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ext2Fs").finish_non_exhaustive()
    }
}

impl Ext2Fs {
    pub fn mount(dev: Arc<dyn BlockDevice>, opts: MountOptions) -> FsResult<Arc<Self>> {
        let sector = dev.sector_size();
        if sector == 0 || SUPERBLOCK_OFFSET % sector != 0 {
            return Err(FsError::InvalidArgument);
        }
        let mut raw = vec![0u8; SUPERBLOCK_SIZE];
        dev.read(opts.base_lba + (SUPERBLOCK_OFFSET / sector) as u64, &mut raw)?;
        let sb = Ext2SuperBlock::parse(&raw)?;
        let state = Ext2State::new(dev, opts.base_lba, sb)?;
        info!(
            "mount ext2: {} blocks of {} bytes, {} inodes, base lba {:#x}",
            state.sb.blocks_count, state.block_size, state.sb.inodes_count, opts.base_lba
        );
        let fs = Arc::new_cyclic(|me: &Weak<Ext2Fs>| Ext2Fs {
            state: Mutex::new(state),
            iops: Arc::new(Ext2InodeOps::new(me.clone())),
            file_ops: Arc::new(Ext2FileOps::new(me.clone())),
            dir_ops: Arc::new(Ext2DirOps::new(me.clone())),
        });
        // the root must be readable before anyone walks a path
        fs.state.lock().read_inode(ROOT_INO)?;
        Ok(fs)
    }

    /// VFS superblock for this volume.
    pub fn superblock(self: &Arc<Self>) -> VfsResult<SuperBlock> {
        SuperBlock::new(self.clone())
    }

    /// Fresh VFS context with the root as current directory.
    pub fn vfs(self: &Arc<Self>) -> VfsResult<Vfs> {
        Ok(Vfs::new(self.superblock()?))
    }

    pub(crate) fn lock(&self) -> spin::MutexGuard<'_, Ext2State> {
        self.state.lock()
    }

    /// VFS snapshot of an on-disk inode. Directories get the directory file
    /// table, everything else the regular one.
    pub(crate) fn snapshot(&self, ino: u32, inode: &DiskInode) -> Inode {
        let fops = if inode.is_dir() {
            self.dir_ops.clone()
        } else {
            self.file_ops.clone()
        };
        Inode {
            blocks: inode.blocks,
            size: inode.size,
            ino,
            mode: inode.mode(),
            ops: self.iops.clone(),
            fops,
        }
    }
}

impl SuperOps for Ext2Fs {
    fn block_size(&self) -> u32 {
        self.lock().block_size as u32
    }

    fn root_inode(&self) -> VfsResult<Inode> {
        self.read_inode(ROOT_INO)
    }

    fn read_inode(&self, ino: u32) -> VfsResult<Inode> {
        let inode = self.lock().read_inode(ino)?;
        Ok(self.snapshot(ino, &inode))
    }

    fn statfs(&self) -> VfsResult<FsStat> {
        self.lock().statfs()
    }

    /// Nothing is cached, so only the superblock free counters need writing.
    fn sync(&self) -> VfsResult<()> {
        let mut state = self.lock();
        let gd = state.read_group_desc()?;
        state.sb.free_blocks_count = gd.free_blocks_count as u32;
        state.sb.free_inodes_count = gd.free_inodes_count as u32;
        state.write_superblock()?;
        debug!(
            "sync: {} free blocks, {} free inodes",
            gd.free_blocks_count, gd.free_inodes_count
        );
        Ok(())
    }
}
