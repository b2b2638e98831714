//! Inode and block allocation on top of the region allocator.
//!
//! Inode bit `i` stands for inode `i + 1`. Block bit `i` stands for block
//! `i + s_first_data_block`, which is `i + 1` on 1 KiB volumes. Every
//! allocation is a single bit (order 0); the bitmap block is written back
//! before the call returns and the group descriptor free counters follow.

use alloc::vec::Vec;
use core::cmp::min;

use log::{debug, warn};

use super::{
    layout::{DiskInode, GroupDesc, DIRECT_BLOCKS, INDIRECT_SLOT, N_BLOCKS},
    Ext2State,
};
use crate::{
    bitmap,
    error::{FsError, FsResult, RegionError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BitmapKind {
    Inode,
    Block,
}

/// A bitmap block loaded into words, with the descriptor it came from.
pub(crate) struct BitmapBlock {
    kind: BitmapKind,
    gd: GroupDesc,
    pub words: Vec<u32>,
    /// Bits that map to real inodes or blocks.
    pub bits: u32,
}

impl BitmapBlock {
    fn blkno(&self) -> u32 {
        match self.kind {
            BitmapKind::Inode => self.gd.inode_bitmap,
            BitmapKind::Block => self.gd.block_bitmap,
        }
    }

    /// Clear bits among the usable ones.
    pub fn free(&self) -> u32 {
        self.bits - bitmap::bitmap_weight(&self.words, self.bits)
    }
}

/// Blocks needed to hold `size` bytes.
pub(crate) fn blocks_for(size: u32, block_size: usize) -> usize {
    (size as usize + block_size - 1) / block_size
}

impl Ext2State {
    fn bitmap_bits(&self, kind: BitmapKind) -> u32 {
        let per_block = (self.block_size * 8) as u32;
        let per_group = match kind {
            BitmapKind::Inode => min(self.sb.inodes_per_group, self.sb.inodes_count),
            BitmapKind::Block => min(
                self.sb.blocks_per_group,
                self.sb.blocks_count.saturating_sub(self.sb.first_data_block),
            ),
        };
        min(per_block, per_group)
    }

    pub(crate) fn load_bitmap(&self, kind: BitmapKind) -> FsResult<BitmapBlock> {
        let gd = self.read_group_desc()?;
        let mut bm = BitmapBlock {
            kind,
            gd,
            words: Vec::new(),
            bits: self.bitmap_bits(kind),
        };
        let mut block = self.new_block_buf();
        self.read_block(bm.blkno(), &mut block)?;
        bm.words = bitmap::words_from_bytes(&block);
        Ok(bm)
    }

    /// Writes the bitmap back and moves the free counter by `delta`.
    fn store_bitmap(&self, bm: &mut BitmapBlock, delta: i32) -> FsResult<()> {
        let mut block = self.new_block_buf();
        bitmap::bytes_from_words(&bm.words, &mut block);
        self.write_block(bm.blkno(), &block)?;
        let counter = match bm.kind {
            BitmapKind::Inode => &mut bm.gd.free_inodes_count,
            BitmapKind::Block => &mut bm.gd.free_blocks_count,
        };
        *counter = (*counter as i32 + delta).clamp(0, u16::MAX as i32) as u16;
        self.write_group_desc(&bm.gd)
    }

    fn inode_bit(&self, ino: u32) -> FsResult<u32> {
        if ino == 0 || ino > self.sb.inodes_count {
            return Err(FsError::NotFound);
        }
        Ok(ino - 1)
    }

    /// Claims the first free inode number.
    pub fn next_free_inode(&mut self) -> FsResult<u32> {
        let mut bm = self.load_bitmap(BitmapKind::Inode)?;
        let bit = bitmap::find_free_region(&mut bm.words, bm.bits, 0)?;
        self.store_bitmap(&mut bm, -1)?;
        debug!("allocated inode {}", bit + 1);
        Ok(bit + 1)
    }

    /// Claims the first free block and zeroes it.
    pub fn next_free_block(&mut self) -> FsResult<u32> {
        let mut bm = self.load_bitmap(BitmapKind::Block)?;
        let bit = bitmap::find_free_region(&mut bm.words, bm.bits, 0)?;
        self.store_bitmap(&mut bm, -1)?;
        let blkno = bit + self.sb.first_data_block;
        let zero = self.new_block_buf();
        self.write_block(blkno, &zero)?;
        debug!("allocated block {}", blkno);
        Ok(blkno)
    }

    pub fn ino_exist(&self, ino: u32) -> FsResult<bool> {
        let bit = self.inode_bit(ino)?;
        let bm = self.load_bitmap(BitmapKind::Inode)?;
        Ok(bit < bm.bits && bitmap::test_bit(&bm.words, bit))
    }

    /// Claims inode `ino`. Returns false if it was already in use.
    pub fn ino_try_set(&mut self, ino: u32) -> FsResult<bool> {
        let bit = self.inode_bit(ino)?;
        let mut bm = self.load_bitmap(BitmapKind::Inode)?;
        if bit >= bm.bits {
            return Err(FsError::NotFound);
        }
        match bitmap::allocate_region(&mut bm.words, bit, 0) {
            Ok(()) => {
                self.store_bitmap(&mut bm, -1)?;
                Ok(true)
            }
            Err(RegionError::Busy) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn release_bit(&mut self, kind: BitmapKind, bit: u32) -> FsResult<()> {
        let mut bm = self.load_bitmap(kind)?;
        if bit >= bm.bits {
            log::error!("{:?} bit {} out of range", kind, bit);
            return Err(FsError::Corrupted);
        }
        if !bitmap::test_bit(&bm.words, bit) {
            warn!("{:?} bit {} released twice", kind, bit);
            return Ok(());
        }
        bitmap::release_region(&mut bm.words, bit, 0);
        self.store_bitmap(&mut bm, 1)
    }

    pub fn release_inode(&mut self, ino: u32) -> FsResult<()> {
        let bit = self.inode_bit(ino)?;
        debug!("release inode {}", ino);
        self.release_bit(BitmapKind::Inode, bit)
    }

    pub fn release_block(&mut self, blkno: u32) -> FsResult<()> {
        if blkno < self.sb.first_data_block || blkno >= self.sb.blocks_count {
            log::error!("release of block {} outside the data area", blkno);
            return Err(FsError::Corrupted);
        }
        debug!("release block {}", blkno);
        self.release_bit(BitmapKind::Block, blkno - self.sb.first_data_block)
    }

    fn ptrs_per_block(&self) -> usize {
        self.block_size / 4
    }

    /// Largest block count a file can address.
    pub fn max_file_blocks(&self) -> usize {
        DIRECT_BLOCKS + self.ptrs_per_block()
    }

    /// Pointers held by the indirect block `blkno`.
    pub(crate) fn read_indirect(&self, blkno: u32) -> FsResult<Vec<u32>> {
        let mut block = self.new_block_buf();
        self.read_block(blkno, &mut block)?;
        Ok((0..self.ptrs_per_block())
            .map(|i| crate::u32!(block, i * 4))
            .collect())
    }

    /// Points data block `index` of `inode` at `blkno`, creating the
    /// indirect block on first use.
    fn set_block_ptr(&mut self, inode: &mut DiskInode, index: usize, blkno: u32) -> FsResult<()> {
        if index < DIRECT_BLOCKS {
            inode.block[index] = blkno;
            return Ok(());
        }
        let slot = index - DIRECT_BLOCKS;
        if slot >= self.ptrs_per_block() {
            return Err(FsError::FileTooLarge);
        }
        if inode.block[INDIRECT_SLOT] == 0 {
            inode.block[INDIRECT_SLOT] = self.next_free_block()?;
            debug!("indirect block {}", inode.block[INDIRECT_SLOT]);
        }
        self.write_block_bytes(inode.block[INDIRECT_SLOT], slot * 4, &blkno.to_le_bytes())
    }

    fn grow(&mut self, inode: &mut DiskInode, needed: usize) -> FsResult<()> {
        while (inode.blocks as usize) < needed {
            let blkno = self.next_free_block()?;
            if let Err(e) = self.set_block_ptr(inode, inode.blocks as usize, blkno) {
                self.release_block(blkno)?;
                return Err(e);
            }
            inode.blocks += 1;
        }
        Ok(())
    }

    /// Grows `inode` to hold `target_size` bytes, sets its size and writes it.
    ///
    /// Claims `ino` first if it is still free, starting from an empty block
    /// list. Blocks already held are kept. If the volume fills up part way
    /// the blocks obtained so far stay attached and the size is unchanged.
    pub fn alloc_inode(&mut self, ino: u32, inode: &mut DiskInode, target_size: u32) -> FsResult<()> {
        let needed = blocks_for(target_size, self.block_size);
        if needed > self.max_file_blocks() {
            return Err(FsError::FileTooLarge);
        }
        if self.ino_try_set(ino)? {
            inode.blocks = 0;
            inode.block = [0; N_BLOCKS];
        }
        if let Err(e) = self.grow(inode, needed) {
            self.write_inode(ino, inode)?;
            return Err(e);
        }
        inode.size = target_size;
        self.write_inode(ino, inode)
    }

    /// Appends one direct block to `inode` and returns its number. The
    /// caller persists the inode.
    pub fn alloc_iblock(&mut self, inode: &mut DiskInode) -> FsResult<u32> {
        let index = inode.blocks as usize;
        if index >= DIRECT_BLOCKS {
            return Err(FsError::FileTooLarge);
        }
        let blkno = self.next_free_block()?;
        inode.block[index] = blkno;
        inode.blocks += 1;
        Ok(blkno)
    }

    /// Releases every data block of `inode` and its indirect block.
    pub(crate) fn release_file_blocks(&mut self, inode: &DiskInode) -> FsResult<()> {
        let count = inode.blocks as usize;
        for &blkno in inode.block[..min(count, DIRECT_BLOCKS)].iter() {
            if blkno != 0 {
                self.release_block(blkno)?;
            }
        }
        let indirect = inode.block[INDIRECT_SLOT];
        if indirect != 0 {
            let ptrs = self.read_indirect(indirect)?;
            let used = count.saturating_sub(DIRECT_BLOCKS);
            for &blkno in ptrs.iter().take(used) {
                if blkno != 0 {
                    self.release_block(blkno)?;
                }
            }
            self.release_block(indirect)?;
        }
        Ok(())
    }
}
