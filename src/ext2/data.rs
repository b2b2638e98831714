//! File contents. Byte offsets below `12 * block_size` go through the direct
//! pointers, the rest through the single indirect block. A request that
//! straddles the boundary is split in two.

use alloc::{vec, vec::Vec};
use core::cmp::min;

use super::{
    layout::{DiskInode, DIRECT_BLOCKS, INDIRECT_SLOT},
    Ext2State,
};
use crate::error::{FsError, FsResult};

impl Ext2State {
    fn indirect_ptrs(&self, inode: &DiskInode) -> FsResult<Vec<u32>> {
        match inode.block[INDIRECT_SLOT] {
            0 => Ok(vec![0; self.block_size / 4]),
            blkno => self.read_indirect(blkno),
        }
    }

    /// Copies blocks `ptrs` starting at byte `offset` into `buf`. Null
    /// pointers read as zeros.
    fn read_span(&self, ptrs: &[u32], offset: usize, buf: &mut [u8]) -> FsResult<()> {
        let bs = self.block_size;
        let mut block = self.new_block_buf();
        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done;
            let within = pos % bs;
            let n = min(bs - within, buf.len() - done);
            match ptrs.get(pos / bs).copied() {
                None => return Err(FsError::Corrupted),
                Some(0) => buf[done..done + n].fill(0),
                Some(blkno) => {
                    self.read_block(blkno, &mut block)?;
                    buf[done..done + n].copy_from_slice(&block[within..within + n]);
                }
            }
            done += n;
        }
        Ok(())
    }

    fn write_span(&self, ptrs: &[u32], offset: usize, buf: &[u8]) -> FsResult<()> {
        let bs = self.block_size;
        let mut block = self.new_block_buf();
        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done;
            let within = pos % bs;
            let n = min(bs - within, buf.len() - done);
            let blkno = match ptrs.get(pos / bs).copied() {
                None | Some(0) => {
                    log::error!("write to unallocated file block {}", pos / bs);
                    return Err(FsError::Corrupted);
                }
                Some(blkno) => blkno,
            };
            if n == bs {
                self.write_block(blkno, &buf[done..done + n])?;
            } else {
                self.read_block(blkno, &mut block)?;
                block[within..within + n].copy_from_slice(&buf[done..done + n]);
                self.write_block(blkno, &block)?;
            }
            done += n;
        }
        Ok(())
    }

    /// Reads up to `buf.len()` bytes at `offset`, clipped to the file size.
    /// Returns the number of bytes read; 0 at or past the end.
    pub fn read_data(&self, inode: &DiskInode, offset: u32, buf: &mut [u8]) -> FsResult<usize> {
        let size = inode.size as usize;
        let offset = offset as usize;
        if offset >= size {
            return Ok(0);
        }
        let len = min(buf.len(), size - offset);
        let buf = &mut buf[..len];
        let direct_end = DIRECT_BLOCKS * self.block_size;
        if offset < direct_end {
            let n = min(len, direct_end - offset);
            self.read_span(&inode.block[..DIRECT_BLOCKS], offset, &mut buf[..n])?;
            if n < len {
                let ptrs = self.indirect_ptrs(inode)?;
                self.read_span(&ptrs, 0, &mut buf[n..])?;
            }
        } else {
            let ptrs = self.indirect_ptrs(inode)?;
            self.read_span(&ptrs, offset - direct_end, buf)?;
        }
        Ok(len)
    }

    /// Writes `buf` at `offset`. The blocks must already be allocated
    /// (see `alloc_inode`); the size is not touched here.
    pub fn write_data(&self, inode: &DiskInode, offset: u32, buf: &[u8]) -> FsResult<usize> {
        let offset = offset as usize;
        let end = offset + buf.len();
        if end > inode.blocks as usize * self.block_size {
            return Err(FsError::InvalidArgument);
        }
        let direct_end = DIRECT_BLOCKS * self.block_size;
        if offset < direct_end {
            let n = min(buf.len(), direct_end - offset);
            self.write_span(&inode.block[..DIRECT_BLOCKS], offset, &buf[..n])?;
            if n < buf.len() {
                let ptrs = self.indirect_ptrs(inode)?;
                self.write_span(&ptrs, 0, &buf[n..])?;
            }
        } else {
            let ptrs = self.indirect_ptrs(inode)?;
            self.write_span(&ptrs, offset - direct_end, buf)?;
        }
        Ok(buf.len())
    }
}
