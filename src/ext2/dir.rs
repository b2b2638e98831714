//! Directory records.
//!
//! A directory is up to 12 direct blocks of variable-length records. The
//! record lengths of one block always add up to the block size: inserting
//! splits the slack off an existing record, removing folds a record into a
//! neighbour. A record whose file type is 0 ends the directory.

use alloc::vec::Vec;
use core::cmp::min;

use log::{debug, warn};

use super::{
    layout::{
        rec_len_for, write_dirent, DirEntryHeader, DiskInode, DIRECT_BLOCKS, EXT2_FT_DIR, ROOT_INO,
    },
    Ext2State,
};
use crate::error::{FsError, FsResult};

fn is_dot(name: &[u8]) -> bool {
    name == b"." || name == b".."
}

impl Ext2State {
    /// Walks the records of `dir` in order until `visit` returns something
    /// or the end of the directory is reached.
    fn scan_dir<T>(
        &self,
        dir: &DiskInode,
        mut visit: impl FnMut(&DirEntryHeader, &[u8]) -> Option<T>,
    ) -> FsResult<Option<T>> {
        if !dir.is_dir() {
            return Err(FsError::NotADirectory);
        }
        let bs = self.block_size;
        let mut block = self.new_block_buf();
        for &blkno in &dir.block[..min(dir.blocks as usize, DIRECT_BLOCKS)] {
            self.read_block(blkno, &mut block)?;
            let mut off = 0;
            while off < bs {
                let hdr = DirEntryHeader::read_at(&block, off)?;
                if hdr.is_sentinel() {
                    return Ok(None);
                }
                hdr.check(off, bs)?;
                if let Some(found) = visit(&hdr, hdr.name(&block, off)?) {
                    return Ok(Some(found));
                }
                off += hdr.rec_len as usize;
            }
        }
        Ok(None)
    }

    /// Inode number of entry `name` in `dir`.
    pub fn read_dentry_by_name(&self, dir: &DiskInode, name: &[u8]) -> FsResult<Option<u32>> {
        self.scan_dir(dir, |hdr, n| (n == name).then(|| hdr.inode))
    }

    /// Inode number and name of the `index`-th entry of `dir`.
    pub fn read_dentry_by_index(&self, dir: &DiskInode, index: usize) -> FsResult<Option<(u32, Vec<u8>)>> {
        let mut seen = 0;
        self.scan_dir(dir, |hdr, n| {
            if seen == index {
                return Some((hdr.inode, n.to_vec()));
            }
            seen += 1;
            None
        })
    }

    /// Number of records in `dir`, `.` and `..` included.
    pub fn dir_entry_count(&self, dir: &DiskInode) -> FsResult<usize> {
        let mut count = 0;
        self.scan_dir(dir, |_, _| {
            count += 1;
            None::<()>
        })?;
        Ok(count)
    }

    /// True when `dir` holds nothing but `.` and `..`.
    pub fn dir_is_empty(&self, dir: &DiskInode) -> FsResult<bool> {
        Ok(self.scan_dir(dir, |_, n| (!is_dot(n)).then(|| ()))?.is_none())
    }

    /// Whether `that` is `this` or one of its ancestors, following `..` up
    /// to the root.
    pub fn is_ancestor(&self, that: u32, this: u32) -> FsResult<bool> {
        let mut cur = this;
        for _ in 0..=self.sb.inodes_count {
            if cur == that {
                return Ok(true);
            }
            if cur == ROOT_INO {
                return Ok(false);
            }
            let inode = self.read_inode(cur)?;
            cur = self
                .read_dentry_by_name(&inode, b"..")?
                .ok_or(FsError::Corrupted)?;
        }
        log::error!("`..` chain from inode {} never reaches the root", this);
        Err(FsError::Corrupted)
    }

    /// Writes the first block of a new directory: `.` with record length 12,
    /// `..` owning the rest of the block.
    pub fn init_dir_block(&self, blkno: u32, ino: u32, parent: u32) -> FsResult<()> {
        let mut block = self.new_block_buf();
        let dot_len = rec_len_for(1);
        write_dirent(&mut block, 0, ino, dot_len, b".", EXT2_FT_DIR);
        write_dirent(&mut block, dot_len, parent, self.block_size - dot_len, b"..", EXT2_FT_DIR);
        self.write_block(blkno, &block)
    }

    pub(crate) fn adjust_used_dirs(&self, delta: i32) -> FsResult<()> {
        let mut gd = self.read_group_desc()?;
        gd.used_dirs_count = (gd.used_dirs_count as i32 + delta).max(0) as u16;
        self.write_group_desc(&gd)
    }

    /// Adds record (`name`, `ino`) to directory `dir_ino`.
    ///
    /// Takes the first record with enough slack for both itself and the new
    /// record, or the end-of-directory sentinel. With no room left a new
    /// block is appended and `dir` is written back.
    pub fn insert_dentry(
        &mut self,
        dir_ino: u32,
        dir: &mut DiskInode,
        name: &[u8],
        ino: u32,
        file_type: u8,
    ) -> FsResult<()> {
        if !dir.is_dir() {
            return Err(FsError::NotADirectory);
        }
        let bs = self.block_size;
        let need = rec_len_for(name.len());
        let mut block = self.new_block_buf();
        for &blkno in &dir.block[..min(dir.blocks as usize, DIRECT_BLOCKS)] {
            self.read_block(blkno, &mut block)?;
            let mut off = 0;
            while off < bs {
                let hdr = DirEntryHeader::read_at(&block, off)?;
                if hdr.is_sentinel() {
                    if bs - off < need {
                        log::error!("directory {}: end marker without room at offset {}", dir_ino, off);
                        return Err(FsError::Corrupted);
                    }
                    warn!("directory {}: reusing end marker at block {} offset {}", dir_ino, blkno, off);
                    write_dirent(&mut block, off, ino, bs - off, name, file_type);
                    return self.write_block(blkno, &block);
                }
                hdr.check(off, bs)?;
                let used = hdr.used_len();
                let rec_len = hdr.rec_len as usize;
                if rec_len > used + need {
                    DirEntryHeader {
                        rec_len: used as u16,
                        ..hdr
                    }
                    .write_at(&mut block, off);
                    write_dirent(&mut block, off + used, ino, rec_len - used, name, file_type);
                    debug!("directory {}: split record at block {} offset {}", dir_ino, blkno, off);
                    return self.write_block(blkno, &block);
                }
                off += rec_len;
            }
        }

        let blkno = self.alloc_iblock(dir).map_err(|e| match e {
            FsError::FileTooLarge => FsError::NoSpace,
            e => e,
        })?;
        dir.size += bs as u32;
        let mut block = self.new_block_buf();
        write_dirent(&mut block, 0, ino, bs, name, file_type);
        self.write_block(blkno, &block)?;
        debug!("directory {}: appended block {}", dir_ino, blkno);
        self.write_inode(dir_ino, dir)
    }

    /// Removes record `name` from directory `dir_ino` and frees the inode
    /// it names along with its data.
    ///
    /// Directories must be empty. The freed space goes to the following
    /// record when the removed one opens its block, to the preceding one
    /// otherwise; a record that filled its whole block gives the block back.
    pub fn remove_dentry(&mut self, dir_ino: u32, dir: &mut DiskInode, name: &[u8]) -> FsResult<()> {
        if is_dot(name) {
            return Err(FsError::InvalidArgument);
        }
        if !dir.is_dir() {
            return Err(FsError::NotADirectory);
        }
        let bs = self.block_size;
        let mut block = self.new_block_buf();
        for index in 0..min(dir.blocks as usize, DIRECT_BLOCKS) {
            let blkno = dir.block[index];
            self.read_block(blkno, &mut block)?;
            let mut off = 0;
            let mut prev: Option<usize> = None;
            while off < bs {
                let hdr = DirEntryHeader::read_at(&block, off)?;
                if hdr.is_sentinel() {
                    return Err(FsError::NotFound);
                }
                hdr.check(off, bs)?;
                if hdr.name(&block, off)? != name {
                    prev = Some(off);
                    off += hdr.rec_len as usize;
                    continue;
                }

                let target_ino = hdr.inode;
                let target = self.read_inode(target_ino)?;
                if target.is_dir() {
                    if !self.dir_is_empty(&target)? {
                        return Err(FsError::DirectoryNotEmpty);
                    }
                    if self.is_ancestor(target_ino, dir_ino)? {
                        return Err(FsError::Busy);
                    }
                }

                let rec_len = hdr.rec_len as usize;
                let mut dir_dirty = false;
                match prev {
                    Some(prev_off) => {
                        let prev_hdr = DirEntryHeader::read_at(&block, prev_off)?;
                        DirEntryHeader {
                            rec_len: prev_hdr.rec_len + hdr.rec_len,
                            ..prev_hdr
                        }
                        .write_at(&mut block, prev_off);
                        self.write_block(blkno, &block)?;
                    }
                    None if rec_len == bs => {
                        self.release_block(blkno)?;
                        dir.block.copy_within(index + 1..DIRECT_BLOCKS, index);
                        dir.block[DIRECT_BLOCKS - 1] = 0;
                        dir.blocks -= 1;
                        dir.size = dir.size.saturating_sub(bs as u32);
                        dir_dirty = true;
                    }
                    None => {
                        let next = DirEntryHeader::read_at(&block, rec_len)?;
                        let next_name = rec_len + 8..rec_len + 8 + next.name_len as usize;
                        block.copy_within(next_name, 8);
                        DirEntryHeader {
                            rec_len: hdr.rec_len + next.rec_len,
                            ..next
                        }
                        .write_at(&mut block, 0);
                        self.write_block(blkno, &block)?;
                    }
                }

                if target.is_dir() {
                    dir.links_count = dir.links_count.saturating_sub(1);
                    dir_dirty = true;
                    self.adjust_used_dirs(-1)?;
                }
                if dir_dirty {
                    self.write_inode(dir_ino, dir)?;
                }
                self.release_file_blocks(&target)?;
                self.release_inode(target_ino)?;
                debug!("directory {}: removed inode {}", dir_ino, target_ino);
                return Ok(());
            }
        }
        Err(FsError::NotFound)
    }
}
