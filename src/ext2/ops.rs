//! VFS operation tables for ext2 volumes.
//!
//! Each table holds a `Weak` handle to its [`Ext2Fs`]; once the volume is
//! dropped every call fails with [`FsError::NotInitialized`]. Every method
//! takes the volume lock once and keeps it until it returns.

use alloc::{
    string::String,
    sync::{Arc, Weak},
};

use log::{debug, warn};

use super::{
    layout::{imode_to_ft, DiskInode},
    Ext2Fs, Ext2State,
};
use crate::{
    error::{FsError, FsResult, VfsResult},
    vfs::{Dentry, File, FileOps, Inode, InodeMode, InodeOps, Whence, FNAME_LEN, KEY_LEN},
};

fn upgrade(fs: &Weak<Ext2Fs>) -> VfsResult<Arc<Ext2Fs>> {
    fs.upgrade().ok_or(FsError::NotInitialized)
}

fn check_name(name: &str) -> FsResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(FsError::InvalidName);
    }
    if name.len() > FNAME_LEN - 1 {
        return Err(FsError::NameTooLong);
    }
    Ok(())
}

impl Ext2Fs {
    fn lookup(&self, dir: &Inode, name: &str) -> FsResult<Option<Dentry>> {
        let st = self.lock();
        let dinode = st.read_inode(dir.ino)?;
        match st.read_dentry_by_name(&dinode, name.as_bytes())? {
            Some(ino) => {
                let inode = st.read_inode(ino)?;
                Ok(Some(Dentry::new(name, self.snapshot(ino, &inode))))
            }
            None => Ok(None),
        }
    }

    /// The `index`-th entry of `dir`, with a fresh snapshot of the inode it
    /// names.
    pub fn read_dentry_by_index(&self, dir: &Inode, index: usize) -> FsResult<Option<Dentry>> {
        let st = self.lock();
        let dinode = st.read_inode(dir.ino)?;
        self.dentry_at(&st, &dinode, index)
    }

    fn dentry_at(&self, st: &Ext2State, dir: &DiskInode, index: usize) -> FsResult<Option<Dentry>> {
        match st.read_dentry_by_index(dir, index)? {
            Some((ino, name)) => {
                let inode = st.read_inode(ino)?;
                let name = String::from_utf8_lossy(&name);
                Ok(Some(Dentry::new(&name, self.snapshot(ino, &inode))))
            }
            None => Ok(None),
        }
    }

    /// Claims an inode, links it into `dir_ino` and writes it out empty.
    /// Returns the new inode number and its on-disk image.
    fn create_locked(
        st: &mut Ext2State,
        dir_ino: u32,
        name: &str,
        mode: InodeMode,
    ) -> FsResult<(u32, DiskInode)> {
        check_name(name)?;
        let mut dir = st.read_inode(dir_ino)?;
        if !dir.is_dir() {
            return Err(FsError::NotADirectory);
        }
        if st.read_dentry_by_name(&dir, name.as_bytes())?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        let ino = st.next_free_inode()?;
        if let Err(e) = st.insert_dentry(dir_ino, &mut dir, name.as_bytes(), ino, imode_to_ft(mode)) {
            warn!("insert of {} into directory {} failed: {}", name, dir_ino, e);
            st.release_inode(ino)?;
            return Err(e);
        }
        let mut inode = DiskInode::new(mode);
        st.alloc_inode(ino, &mut inode, 0)?;
        debug!("created {} as inode {} in directory {}", name, ino, dir_ino);
        Ok((ino, inode))
    }

    fn create(&self, dir: &Inode, name: &str, mode: InodeMode) -> FsResult<Dentry> {
        let mut st = self.lock();
        let (ino, inode) = Self::create_locked(&mut st, dir.ino, name, mode)?;
        Ok(Dentry::new(name, self.snapshot(ino, &inode)))
    }

    fn mkdir(&self, dir: &Inode, name: &str) -> FsResult<Dentry> {
        let mut st = self.lock();
        let (ino, mut inode) = Self::create_locked(&mut st, dir.ino, name, InodeMode::NEW_DIR)?;
        let blkno = st.alloc_iblock(&mut inode)?;
        inode.size = st.block_size() as u32;
        inode.links_count = 2;
        st.write_inode(ino, &inode)?;
        st.init_dir_block(blkno, ino, dir.ino)?;

        let mut parent = st.read_inode(dir.ino)?;
        parent.links_count = parent.links_count.saturating_add(1);
        st.write_inode(dir.ino, &parent)?;
        st.adjust_used_dirs(1)?;
        Ok(Dentry::new(name, self.snapshot(ino, &inode)))
    }

    fn remove(&self, dir: &Inode, name: &str) -> FsResult<()> {
        let mut st = self.lock();
        let mut dinode = st.read_inode(dir.ino)?;
        st.remove_dentry(dir.ino, &mut dinode, name.as_bytes())
    }

    /// Re-reads the inode behind `file` and refreshes its snapshot.
    fn reload(&self, st: &Ext2State, file: &mut File) -> FsResult<DiskInode> {
        let ino = file.inode().ino;
        let inode = st.read_inode(ino)?;
        file.refresh(self.snapshot(ino, &inode));
        Ok(inode)
    }

    fn open(&self, file: &mut File) -> FsResult<()> {
        let st = self.lock();
        self.reload(&st, file)?;
        file.set_pos(0);
        Ok(())
    }

    fn read(&self, file: &mut File, buf: &mut [u8]) -> FsResult<usize> {
        let st = self.lock();
        let inode = self.reload(&st, file)?;
        let n = st.read_data(&inode, file.pos(), buf)?;
        file.set_pos(file.pos() + n as u32);
        Ok(n)
    }

    fn write(&self, file: &mut File, buf: &[u8]) -> FsResult<usize> {
        let mut st = self.lock();
        let ino = file.inode().ino;
        let mut inode = st.read_inode(ino)?;
        let pos = file.pos();
        let end = u32::try_from(buf.len())
            .ok()
            .and_then(|len| pos.checked_add(len))
            .ok_or(FsError::FileTooLarge)?;
        let size = inode.size.max(end);
        st.alloc_inode(ino, &mut inode, size)?;
        let n = st.write_data(&inode, pos, buf)?;
        file.set_pos(end);
        file.refresh(self.snapshot(ino, &inode));
        Ok(n)
    }

    fn seek(&self, file: &mut File, offset: i64, whence: Whence) -> FsResult<u32> {
        let st = self.lock();
        let inode = self.reload(&st, file)?;
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => file.pos() as i64,
            Whence::End => inode.size as i64,
        };
        let pos = base.checked_add(offset).ok_or(FsError::InvalidArgument)?;
        if pos < 0 || pos > inode.size as i64 {
            return Err(FsError::InvalidArgument);
        }
        file.set_pos(pos as u32);
        Ok(pos as u32)
    }

    fn getkey(&self, file: &File) -> FsResult<[u8; KEY_LEN]> {
        let st = self.lock();
        Ok(st.read_inode(file.inode().ino)?.key)
    }

    fn setkey(&self, file: &File, key: &[u8; KEY_LEN]) -> FsResult<()> {
        let st = self.lock();
        let ino = file.inode().ino;
        let mut inode = st.read_inode(ino)?;
        inode.key = *key;
        st.write_inode(ino, &inode)
    }

    /// Directory read: the name of entry `pos`, then `pos` moves on.
    fn read_entry(&self, file: &mut File, buf: &mut [u8]) -> FsResult<usize> {
        let st = self.lock();
        let inode = self.reload(&st, file)?;
        match self.dentry_at(&st, &inode, file.pos() as usize)? {
            Some(dentry) => {
                let name = dentry.name().as_bytes();
                let n = name.len().min(buf.len());
                buf[..n].copy_from_slice(&name[..n]);
                file.set_pos(file.pos() + 1);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    /// Directory positions count entries and stop at the entry count.
    fn seek_dir(&self, file: &mut File, offset: i64, whence: Whence) -> FsResult<u32> {
        let st = self.lock();
        let inode = self.reload(&st, file)?;
        let count = st.dir_entry_count(&inode)? as i64;
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => file.pos() as i64,
            Whence::End => count,
        };
        let pos = base.checked_add(offset).ok_or(FsError::InvalidArgument)?;
        if pos < 0 || pos > count {
            return Err(FsError::InvalidArgument);
        }
        file.set_pos(pos as u32);
        Ok(pos as u32)
    }
}

/// Inode operations of an ext2 volume.
pub struct Ext2InodeOps {
    fs: Weak<Ext2Fs>,
}

impl Ext2InodeOps {
    pub(crate) fn new(fs: Weak<Ext2Fs>) -> Self {
        Self { fs }
    }
}

impl InodeOps for Ext2InodeOps {
    fn lookup(&self, dir: &Inode, name: &str) -> VfsResult<Option<Dentry>> {
        upgrade(&self.fs)?.lookup(dir, name)
    }

    fn create(&self, dir: &Inode, name: &str, mode: InodeMode) -> VfsResult<Dentry> {
        upgrade(&self.fs)?.create(dir, name, mode)
    }

    fn remove(&self, dir: &Inode, name: &str) -> VfsResult<()> {
        upgrade(&self.fs)?.remove(dir, name)
    }

    fn mkdir(&self, dir: &Inode, name: &str) -> VfsResult<Dentry> {
        upgrade(&self.fs)?.mkdir(dir, name)
    }
}

/// File operations for regular files.
pub struct Ext2FileOps {
    fs: Weak<Ext2Fs>,
}

impl Ext2FileOps {
    pub(crate) fn new(fs: Weak<Ext2Fs>) -> Self {
        Self { fs }
    }
}

impl FileOps for Ext2FileOps {
    fn open(&self, file: &mut File) -> VfsResult<()> {
        upgrade(&self.fs)?.open(file)
    }

    fn read(&self, file: &mut File, buf: &mut [u8]) -> VfsResult<usize> {
        upgrade(&self.fs)?.read(file, buf)
    }

    fn write(&self, file: &mut File, buf: &[u8]) -> VfsResult<usize> {
        upgrade(&self.fs)?.write(file, buf)
    }

    fn close(&self, _file: &mut File) -> VfsResult<()> {
        Ok(())
    }

    fn seek(&self, file: &mut File, offset: i64, whence: Whence) -> VfsResult<u32> {
        upgrade(&self.fs)?.seek(file, offset, whence)
    }

    fn getkey(&self, file: &File) -> VfsResult<[u8; KEY_LEN]> {
        upgrade(&self.fs)?.getkey(file)
    }

    fn setkey(&self, file: &File, key: &[u8; KEY_LEN]) -> VfsResult<()> {
        upgrade(&self.fs)?.setkey(file, key)
    }
}

/// File operations for directories. Reads walk entry names; writes are
/// refused.
pub struct Ext2DirOps {
    fs: Weak<Ext2Fs>,
}

impl Ext2DirOps {
    pub(crate) fn new(fs: Weak<Ext2Fs>) -> Self {
        Self { fs }
    }
}

impl FileOps for Ext2DirOps {
    fn open(&self, file: &mut File) -> VfsResult<()> {
        upgrade(&self.fs)?.open(file)
    }

    fn read(&self, file: &mut File, buf: &mut [u8]) -> VfsResult<usize> {
        upgrade(&self.fs)?.read_entry(file, buf)
    }

    fn write(&self, _file: &mut File, _buf: &[u8]) -> VfsResult<usize> {
        Err(FsError::IsADirectory)
    }

    fn close(&self, _file: &mut File) -> VfsResult<()> {
        Ok(())
    }

    fn seek(&self, file: &mut File, offset: i64, whence: Whence) -> VfsResult<u32> {
        upgrade(&self.fs)?.seek_dir(file, offset, whence)
    }

    fn getkey(&self, file: &File) -> VfsResult<[u8; KEY_LEN]> {
        upgrade(&self.fs)?.getkey(file)
    }

    fn setkey(&self, file: &File, key: &[u8; KEY_LEN]) -> VfsResult<()> {
        upgrade(&self.fs)?.setkey(file, key)
    }
}
