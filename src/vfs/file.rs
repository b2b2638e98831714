use alloc::{string::String, sync::Arc};

use super::{Dentry, FileOps, Inode, KEY_LEN};
use crate::error::VfsResult;

/// Origin of a seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

impl Whence {
    /// Decodes the syscall encoding: 1 = set, 2 = current, 3 = end.
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            1 => Some(Whence::Set),
            2 => Some(Whence::Cur),
            3 => Some(Whence::End),
            _ => None,
        }
    }
}

/// An open file: an inode snapshot, a byte cursor and the operation table
/// chosen at open time.
///
/// For directories the cursor counts entries instead of bytes.
pub struct File {
    name: String,
    inode: Inode,
    pos: u32,
    fops: Arc<dyn FileOps>,
}

impl core::fmt::Debug for File {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("File")
            .field("name", &self.name)
            .field("inode", &self.inode)
            .field("pos", &self.pos)
            .finish()
    }
}

impl File {
    /// Wraps a resolved dentry. Negative dentries cannot be opened.
    pub fn new(dentry: &Dentry) -> VfsResult<Self> {
        let inode = dentry.inode()?.clone();
        Ok(Self {
            name: String::from(dentry.name()),
            fops: inode.fops.clone(),
            inode,
            pos: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dentry(&self) -> Dentry {
        Dentry::new(&self.name, self.inode.clone())
    }

    pub fn inode(&self) -> &Inode {
        &self.inode
    }

    pub fn pos(&self) -> u32 {
        self.pos
    }

    pub fn set_pos(&mut self, pos: u32) {
        self.pos = pos;
    }

    /// Replaces the snapshot after the driver changed the inode.
    pub fn refresh(&mut self, inode: Inode) {
        self.inode = inode;
    }

    pub fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        let fops = self.fops.clone();
        fops.read(self, buf)
    }

    pub fn write(&mut self, buf: &[u8]) -> VfsResult<usize> {
        let fops = self.fops.clone();
        fops.write(self, buf)
    }

    pub fn seek(&mut self, offset: i64, whence: Whence) -> VfsResult<u32> {
        let fops = self.fops.clone();
        fops.seek(self, offset, whence)
    }

    pub fn get_key(&self) -> VfsResult<[u8; KEY_LEN]> {
        self.fops.getkey(self)
    }

    pub fn set_key(&self, key: &[u8; KEY_LEN]) -> VfsResult<()> {
        self.fops.setkey(self, key)
    }

    pub(super) fn open(&mut self) -> VfsResult<()> {
        let fops = self.fops.clone();
        fops.open(self)
    }

    /// Releases the file. The snapshot is dropped with it.
    pub fn close(mut self) -> VfsResult<()> {
        let fops = self.fops.clone();
        fops.close(&mut self)
    }
}
