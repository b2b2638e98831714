//! Virtual filesystem layer.
//!
//! The VFS never touches a disk. It owns path resolution and traversal state
//! and dispatches everything else through the operation traits a concrete
//! filesystem hands out with every [`Inode`] snapshot:
//!
//! - [`InodeOps`]: `lookup`, `create`, `remove`, `mkdir`
//! - [`FileOps`]: `open`, `read`, `write`, `close`, `seek`, `getkey`, `setkey`
//! - [`SuperOps`]: per-filesystem queries (root, statistics, sync)

mod context;
mod file;
mod path;

use alloc::{string::String, sync::Arc};
use core::fmt;

use bitflags::bitflags;
use serde::Serialize;

pub use context::Vfs;
pub use file::{File, Whence};
pub use path::{parse_path, DentryChain, Resolution, ResolvedPath};

use crate::error::{FsError, VfsResult};

/// Size of the dentry name buffer; names hold at most `FNAME_LEN - 1` bytes.
pub const FNAME_LEN: usize = 48;

/// Length of the per-file key stored in every inode.
pub const KEY_LEN: usize = 16;

/// Mask selecting the file type nibble of a mode.
pub const S_IFMT: u16 = 0xF000;

bitflags! {
    /// Type and permission bits of an inode.
    pub struct InodeMode: u16 {
        const S_IFSOCK = 0xC000;
        const S_IFLNK = 0xA000;
        const S_IFREG = 0x8000;
        const S_IFBLK = 0x6000;
        const S_IFDIR = 0x4000;
        const S_IFCHR = 0x2000;
        const S_IFIFO = 0x1000;

        const S_ISUID = 0o4000;
        const S_ISGID = 0o2000;
        const S_ISVTX = 0o1000;

        const S_IRUSR = 0o400;
        const S_IWUSR = 0o200;
        const S_IXUSR = 0o100;
        const S_IRGRP = 0o040;
        const S_IWGRP = 0o020;
        const S_IXGRP = 0o010;
        const S_IROTH = 0o004;
        const S_IWOTH = 0o002;
        const S_IXOTH = 0o001;
    }
}

impl InodeMode {
    /// Mode given to files created through [`Vfs::create`] (`0x81FF`).
    pub const NEW_FILE: InodeMode = InodeMode::from_bits_truncate(0x81FF);
    /// Mode given to directories created through [`Vfs::mkdir`] (`0x41FF`).
    pub const NEW_DIR: InodeMode = InodeMode::from_bits_truncate(0x41FF);

    pub fn file_type(&self) -> FileType {
        FileType::from_mode(self.bits())
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == FileType::Directory
    }

    pub fn is_file(&self) -> bool {
        self.file_type() == FileType::RegularFile
    }
}

/// Kind of node, decoded from the type nibble of a mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FileType {
    Unknown,
    RegularFile,
    Directory,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
    Symlink,
}

impl FileType {
    pub fn from_mode(mode: u16) -> Self {
        match mode >> 12 {
            0xC => FileType::Socket,
            0xA => FileType::Symlink,
            0x8 => FileType::RegularFile,
            0x6 => FileType::BlockDevice,
            0x4 => FileType::Directory,
            0x2 => FileType::CharDevice,
            0x1 => FileType::Fifo,
            _ => FileType::Unknown,
        }
    }
}

/// In-memory inode snapshot.
///
/// Not a cache: drivers re-read the on-disk inode on every operation and
/// only trust `ino` from the snapshot.
#[derive(Clone)]
pub struct Inode {
    /// Number of blocks of the file.
    pub blocks: u32,
    /// File size in bytes.
    pub size: u32,
    /// inode number.
    pub ino: u32,
    /// File type and permissions
    pub mode: InodeMode,
    /// inode operation table.
    pub ops: Arc<dyn InodeOps>,
    /// Default file operation table, picked by file type.
    pub fops: Arc<dyn FileOps>,
}

impl fmt::Debug for Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inode")
            .field("ino", &self.ino)
            .field("mode", &self.mode)
            .field("size", &self.size)
            .field("blocks", &self.blocks)
            .finish()
    }
}

/// A (name, inode snapshot) pair. Parent links live in [`DentryChain`].
///
/// A dentry without an inode names something that does not exist yet; path
/// resolution produces one for the last component of a `create` target.
#[derive(Debug, Clone)]
pub struct Dentry {
    name: String,
    inode: Option<Inode>,
}

impl Dentry {
    pub fn new(name: &str, inode: Inode) -> Self {
        Self {
            name: String::from(name),
            inode: Some(inode),
        }
    }

    /// A dentry carrying only a name.
    pub fn named(name: &str) -> Self {
        Self {
            name: String::from(name),
            inode: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inode(&self) -> VfsResult<&Inode> {
        self.inode.as_ref().ok_or(FsError::NotFound)
    }

    pub fn is_negative(&self) -> bool {
        self.inode.is_none()
    }

    pub fn ino(&self) -> Option<u32> {
        self.inode.as_ref().map(|i| i.ino)
    }
}

/// Filesystem statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FsStat {
    pub block_size: u32,
    pub blocks_count: u32,
    pub free_blocks: u32,
    pub inodes_count: u32,
    pub free_inodes: u32,
    pub name_max: u32,
}

impl FsStat {
    pub fn to_json(&self) -> VfsResult<String> {
        serde_json::to_string(self).map_err(|_| FsError::InvalidArgument)
    }
}

/// Inode operation table.
pub trait InodeOps: Send + Sync {
    /// Looks `name` up in directory `dir`. `Ok(None)` means absent.
    fn lookup(&self, dir: &Inode, name: &str) -> VfsResult<Option<Dentry>>;

    /// Creates `name` in `dir` with `mode` and returns its dentry.
    fn create(&self, dir: &Inode, name: &str, mode: InodeMode) -> VfsResult<Dentry>;

    /// Removes `name` from `dir`, releasing its inode and data.
    fn remove(&self, dir: &Inode, name: &str) -> VfsResult<()>;

    /// Creates directory `name` in `dir`, holding `.` and `..`.
    fn mkdir(&self, dir: &Inode, name: &str) -> VfsResult<Dentry>;
}

/// File operation table.
pub trait FileOps: Send + Sync {
    /// Called once the VFS has resolved the path and picked this table.
    fn open(&self, file: &mut File) -> VfsResult<()>;

    fn read(&self, file: &mut File, buf: &mut [u8]) -> VfsResult<usize>;

    fn write(&self, file: &mut File, buf: &[u8]) -> VfsResult<usize>;

    fn close(&self, file: &mut File) -> VfsResult<()>;

    /// Moves the cursor; the result must stay within `0..=size`.
    fn seek(&self, file: &mut File, offset: i64, whence: Whence) -> VfsResult<u32>;

    fn getkey(&self, file: &File) -> VfsResult<[u8; KEY_LEN]>;

    fn setkey(&self, file: &File, key: &[u8; KEY_LEN]) -> VfsResult<()>;
}

/// Superblock operation table.
pub trait SuperOps: Send + Sync {
    fn block_size(&self) -> u32;

    fn root_inode(&self) -> VfsResult<Inode>;

    fn read_inode(&self, ino: u32) -> VfsResult<Inode>;

    fn statfs(&self) -> VfsResult<FsStat>;

    fn sync(&self) -> VfsResult<()>;
}

/// Mounted filesystem as seen by the VFS.
#[derive(Clone)]
pub struct SuperBlock {
    pub block_size: u32,
    /// Root dentry, named `/`.
    pub root: Dentry,
    pub fs: Arc<dyn SuperOps>,
}

impl SuperBlock {
    pub fn new(fs: Arc<dyn SuperOps>) -> VfsResult<Self> {
        let root = Dentry::new("/", fs.root_inode()?);
        Ok(Self {
            block_size: fs.block_size(),
            root,
            fs,
        })
    }
}

impl fmt::Debug for SuperBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuperBlock")
            .field("block_size", &self.block_size)
            .field("root", &self.root)
            .finish()
    }
}
