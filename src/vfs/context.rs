use alloc::{string::String, vec::Vec};

use log::debug;

use super::{
    parse_path, Dentry, DentryChain, File, FsStat, InodeMode, ResolvedPath, SuperBlock,
    FNAME_LEN,
};
use crate::error::{FsError, VfsResult};

/// Per-task filesystem context: the mounted superblock and the current
/// directory. All path-taking entry points resolve relative paths against
/// the current directory.
#[derive(Debug, Clone)]
pub struct Vfs {
    sb: SuperBlock,
    cwd: DentryChain,
}

impl Vfs {
    pub fn new(sb: SuperBlock) -> Self {
        let cwd = DentryChain::root(sb.root.clone());
        Self { sb, cwd }
    }

    pub fn superblock(&self) -> &SuperBlock {
        &self.sb
    }

    pub fn cwd(&self) -> &DentryChain {
        &self.cwd
    }

    pub fn resolve(&self, path: &str) -> VfsResult<ResolvedPath> {
        parse_path(&self.sb.root, &self.cwd, path)
    }

    /// Opens an existing node. Directories open too; their reads yield
    /// entry names.
    pub fn open(&self, path: &str) -> VfsResult<File> {
        let resolved = self.resolve(path)?;
        if !resolved.is_found() {
            return Err(FsError::NotFound);
        }
        let mut file = File::new(resolved.node())?;
        file.open()?;
        debug!("open {} -> ino {}", path, file.inode().ino);
        Ok(file)
    }

    /// Creates a regular file. Its parent must exist.
    pub fn create(&self, path: &str) -> VfsResult<Dentry> {
        let resolved = self.resolve(path)?;
        if resolved.is_found() {
            return Err(FsError::AlreadyExists);
        }
        let dir = resolved.parent().inode()?;
        dir.ops.create(dir, resolved.node().name(), InodeMode::NEW_FILE)
    }

    pub fn mkdir(&self, path: &str) -> VfsResult<Dentry> {
        let resolved = self.resolve(path)?;
        if resolved.is_found() {
            return Err(FsError::AlreadyExists);
        }
        let dir = resolved.parent().inode()?;
        dir.ops.mkdir(dir, resolved.node().name())
    }

    /// Removes a file or an empty directory. The current directory and its
    /// ancestors cannot be removed.
    pub fn remove(&self, path: &str) -> VfsResult<()> {
        let resolved = self.resolve(path)?;
        if !resolved.is_found() {
            return Err(FsError::NotFound);
        }
        let node = resolved.node().inode()?;
        if self.cwd.contains_ino(node.ino) {
            return Err(FsError::Busy);
        }
        let dir = resolved.parent().inode()?;
        dir.ops.remove(dir, resolved.node().name())
    }

    /// Changes the current directory. The new chain replaces the old one.
    pub fn chdir(&mut self, path: &str) -> VfsResult<()> {
        let resolved = self.resolve(path)?;
        if !resolved.is_found() {
            return Err(FsError::NotFound);
        }
        if !resolved.node().inode()?.mode.is_dir() {
            return Err(FsError::NotADirectory);
        }
        self.cwd = resolved.into_chain();
        Ok(())
    }

    pub fn pwd(&self) -> String {
        self.cwd.path()
    }

    /// Names held by the directory at `path`, `.` and `..` included.
    pub fn read_dir(&self, path: &str) -> VfsResult<Vec<String>> {
        let mut dir = self.open(path)?;
        if !dir.inode().mode.is_dir() {
            return Err(FsError::NotADirectory);
        }
        let mut names = Vec::new();
        let mut buf = [0u8; FNAME_LEN];
        loop {
            let n = dir.read(&mut buf)?;
            if n == 0 {
                break;
            }
            names.push(String::from_utf8_lossy(&buf[..n]).into_owned());
        }
        dir.close()?;
        Ok(names)
    }

    /// Mode bits of an open file, as last seen by the driver.
    pub fn filemode(&self, file: &File) -> InodeMode {
        file.inode().mode
    }

    pub fn statfs(&self) -> VfsResult<FsStat> {
        self.sb.fs.statfs()
    }

    pub fn sync(&self) -> VfsResult<()> {
        self.sb.fs.sync()
    }
}
