//! Path resolution.
//!
//! Paths are `/`-separated. A leading `/` starts the walk at the root,
//! anything else starts at the current directory. `.` stays put and `..`
//! goes to the parent, never above the root. Every component but the last
//! must name an existing directory; the last one may be absent, which is
//! how `create` and `mkdir` learn the name to insert.

use alloc::{string::String, vec, vec::Vec};

use super::{Dentry, FNAME_LEN};
use crate::error::{FsError, VfsResult};

/// A walk from the root down to some node. The first element is always the
/// root dentry; the chain owns every snapshot on it.
#[derive(Debug, Clone)]
pub struct DentryChain {
    nodes: Vec<Dentry>,
}

impl DentryChain {
    pub fn root(root: Dentry) -> Self {
        Self { nodes: vec![root] }
    }

    /// The deepest node.
    pub fn current(&self) -> &Dentry {
        &self.nodes[self.nodes.len() - 1]
    }

    /// Parent of the deepest node. The root is its own parent.
    pub fn parent(&self) -> &Dentry {
        &self.nodes[self.nodes.len().saturating_sub(2)]
    }

    pub fn push(&mut self, dentry: Dentry) {
        self.nodes.push(dentry);
    }

    /// Drops the deepest node. The root is never popped.
    pub fn pop(&mut self) -> Option<Dentry> {
        if self.nodes.len() > 1 {
            self.nodes.pop()
        } else {
            None
        }
    }

    /// Number of nodes below the root.
    pub fn depth(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_root(&self) -> bool {
        self.nodes.len() == 1
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dentry> {
        self.nodes.iter()
    }

    /// Whether some node on the chain, root included, has inode `ino`.
    pub fn contains_ino(&self, ino: u32) -> bool {
        self.nodes.iter().any(|d| d.ino() == Some(ino))
    }

    /// Absolute path of the deepest node.
    pub fn path(&self) -> String {
        if self.is_root() {
            return String::from("/");
        }
        let mut path = String::new();
        for dentry in &self.nodes[1..] {
            path.push('/');
            path.push_str(dentry.name());
        }
        path
    }
}

/// Whether the last path component named an existing node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Found,
    Absent,
}

/// Outcome of [`parse_path`].
#[derive(Debug, Clone)]
pub struct ResolvedPath {
    /// root ..= node when found, root ..= parent when absent.
    chain: DentryChain,
    absent: Option<Dentry>,
}

impl ResolvedPath {
    /// Directory holding the node. The root is its own parent.
    pub fn parent(&self) -> &Dentry {
        match self.absent {
            Some(_) => self.chain.current(),
            None => self.chain.parent(),
        }
    }

    /// The resolved node. Carries no inode when [`Resolution::Absent`].
    pub fn node(&self) -> &Dentry {
        self.absent.as_ref().unwrap_or_else(|| self.chain.current())
    }

    pub fn resolution(&self) -> Resolution {
        match self.absent {
            Some(_) => Resolution::Absent,
            None => Resolution::Found,
        }
    }

    pub fn is_found(&self) -> bool {
        self.absent.is_none()
    }

    /// Chain from the root down to the node, or to its parent when absent.
    pub fn into_chain(self) -> DentryChain {
        self.chain
    }
}

fn check_component(name: &str) -> VfsResult<()> {
    if name.len() > FNAME_LEN - 1 {
        return Err(FsError::NameTooLong);
    }
    Ok(())
}

/// Resolves `path` starting at `root` or at `cwd`.
///
/// Returns the parent chain and the last node. The walk is read-only; a
/// missing intermediate component is [`FsError::NotFound`], an empty
/// intermediate component (`a//b`) is [`FsError::InvalidPath`]. A trailing
/// `/` resolves to the directory walked so far.
pub fn parse_path(root: &Dentry, cwd: &DentryChain, path: &str) -> VfsResult<ResolvedPath> {
    if path.is_empty() {
        return Err(FsError::InvalidPath);
    }
    let (mut walk, rest) = match path.strip_prefix('/') {
        Some(rest) => {
            if rest.starts_with('/') {
                return Err(FsError::InvalidPath);
            }
            (DentryChain::root(root.clone()), rest)
        }
        None => (cwd.clone(), path),
    };
    let (dirs, last) = match rest.rsplit_once('/') {
        Some((dirs, last)) => (Some(dirs), last),
        None => (None, rest),
    };

    for name in dirs.into_iter().flat_map(|d| d.split('/')) {
        match name {
            "" => return Err(FsError::InvalidPath),
            "." => {}
            ".." => {
                walk.pop();
            }
            name => {
                check_component(name)?;
                let dir = walk.current().inode()?;
                match dir.ops.lookup(dir, name)? {
                    Some(next) => walk.push(next),
                    None => return Err(FsError::NotFound),
                }
            }
        }
    }

    match last {
        "" | "." => {}
        ".." => {
            walk.pop();
        }
        name => {
            check_component(name)?;
            let dir = walk.current().inode()?;
            match dir.ops.lookup(dir, name)? {
                Some(node) => walk.push(node),
                None => {
                    return Ok(ResolvedPath {
                        chain: walk,
                        absent: Some(Dentry::named(name)),
                    })
                }
            }
        }
    }
    Ok(ResolvedPath {
        chain: walk,
        absent: None,
    })
}

#[cfg(test)]
mod tests {
    use alloc::{sync::Arc, vec::Vec};

    use spin::Mutex;

    use super::*;
    use crate::vfs::{File, FileOps, Inode, InodeMode, InodeOps, Whence, KEY_LEN};

    /// Flat (parent, name, ino, is_dir) table standing in for a disk.
    #[derive(Clone)]
    struct MockTree {
        entries: Arc<Mutex<Vec<(u32, String, u32, bool)>>>,
    }

    impl MockTree {
        fn new() -> Self {
            Self {
                entries: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn add(&self, parent: u32, name: &str, ino: u32, is_dir: bool) {
            self.entries
                .lock()
                .push((parent, String::from(name), ino, is_dir));
        }

        fn inode(&self, ino: u32, is_dir: bool) -> Inode {
            let mode = if is_dir {
                InodeMode::NEW_DIR
            } else {
                InodeMode::NEW_FILE
            };
            Inode {
                blocks: 0,
                size: 0,
                ino,
                mode,
                ops: Arc::new(self.clone()),
                fops: Arc::new(self.clone()),
            }
        }
    }

    impl InodeOps for MockTree {
        fn lookup(&self, dir: &Inode, name: &str) -> VfsResult<Option<Dentry>> {
            if !dir.mode.is_dir() {
                return Err(FsError::NotADirectory);
            }
            let found = self
                .entries
                .lock()
                .iter()
                .find(|e| e.0 == dir.ino && e.1 == name)
                .map(|e| (e.2, e.3));
            Ok(found.map(|(ino, is_dir)| Dentry::new(name, self.inode(ino, is_dir))))
        }

        fn create(&self, _dir: &Inode, _name: &str, _mode: InodeMode) -> VfsResult<Dentry> {
            Err(FsError::InvalidArgument)
        }

        fn remove(&self, _dir: &Inode, _name: &str) -> VfsResult<()> {
            Err(FsError::InvalidArgument)
        }

        fn mkdir(&self, _dir: &Inode, _name: &str) -> VfsResult<Dentry> {
            Err(FsError::InvalidArgument)
        }
    }

    impl FileOps for MockTree {
        fn open(&self, _file: &mut File) -> VfsResult<()> {
            Ok(())
        }

        fn read(&self, _file: &mut File, _buf: &mut [u8]) -> VfsResult<usize> {
            Ok(0)
        }

        fn write(&self, _file: &mut File, _buf: &[u8]) -> VfsResult<usize> {
            Ok(0)
        }

        fn close(&self, _file: &mut File) -> VfsResult<()> {
            Ok(())
        }

        fn seek(&self, _file: &mut File, _offset: i64, _whence: Whence) -> VfsResult<u32> {
            Ok(0)
        }

        fn getkey(&self, _file: &File) -> VfsResult<[u8; KEY_LEN]> {
            Ok([0; KEY_LEN])
        }

        fn setkey(&self, _file: &File, _key: &[u8; KEY_LEN]) -> VfsResult<()> {
            Ok(())
        }
    }

    /// `/a/b/f` with a sibling `/c`.
    fn fixture() -> (Dentry, DentryChain) {
        let tree = MockTree::new();
        tree.add(2, "a", 10, true);
        tree.add(10, "b", 11, true);
        tree.add(11, "f", 12, false);
        tree.add(2, "c", 13, true);
        let root = Dentry::new("/", tree.inode(2, true));
        let cwd = DentryChain::root(root.clone());
        (root, cwd)
    }

    fn resolve_ino(root: &Dentry, cwd: &DentryChain, path: &str) -> u32 {
        let resolved = parse_path(root, cwd, path).unwrap();
        assert!(resolved.is_found(), "{} not found", path);
        resolved.node().ino().unwrap()
    }

    #[test]
    fn test_dotdot_is_idempotent() {
        let (root, cwd) = fixture();
        assert_eq!(resolve_ino(&root, &cwd, "/a/b/.."), resolve_ino(&root, &cwd, "/a"));
        assert_eq!(resolve_ino(&root, &cwd, "/a/./b/../b/f"), 12);
        assert_eq!(resolve_ino(&root, &cwd, "/../../a"), 10);
        assert_eq!(resolve_ino(&root, &cwd, "/"), 2);
        assert_eq!(resolve_ino(&root, &cwd, ".."), 2);
    }

    #[test]
    fn test_parent_and_chain() {
        let (root, cwd) = fixture();
        let resolved = parse_path(&root, &cwd, "/a/b/f").unwrap();
        assert_eq!(resolved.parent().ino(), Some(11));
        assert_eq!(resolved.into_chain().path(), "/a/b/f");

        let resolved = parse_path(&root, &cwd, "/a/b/").unwrap();
        assert_eq!(resolved.node().ino(), Some(11));
        assert_eq!(resolved.parent().ino(), Some(10));

        let resolved = parse_path(&root, &cwd, "/").unwrap();
        assert_eq!(resolved.parent().ino(), Some(2));
        assert!(resolved.into_chain().is_root());
    }

    #[test]
    fn test_relative_walk_uses_cwd() {
        let (root, cwd) = fixture();
        let cwd = parse_path(&root, &cwd, "/a/b").unwrap().into_chain();
        assert_eq!(cwd.depth(), 2);
        assert_eq!(resolve_ino(&root, &cwd, "f"), 12);
        assert_eq!(resolve_ino(&root, &cwd, "../../c"), 13);
        assert_eq!(resolve_ino(&root, &cwd, "/c"), 13);
    }

    #[test]
    fn test_absent_last_component() {
        let (root, cwd) = fixture();
        let resolved = parse_path(&root, &cwd, "/a/new").unwrap();
        assert_eq!(resolved.resolution(), Resolution::Absent);
        assert!(resolved.node().is_negative());
        assert_eq!(resolved.node().name(), "new");
        assert_eq!(resolved.parent().ino(), Some(10));
    }

    #[test]
    fn test_malformed_paths() {
        let (root, cwd) = fixture();
        let err = |p: &str| parse_path(&root, &cwd, p).unwrap_err();
        assert_eq!(err(""), FsError::InvalidPath);
        assert_eq!(err("//a"), FsError::InvalidPath);
        assert_eq!(err("/a//b"), FsError::InvalidPath);
        assert_eq!(err("/missing/f"), FsError::NotFound);
        assert_eq!(err("/a/b/f/g"), FsError::NotADirectory);
        let long = "x".repeat(FNAME_LEN);
        assert_eq!(err(&long), FsError::NameTooLong);
        let ok = "x".repeat(FNAME_LEN - 1);
        assert!(parse_path(&root, &cwd, &ok).is_ok());
    }
}
