#[cfg(test)]
mod tests {
    use alloc::{format, string::String, sync::Arc, vec, vec::Vec};

    use rand::{rngs::StdRng, Rng, SeedableRng};

    use crate::{
        error::FsError,
        ext2::{
            layout::{DirEntryHeader, EXT2_FT_DIR, ROOT_INO},
            mkfs, Ext2Fs, MkfsOptions, MountOptions,
        },
        vfs::{InodeMode, SuperOps, Vfs, Whence, KEY_LEN},
        RamDisk,
    };

    fn options(block_size: u32) -> MkfsOptions {
        MkfsOptions {
            block_size,
            blocks_count: (1 << 20) / block_size,
            inodes_count: 128,
            ..Default::default()
        }
    }

    fn setup_with(opts: MkfsOptions) -> (RamDisk, Arc<Ext2Fs>, Vfs) {
        let _ = env_logger::builder().is_test(true).try_init();
        let disk = RamDisk::new(opts.device_sectors());
        mkfs(Arc::new(disk.clone()), &opts).expect("mkfs failed");
        let fs = Ext2Fs::mount(
            Arc::new(disk.clone()),
            MountOptions {
                base_lba: opts.base_lba,
            },
        )
        .expect("mount failed");
        let vfs = fs.vfs().expect("no root");
        (disk, fs, vfs)
    }

    fn setup() -> (RamDisk, Arc<Ext2Fs>, Vfs) {
        setup_with(options(1024))
    }

    fn pattern(len: usize, seed: u64) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..len).map(|_| rng.gen()).collect()
    }

    fn write_file(vfs: &Vfs, path: &str, data: &[u8]) {
        vfs.create(path).expect("create failed");
        let mut file = vfs.open(path).expect("open failed");
        assert_eq!(file.write(data).expect("write failed"), data.len());
        file.close().unwrap();
    }

    fn read_file(vfs: &Vfs, path: &str) -> Vec<u8> {
        let mut file = vfs.open(path).expect("open failed");
        let mut out = Vec::new();
        let mut buf = [0u8; 700];
        loop {
            let n = file.read(&mut buf).expect("read failed");
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    fn ino_of(vfs: &Vfs, path: &str) -> u32 {
        vfs.resolve(path).unwrap().node().ino().expect("not found")
    }

    /// Every block of directory `ino` must be covered exactly by its records.
    fn assert_rec_len_sums(fs: &Ext2Fs, ino: u32) {
        let st = fs.lock();
        let dir = st.read_inode(ino).unwrap();
        let bs = st.block_size();
        assert_eq!(dir.size as usize, dir.blocks as usize * bs);
        let mut block = st.new_block_buf();
        for &blkno in &dir.block[..dir.blocks as usize] {
            st.read_block(blkno, &mut block).unwrap();
            let mut off = 0;
            while off < bs {
                let hdr = DirEntryHeader::read_at(&block, off).unwrap();
                assert!(hdr.rec_len as usize >= hdr.used_len());
                off += hdr.rec_len as usize;
            }
            assert_eq!(off, bs, "records of block {} overrun", blkno);
        }
    }

    #[test]
    fn test_small_file_lifecycle() {
        let (_disk, fs, vfs) = setup();
        let before = vfs.statfs().unwrap();
        let data = pattern(2000, 1);

        // 1. create and write 2000 bytes: two 1 KiB blocks
        write_file(&vfs, "/foo.txt", &data);
        let file = vfs.open("/foo.txt").unwrap();
        assert_eq!(file.inode().size, 2000);
        assert_eq!(file.inode().blocks, 2);
        assert!(vfs.filemode(&file).is_file());
        let after = vfs.statfs().unwrap();
        assert_eq!(after.free_blocks, before.free_blocks - 2);
        assert_eq!(after.free_inodes, before.free_inodes - 1);

        // 2. identical read-back
        assert_eq!(read_file(&vfs, "/foo.txt"), data);

        // 3. removal frees both blocks and the inode
        vfs.remove("/foo.txt").unwrap();
        assert_eq!(vfs.statfs().unwrap(), before);
        assert_eq!(vfs.open("/foo.txt").unwrap_err(), FsError::NotFound);
        assert_rec_len_sums(&fs, ROOT_INO);
    }

    #[test]
    fn test_mkdir_and_chdir() {
        let (_disk, fs, mut vfs) = setup();
        vfs.mkdir("sub").unwrap();
        vfs.chdir("sub").unwrap();
        assert_eq!(vfs.pwd(), "/sub");

        let names = vfs.read_dir(".").unwrap();
        assert_eq!(names, vec![String::from("."), String::from("..")]);
        assert_eq!(ino_of(&vfs, ".."), ROOT_INO);
        assert_eq!(ino_of(&vfs, "."), ino_of(&vfs, "/sub"));

        let sub = ino_of(&vfs, ".");
        let st = fs.lock();
        assert_eq!(st.read_inode(sub).unwrap().links_count, 2);
        assert_eq!(st.read_inode(ROOT_INO).unwrap().links_count, 3);
        drop(st);
        assert_rec_len_sums(&fs, sub);

        vfs.chdir("..").unwrap();
        assert_eq!(vfs.pwd(), "/");
        vfs.remove("sub").unwrap();
        assert!(!vfs.resolve("sub").unwrap().is_found());
        assert_eq!(fs.lock().read_inode(ROOT_INO).unwrap().links_count, 2);
    }

    #[test]
    fn test_removal_safety() {
        let (_disk, fs, mut vfs) = setup();
        vfs.mkdir("/a").unwrap();
        vfs.mkdir("/a/b").unwrap();
        write_file(&vfs, "/a/b/f", b"keep me");
        let before = vfs.statfs().unwrap();

        // 1. non-empty directories stay untouched
        assert_eq!(vfs.remove("/a/b").unwrap_err(), FsError::DirectoryNotEmpty);
        assert_eq!(vfs.statfs().unwrap(), before);
        assert_eq!(read_file(&vfs, "/a/b/f"), b"keep me");

        // 2. the current directory and its ancestors are busy
        vfs.chdir("/a/b").unwrap();
        vfs.remove("f").unwrap();
        assert_eq!(vfs.remove("/a/b").unwrap_err(), FsError::Busy);
        assert_eq!(vfs.remove(".").unwrap_err(), FsError::Busy);
        assert_eq!(vfs.remove("..").unwrap_err(), FsError::Busy);
        assert_eq!(vfs.remove("/").unwrap_err(), FsError::Busy);

        // 3. fine once we step out
        vfs.chdir("/").unwrap();
        vfs.remove("/a/b").unwrap();
        vfs.remove("/a").unwrap();
        assert_rec_len_sums(&fs, ROOT_INO);
        assert_eq!(vfs.read_dir("/").unwrap(), vec![String::from("."), String::from("..")]);
    }

    /// Rewrites the inode number of the `..` record in the first block of
    /// directory `ino`.
    fn set_dotdot(fs: &Ext2Fs, ino: u32, parent: u32) {
        let st = fs.lock();
        let dir = st.read_inode(ino).unwrap();
        let mut block = st.new_block_buf();
        st.read_block(dir.block[0], &mut block).unwrap();
        let hdr = DirEntryHeader::read_at(&block, 12).unwrap();
        DirEntryHeader { inode: parent, ..hdr }.write_at(&mut block, 12);
        st.write_block(dir.block[0], &block).unwrap();
    }

    #[test]
    fn test_is_ancestor() {
        let (_disk, fs, vfs) = setup();
        vfs.mkdir("/a").unwrap();
        vfs.mkdir("/a/b").unwrap();
        let a = ino_of(&vfs, "/a");
        let b = ino_of(&vfs, "/a/b");

        let st = fs.lock();
        assert!(st.is_ancestor(ROOT_INO, b).unwrap());
        assert!(st.is_ancestor(a, b).unwrap());
        assert!(st.is_ancestor(b, b).unwrap());
        assert!(!st.is_ancestor(b, a).unwrap());
        assert!(!st.is_ancestor(a, ROOT_INO).unwrap());
        drop(st);

        // hide the `..` record of b
        let st = fs.lock();
        let dir = st.read_inode(b).unwrap();
        let mut block = st.new_block_buf();
        st.read_block(dir.block[0], &mut block).unwrap();
        block[12 + 8..12 + 10].copy_from_slice(b"zz");
        st.write_block(dir.block[0], &block).unwrap();
        assert_eq!(st.is_ancestor(ROOT_INO, b).unwrap_err(), FsError::Corrupted);
        assert!(st.is_ancestor(b, b).unwrap());
    }

    #[test]
    fn test_remove_refuses_ancestor_of_directory() {
        let (_disk, fs, vfs) = setup();
        vfs.mkdir("/a").unwrap();
        vfs.mkdir("/c").unwrap();
        let a = ino_of(&vfs, "/a");
        let c = ino_of(&vfs, "/c");
        // c links to a and claims a as its parent
        set_dotdot(&fs, c, a);
        let mut st = fs.lock();
        let mut cdir = st.read_inode(c).unwrap();
        st.insert_dentry(c, &mut cdir, b"a", a, EXT2_FT_DIR).unwrap();
        let free = st.read_group_desc().unwrap().free_inodes_count;

        let mut cdir = st.read_inode(c).unwrap();
        assert_eq!(st.remove_dentry(c, &mut cdir, b"a").unwrap_err(), FsError::Busy);
        assert!(st.ino_exist(a).unwrap());
        assert_eq!(st.read_dentry_by_name(&cdir, b"a").unwrap(), Some(a));
        assert_eq!(st.read_group_desc().unwrap().free_inodes_count, free);
    }

    #[test]
    fn test_driver_rejects_long_names() {
        let (_disk, fs, vfs) = setup();
        let root = vfs.superblock().root.inode().unwrap().clone();
        let long = "n".repeat(48);
        assert_eq!(
            root.ops.create(&root, &long, InodeMode::NEW_FILE).unwrap_err(),
            FsError::NameTooLong
        );
        assert_eq!(root.ops.mkdir(&root, &long).unwrap_err(), FsError::NameTooLong);
        assert_eq!(fs.statfs().unwrap().free_inodes, 118);

        let fits = "n".repeat(47);
        root.ops.create(&root, &fits, InodeMode::NEW_FILE).unwrap();
        assert_eq!(
            vfs.read_dir("/").unwrap(),
            vec![String::from("."), String::from(".."), fits.clone()]
        );
        vfs.remove(&format!("/{}", fits)).unwrap();
        assert_eq!(vfs.read_dir("/").unwrap().len(), 2);
    }

    #[test]
    fn test_dot_entries_cannot_be_removed() {
        let (_disk, fs, vfs) = setup();
        vfs.mkdir("/d").unwrap();
        let d = vfs.resolve("/d").unwrap();
        let inode = d.node().inode().unwrap();
        assert_eq!(inode.ops.remove(inode, ".").unwrap_err(), FsError::InvalidArgument);
        assert_eq!(inode.ops.remove(inode, "..").unwrap_err(), FsError::InvalidArgument);
        assert_rec_len_sums(&fs, inode.ino);
    }

    #[test]
    fn test_path_resolution_is_idempotent() {
        let (_disk, _fs, mut vfs) = setup();
        vfs.mkdir("/a").unwrap();
        vfs.mkdir("/a/b").unwrap();
        assert_eq!(ino_of(&vfs, "/a/b/.."), ino_of(&vfs, "/a"));
        assert_eq!(ino_of(&vfs, "/a/b/../b/."), ino_of(&vfs, "/a/b"));
        assert_eq!(ino_of(&vfs, "/a/b/"), ino_of(&vfs, "/a/b"));

        vfs.chdir("/a/b").unwrap();
        assert_eq!(ino_of(&vfs, "."), vfs.cwd().current().ino().unwrap());
        assert_eq!(ino_of(&vfs, "../.."), ROOT_INO);
        assert_eq!(ino_of(&vfs, "../../../.."), ROOT_INO);

        assert_eq!(vfs.chdir("/a/missing").unwrap_err(), FsError::NotFound);
        assert_eq!(vfs.pwd(), "/a/b");
    }

    #[test]
    fn test_read_write_sizes() {
        let (_disk, _fs, vfs) = setup();
        let bs = 1024;
        let sizes = [1, bs - 1, bs, 12 * bs, 12 * bs + 1, 12 * bs + 3000, 40 * bs + 17];
        for (i, &len) in sizes.iter().enumerate() {
            let path = format!("/f{}", i);
            let data = pattern(len, i as u64);
            write_file(&vfs, &path, &data);
            assert_eq!(read_file(&vfs, &path), data, "size {}", len);
            let file = vfs.open(&path).unwrap();
            assert_eq!(file.inode().size as usize, len);
            assert_eq!(file.inode().blocks as usize, (len + bs - 1) / bs);
        }
    }

    #[test]
    fn test_write_across_indirect_boundary() {
        let (_disk, _fs, vfs) = setup();
        let mut data = pattern(13 * 1024, 7);
        write_file(&vfs, "/big", &data);

        let mut file = vfs.open("/big").unwrap();
        let at = 12 * 1024 - 10;
        assert_eq!(file.seek(at as i64, Whence::Set).unwrap(), at as u32);
        file.write(&[0xEE; 20]).unwrap();
        data[at..at + 20].fill(0xEE);
        assert_eq!(file.pos(), at as u32 + 20);

        // appending grows the file through the indirect block
        file.seek(0, Whence::End).unwrap();
        file.write(b"tail").unwrap();
        data.extend_from_slice(b"tail");
        assert_eq!(read_file(&vfs, "/big"), data);
    }

    #[test]
    fn test_file_size_limit() {
        let (_disk, _fs, vfs) = setup();
        let max = (12 + 1024 / 4) * 1024;
        vfs.create("/max").unwrap();
        let mut file = vfs.open("/max").unwrap();
        file.write(&vec![0x5A; max]).unwrap();
        assert_eq!(file.inode().size as usize, max);
        assert_eq!(file.write(b"x").unwrap_err(), FsError::FileTooLarge);

        vfs.create("/over").unwrap();
        let mut file = vfs.open("/over").unwrap();
        assert_eq!(file.write(&vec![0; max + 1]).unwrap_err(), FsError::FileTooLarge);
    }

    #[test]
    fn test_seek() {
        let (_disk, _fs, vfs) = setup();
        write_file(&vfs, "/s", b"0123456789");
        let mut file = vfs.open("/s").unwrap();
        assert_eq!(file.seek(4, Whence::Set).unwrap(), 4);
        assert_eq!(file.seek(2, Whence::Cur).unwrap(), 6);
        assert_eq!(file.seek(-3, Whence::End).unwrap(), 7);
        let mut buf = [0u8; 8];
        assert_eq!(file.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"789");
        assert_eq!(file.read(&mut buf).unwrap(), 0);

        assert_eq!(file.seek(-1, Whence::Set).unwrap_err(), FsError::InvalidArgument);
        assert_eq!(file.seek(1, Whence::End).unwrap_err(), FsError::InvalidArgument);
        assert_eq!(file.pos(), 10);
        assert_eq!(Whence::from_raw(2), Some(Whence::Cur));
        assert_eq!(Whence::from_raw(0), None);
    }

    #[test]
    fn test_overwrite_keeps_size() {
        let (_disk, _fs, vfs) = setup();
        write_file(&vfs, "/o", b"hello world");
        let mut file = vfs.open("/o").unwrap();
        file.write(b"HELLO").unwrap();
        assert_eq!(read_file(&vfs, "/o"), b"HELLO world");
    }

    #[test]
    fn test_keys_survive_remount() {
        let (disk, fs, vfs) = setup();
        write_file(&vfs, "/k", b"secret");
        let key: [u8; KEY_LEN] = *b"0123456789abcdef";
        let file = vfs.open("/k").unwrap();
        assert_eq!(file.get_key().unwrap(), [0; KEY_LEN]);
        file.set_key(&key).unwrap();
        drop(file);
        vfs.sync().unwrap();
        drop(vfs);
        drop(fs);

        let fs = Ext2Fs::mount(Arc::new(disk), MountOptions::default()).unwrap();
        let vfs = fs.vfs().unwrap();
        let file = vfs.open("/k").unwrap();
        assert_eq!(file.get_key().unwrap(), key);
        assert_eq!(read_file(&vfs, "/k"), b"secret");
    }

    #[test]
    fn test_directory_files() {
        let (_disk, _fs, vfs) = setup();
        write_file(&vfs, "/x", b"");
        vfs.mkdir("/y").unwrap();
        let mut dir = vfs.open("/").unwrap();
        assert!(vfs.filemode(&dir).is_dir());
        assert_eq!(dir.write(b"nope").unwrap_err(), FsError::IsADirectory);
        assert_eq!(vfs.read_dir("/").unwrap(), vec![".", "..", "x", "y"]);
        assert_eq!(vfs.read_dir("/x").unwrap_err(), FsError::NotADirectory);
        dir.seek(2, Whence::Set).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(dir.read(&mut buf).unwrap(), 1);
        assert_eq!(&buf[..1], b"x");

        // positions count entries and stop at the last one
        assert_eq!(dir.seek(0, Whence::End).unwrap(), 4);
        assert_eq!(dir.read(&mut buf).unwrap(), 0);
        assert_eq!(dir.seek(-1, Whence::Cur).unwrap(), 3);
        assert_eq!(dir.read(&mut buf).unwrap(), 1);
        assert_eq!(&buf[..1], b"y");
        assert_eq!(dir.seek(5, Whence::Set).unwrap_err(), FsError::InvalidArgument);
        assert_eq!(dir.seek(-1, Whence::Set).unwrap_err(), FsError::InvalidArgument);
        assert_eq!(dir.pos(), 4);
    }

    #[test]
    fn test_dentry_by_index_snapshots_inode() {
        let (_disk, fs, vfs) = setup();
        write_file(&vfs, "/f", &pattern(2000, 7));
        vfs.mkdir("/d").unwrap();
        let root = vfs.superblock().root.inode().unwrap().clone();

        let f = fs.read_dentry_by_index(&root, 2).unwrap().expect("no entry 2");
        assert_eq!(f.name(), "f");
        let inode = f.inode().unwrap();
        assert_eq!(inode.ino, ino_of(&vfs, "/f"));
        assert_eq!(inode.size, 2000);
        assert_eq!(inode.blocks, 2);
        assert!(inode.mode.is_file());

        let d = fs.read_dentry_by_index(&root, 3).unwrap().expect("no entry 3");
        assert_eq!(d.name(), "d");
        assert!(d.inode().unwrap().mode.is_dir());
        assert!(fs.read_dentry_by_index(&root, 4).unwrap().is_none());
    }

    #[test]
    fn test_create_errors() {
        let (_disk, _fs, vfs) = setup();
        vfs.create("/dup").unwrap();
        assert_eq!(vfs.create("/dup").unwrap_err(), FsError::AlreadyExists);
        assert_eq!(vfs.mkdir("/dup").unwrap_err(), FsError::AlreadyExists);
        assert_eq!(vfs.create("/nodir/f").unwrap_err(), FsError::NotFound);
        assert_eq!(vfs.create("/dup/f").unwrap_err(), FsError::NotADirectory);
        let long = format!("/{}", "n".repeat(48));
        assert_eq!(vfs.create(&long).unwrap_err(), FsError::NameTooLong);
        let fits = format!("/{}", "n".repeat(47));
        vfs.create(&fits).unwrap();
        assert!(vfs.resolve(&fits).unwrap().is_found());
    }

    #[test]
    fn test_inode_exhaustion() {
        let (_disk, fs, vfs) = setup_with(MkfsOptions {
            inodes_count: 16,
            ..options(1024)
        });
        // inodes 1..=10 are reserved
        for i in 0..6 {
            vfs.create(&format!("/f{}", i)).unwrap();
        }
        assert_eq!(vfs.create("/f6").unwrap_err(), FsError::NoSpace);
        assert!(!vfs.resolve("/f6").unwrap().is_found());
        assert_eq!(vfs.statfs().unwrap().free_inodes, 0);
        vfs.remove("/f0").unwrap();
        vfs.create("/f6").unwrap();
        assert_rec_len_sums(&fs, ROOT_INO);
    }

    #[test]
    fn test_directory_records_stay_consistent() {
        let (_disk, fs, mut vfs) = setup();
        let mut rng = StdRng::seed_from_u64(0xE2);
        vfs.mkdir("/d").unwrap();
        vfs.chdir("/d").unwrap();
        let dir = ino_of(&vfs, ".");

        let mut live: Vec<String> = Vec::new();
        for round in 0..300 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let name = format!("e{}_{}", round, "x".repeat(rng.gen_range(0..40)));
                vfs.create(&name).unwrap();
                live.push(name);
            } else {
                let victim = live.swap_remove(rng.gen_range(0..live.len()));
                vfs.remove(&victim).unwrap();
            }
            assert_rec_len_sums(&fs, dir);
        }

        let mut listed = vfs.read_dir(".").unwrap();
        listed.retain(|n| n != "." && n != "..");
        listed.sort();
        live.sort();
        assert_eq!(listed, live);

        // drain everything; freed blocks return to the volume
        for name in live.drain(..) {
            vfs.remove(&name).unwrap();
            assert_rec_len_sums(&fs, dir);
        }
        vfs.chdir("/").unwrap();
        vfs.remove("/d").unwrap();
    }

    #[test]
    fn test_block_sizes_and_partition_offset() {
        for bs in [2048, 4096] {
            let (_disk, _fs, vfs) = setup_with(MkfsOptions {
                base_lba: 0x3F,
                ..options(bs)
            });
            let len = 12 * bs as usize + 100;
            let data = pattern(len, bs as u64);
            write_file(&vfs, "/f", &data);
            assert_eq!(read_file(&vfs, "/f"), data);
            assert_eq!(vfs.superblock().block_size, bs);
            vfs.remove("/f").unwrap();
        }
    }

    #[test]
    fn test_mount_rejects_garbage() {
        let disk = RamDisk::new(2048);
        assert_eq!(
            Ext2Fs::mount(Arc::new(disk), MountOptions::default()).unwrap_err(),
            FsError::Corrupted
        );
        let bad = MkfsOptions {
            block_size: 512,
            ..options(1024)
        };
        let disk = RamDisk::new(2048);
        assert_eq!(mkfs(Arc::new(disk), &bad).unwrap_err(), FsError::InvalidArgument);
    }

    #[test]
    fn test_device_failure_is_io() {
        let (disk, _fs, vfs) = setup();
        disk.set_broken(true);
        assert_eq!(vfs.create("/f").unwrap_err(), FsError::Io);
        disk.set_broken(false);
        vfs.create("/f").unwrap();
    }

    #[test]
    fn test_ops_outliving_volume() {
        let (_disk, fs, vfs) = setup();
        let root = vfs.superblock().root.inode().unwrap().clone();
        drop(vfs);
        drop(fs);
        assert_eq!(root.ops.lookup(&root, "x").unwrap_err(), FsError::NotInitialized);
    }

    #[test]
    fn test_statfs_json() {
        let (_disk, fs, _vfs) = setup();
        let stat = fs.statfs().unwrap();
        let json: serde_json::Value = serde_json::from_str(&stat.to_json().unwrap()).unwrap();
        assert_eq!(json["block_size"], 1024);
        assert_eq!(json["inodes_count"], 128);
        assert_eq!(json["free_inodes"], 118);
        assert_eq!(json["name_max"], 47);
    }
}
