// Format an ext2 image, optionally fill it from host files, and print its
// statistics.
//
//   cargo run --example mkimage -- --output disk.img --size 4096 --put README.md

use std::{fs, path::PathBuf, sync::Arc};

use clap::Parser;
use ext2kfs::{mkfs, Ext2Fs, MkfsOptions, MountOptions, RamDisk, DEFAULT_BLOCK_SIZE};
use log::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Build an ext2 image")]
struct Args {
    /// Image file to write
    #[arg(short, long, default_value = "ext2.img")]
    output: PathBuf,
    /// Volume size in KiB
    #[arg(short, long, default_value_t = 1024)]
    size: u32,
    #[arg(short, long, default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: u32,
    #[arg(short, long, default_value_t = 128)]
    inodes: u32,
    /// Host files copied into the root directory
    #[arg(short, long)]
    put: Vec<PathBuf>,
    /// Directories created under the root
    #[arg(short, long)]
    mkdir: Vec<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let opts = MkfsOptions {
        block_size: args.block_size,
        blocks_count: args.size * 1024 / args.block_size,
        inodes_count: args.inodes,
        ..Default::default()
    };
    let disk = RamDisk::new(opts.device_sectors());
    mkfs(Arc::new(disk.clone()), &opts)?;
    let fs = Ext2Fs::mount(Arc::new(disk.clone()), MountOptions::default())?;
    let vfs = fs.vfs()?;

    for dir in &args.mkdir {
        vfs.mkdir(&format!("/{}", dir))?;
        info!("mkdir /{}", dir);
    }
    for host in &args.put {
        let name = host
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or("host path has no usable file name")?;
        let data = fs::read(host)?;
        let path = format!("/{}", name);
        vfs.create(&path)?;
        let mut file = vfs.open(&path)?;
        file.write(&data)?;
        file.close()?;
        info!("copied {} ({} bytes) to {}", host.display(), data.len(), path);
    }
    vfs.sync()?;

    println!("{}", vfs.statfs()?.to_json()?);
    for name in vfs.read_dir("/")? {
        println!("  {}", name);
    }
    fs::write(&args.output, disk.to_bytes())?;
    println!("wrote {}", args.output.display());
    Ok(())
}
