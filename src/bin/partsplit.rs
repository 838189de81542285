//! Standalone partition splitter: scans a raw flash dump for its embedded
//! partition table and writes each partition out to its own file.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use efs2::partition::{self, compute_efs2_size};

/// Splits a raw flash dump into one file per partition table entry.
#[derive(Debug, Parser)]
#[command(name = "partsplit")]
struct Cli {
    in_filename: PathBuf,
    out_folder: PathBuf,

    /// Block size (0x4000 for 512-byte pages, 0x20000 for 2k pages).
    #[arg(value_parser = efs2::cli::intorhex)]
    block_size: u32,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut in_file = File::open(&cli.in_filename).with_context(|| format!("opening {}", cli.in_filename.display()))?;
    fs::create_dir_all(&cli.out_folder)?;

    let table = partition::scan(&mut in_file, cli.block_size as u64)?;

    for p in &table.partitions {
        info!("splitting partition {} at {:#x}", p.name, p.start);
        in_file.seek(SeekFrom::Start(p.start))?;

        let data = if matches!(p.name.as_str(), "EFS2" | "EFS2APPS") && p.length.is_none() {
            let mut raw = Vec::new();
            in_file.read_to_end(&mut raw)?;
            let size = compute_efs2_size(&raw)? as usize;
            raw.truncate(size);
            raw
        } else if let Some(len) = p.length {
            let mut raw = vec![0u8; len as usize];
            in_file.read_exact(&mut raw)?;
            raw
        } else {
            let mut raw = Vec::new();
            in_file.read_to_end(&mut raw)?;
            raw
        };

        let dest = cli.out_folder.join(format!("{}.bin", p.name));
        File::create(&dest).with_context(|| format!("creating {}", dest.display()))?.write_all(&data)?;
    }

    Ok(())
}
