use std::cell::RefCell;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use log::info;

use efs2::cli::EccArgs;
use efs2::ecc::EccReader;
use efs2::fs::{BaseOffset, Filesystem, MountOptions};
use efs2::pm::ReadSeek;

mod shell;
mod zipdump;

/// Reverse-engineering dumper for Qualcomm EFS2 and CEFS flash images.
#[derive(Debug, Parser)]
#[command(name = "dumpefs")]
struct Cli {
    /// Source flash image.
    in_filename: PathBuf,

    /// Destination zip file. Omit to enter an interactive shell instead.
    out_filename: Option<PathBuf>,

    /// Enable the ECC-correcting read layer.
    #[arg(short = 'e', long)]
    ecc: bool,

    #[command(flatten)]
    ecc_args: EccArgs,

    /// Byte offset of the EFS2 filesystem (default: autodetect).
    #[arg(short = 's', long = "start-offset", value_parser = efs2::cli::intorhex, conflicts_with = "partition")]
    start_offset: Option<u32>,

    /// Partition name to use as the base offset, looked up in an embedded
    /// partition table.
    #[arg(short = 'p', long)]
    partition: Option<String>,

    /// Superblock candidate to use (default: highest age).
    #[arg(long, value_parser = efs2::cli::intorhex)]
    superblock: Option<u32>,

    /// Open the image as a CEFS (gang image) factory dump.
    #[arg(short = 'f', long)]
    cefs: bool,

    /// Text encoding used to decode file names.
    #[arg(short = 'c', long, default_value = "latin-1")]
    encoding: String,

    /// Skip parsing the log journal.
    #[arg(long = "no-log")]
    no_log: bool,

    /// Block size, only used when resolving `--partition`.
    #[arg(long = "block-size", value_parser = efs2::cli::intorhex, default_value = "0x20000")]
    block_size: u32,

    #[arg(short = 'v', long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    let encoding = encoding_rs::Encoding::for_label(cli.encoding.as_bytes())
        .ok_or_else(|| anyhow!("unknown encoding {:?}", cli.encoding))?;

    let base_offset = if let Some(name) = &cli.partition {
        BaseOffset::Partition(name.clone())
    } else if let Some(off) = cli.start_offset {
        BaseOffset::Explicit(off as u64)
    } else {
        BaseOffset::Auto
    };

    let opts = MountOptions {
        base_offset,
        superblock_ordinal: cli.superblock.map(|n| n as usize),
        cefs: cli.cefs,
        encoding,
        no_log: cli.no_log,
        partition_block_size: cli.block_size as u64,
    };

    let io: Rc<RefCell<dyn ReadSeek>> = if cli.ecc {
        if cli.cefs {
            bail!("--ecc is not supported together with --cefs");
        }
        let reader = EccReader::open(&cli.in_filename, cli.ecc_args.to_config())
            .with_context(|| format!("opening {} through the ECC layer", cli.in_filename.display()))?;
        Rc::new(RefCell::new(reader))
    } else {
        let file = File::open(&cli.in_filename).with_context(|| format!("opening {}", cli.in_filename.display()))?;
        Rc::new(RefCell::new(BufReader::new(file)))
    };

    let fs = Filesystem::mount(io, &opts).context("mounting filesystem")?;
    info!("mounted at base offset {:#x}", fs.base_offset());

    match cli.out_filename {
        None => shell::run(fs, &cli.in_filename.display().to_string())?,
        Some(out) => zipdump::dump_all(&fs, &out)?,
    }

    Ok(())
}
