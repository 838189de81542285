//! Standalone ECC-correction pass: reads a raw NAND dump through the ECC
//! layer and writes out the corrected, de-interleaved data.

use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use efs2::cli::EccArgs;
use efs2::ecc::EccReader;

/// Corrects ECC in a raw NAND dump and writes the plain data out.
#[derive(Debug, Parser)]
#[command(name = "fixdump")]
struct Cli {
    in_filename: PathBuf,
    out_filename: PathBuf,

    #[command(flatten)]
    ecc: EccArgs,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut reader =
        EccReader::open(&cli.in_filename, cli.ecc.to_config()).with_context(|| format!("opening {}", cli.in_filename.display()))?;
    let mut out = File::create(&cli.out_filename).with_context(|| format!("creating {}", cli.out_filename.display()))?;

    let mut buf = [0u8; 0x200];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
    }

    Ok(())
}
