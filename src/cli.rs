//! Shared command-line plumbing: the `--ecc-*` flag group and the
//! `int-or-hex` argument parser used by every binary in this crate.

use clap::{Args, ValueEnum};

use crate::ecc::{EccAlgo, EccConfig, SpareType};

/// Parses `arg` as a decimal integer, falling back to hex (accepting an
/// optional `0x` prefix) — mirrors the original dumper's `intorhex` helper.
pub fn intorhex(arg: &str) -> Result<u32, String> {
    if let Ok(n) = arg.parse::<u32>() {
        return Ok(n);
    }
    let trimmed = arg.strip_prefix("0x").or_else(|| arg.strip_prefix("0X")).unwrap_or(arg);
    u32::from_str_radix(trimmed, 16).map_err(|e| format!("invalid integer {arg:?}: {e}"))
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SpareTypeArg {
    Riff,
    Standard,
    Qcom,
    Seperate,
}

impl From<SpareTypeArg> for SpareType {
    fn from(a: SpareTypeArg) -> Self {
        match a {
            SpareTypeArg::Riff => SpareType::Riff,
            SpareTypeArg::Standard => SpareType::Standard,
            SpareTypeArg::Qcom => SpareType::QcomStd,
            SpareTypeArg::Seperate => SpareType::Separate,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum EccAlgoArg {
    Rs,
    Hamming20,
    Hamming20Bitpack,
}

impl From<EccAlgoArg> for EccAlgo {
    fn from(a: EccAlgoArg) -> Self {
        match a {
            EccAlgoArg::Rs => EccAlgo::Rs,
            EccAlgoArg::Hamming20 => EccAlgo::Hamming20,
            EccAlgoArg::Hamming20Bitpack => EccAlgo::Hamming20Bitpack,
        }
    }
}

/// The `--ecc-*` flag group, shared between `efs2dump` and `fixdump`.
#[derive(Debug, Clone, Args)]
pub struct EccArgs {
    /// Offset to spare (RIFF) or page size (standard) when using ECC.
    #[arg(short = 's', long = "ecc-spare-offset", value_parser = intorhex, default_value = "0")]
    pub spare_offset: u32,

    #[arg(short = 't', long = "ecc-spare-type", value_enum, default_value = "riff")]
    pub spare_type: SpareTypeArg,

    /// Path to a separately-dumped spare (OOB) file, required for `seperate`.
    #[arg(long = "ecc-spare-path")]
    pub spare_path: Option<std::path::PathBuf>,

    /// Bad blocks offset (ineffective on QCOM nandc mode).
    #[arg(short = 'b', long = "ecc-bbm", value_parser = intorhex, default_value = "5")]
    pub bbm: u32,

    #[arg(short = 'w', long = "ecc-width", default_value = "16")]
    pub width: u32,

    #[arg(short = 'a', long = "ecc-algo", value_enum, default_value = "rs")]
    pub algo: EccAlgoArg,
}

impl EccArgs {
    pub fn to_config(&self) -> EccConfig {
        EccConfig {
            spare_offset_or_page_size: self.spare_offset,
            spare_type: self.spare_type.into(),
            separate_spare_path: self.spare_path.clone(),
            bbm: self.bbm,
            page_width: self.width,
            algo: self.algo.into(),
        }
    }
}
