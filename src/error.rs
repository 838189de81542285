use thiserror::Error;

/// Error kinds surfaced by the core read-only EFS2/CEFS pipeline.
#[derive(Debug, Error)]
pub enum Efs2Error {
    #[error("no valid EFS2 superblock found")]
    NoSuperblock,

    #[error("corrupt structure: {0}")]
    CorruptStructure(String),

    #[error("ECC uncorrectable error at offset {offset:#x}")]
    EccUncorrectable { offset: u64 },

    #[error("log sequence broken: expected {expected}, got {got}")]
    LogSequenceBroken { expected: u32, got: u32 },

    #[error("duplicate page mapping for page {page:#x}")]
    DuplicatePage { page: u32 },

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("bad argument: {0}")]
    BadArgument(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Efs2Error>;
