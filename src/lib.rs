//! Read-only reverse-engineering toolkit for Qualcomm's EFS2 flash filesystem.

pub mod error;
pub mod util;

pub mod ecc;
pub mod superblock;
pub mod log;
pub mod pm;
pub mod info;
pub mod db;
pub mod inode;
pub mod cefs;
pub mod partition;
pub mod fs;

pub mod cli;

pub use error::{Efs2Error, Result};
pub use fs::Filesystem;
