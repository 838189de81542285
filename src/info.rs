//! Filesystem info record (`upper_data[FS_INFO]`), carrying the root inode
//! number and inode-allocation bookkeeping.

use crate::error::{Efs2Error, Result};
use crate::util::le32;

pub const FS_INFO_MAGIC: [u8; 4] = [0xa0, 0x3e, 0xb9, 0xa7];

#[derive(Debug, Clone)]
pub struct FsInfo {
    pub version: u32,
    pub inode_top: u32,
    pub inode_next: u32,
    pub inode_free: u32,
    pub root_inode: u32,
    pub partial_delete_inode: u32,
    pub partial_delete_offset: u32,
}

impl FsInfo {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 28 || data[0..4] != FS_INFO_MAGIC {
            return Err(Efs2Error::CorruptStructure("fs_info magic mismatch".into()));
        }
        Ok(Self {
            version: le32(&data[4..]),
            inode_top: le32(&data[8..]),
            inode_next: le32(&data[12..]),
            inode_free: le32(&data[16..]),
            root_inode: le32(&data[20..]),
            partial_delete_inode: le32(&data[24..]),
            partial_delete_offset: if data.len() >= 32 { le32(&data[28..]) } else { 0 },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_magic() {
        let data = vec![0u8; 32];
        assert!(FsInfo::parse(&data).is_err());
    }

    #[test]
    fn parses_root_inode() {
        let mut data = vec![0u8; 32];
        data[0..4].copy_from_slice(&FS_INFO_MAGIC);
        data[20..24].copy_from_slice(&42u32.to_le_bytes());
        let info = FsInfo::parse(&data).unwrap();
        assert_eq!(info.root_inode, 42);
    }
}
