//! Flash partition table: the fixed magic-prefixed table some devices
//! carry ahead of the raw EFS2/CEFS image, used by `--partition` to
//! resolve a named region's byte offset without the caller having to know
//! it up front.

use std::io::{Read, Seek, SeekFrom};

use crate::error::{Efs2Error, Result};
use crate::superblock;
use crate::util::le32;

pub const PARTITION_MAGIC: [u8; 8] = [0xAA, 0x73, 0xEE, 0x55, 0xDB, 0xBD, 0x5E, 0xE3];

#[derive(Debug, Clone)]
pub struct Partition {
    pub flash_id: u8,
    pub name: String,
    pub start: u64,
    /// `None` means "extends to EOF" (on-disk `block_length == 0xffffffff`).
    pub end: Option<u64>,
    pub length: Option<u64>,
    pub attr: u32,
}

#[derive(Debug, Clone)]
pub struct PartitionTable {
    pub version: u32,
    pub partitions: Vec<Partition>,
}

impl PartitionTable {
    /// Parses a table whose magic starts at `data[0]`; `block_size` scales
    /// the on-disk block-count fields into byte offsets.
    pub fn parse(data: &[u8], block_size: u64) -> Result<Self> {
        if data.len() < 8 || data[0..8] != PARTITION_MAGIC {
            return Err(Efs2Error::CorruptStructure("partition table magic mismatch".into()));
        }
        let version = le32(&data[8..12]);
        let count = le32(&data[12..16]) as usize;

        let mut partitions = Vec::with_capacity(count);
        let mut off = 16usize;
        for _ in 0..count {
            if off + 28 > data.len() {
                return Err(Efs2Error::CorruptStructure("partition table entry truncated".into()));
            }
            let flash_id = data[off];
            // data[off+1] is padding.
            let name_bytes = &data[off + 2..off + 16];
            let nul = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
            let name = String::from_utf8_lossy(&name_bytes[..nul]).into_owned();
            let block_start = le32(&data[off + 16..off + 20]) as u64;
            let block_length = le32(&data[off + 20..off + 24]);
            let attr = le32(&data[off + 24..off + 28]);

            let start = block_start * block_size;
            let (end, length) = if block_length == 0xffffffff {
                (None, None)
            } else {
                let len = block_length as u64 * block_size;
                (Some(start + len), Some(len))
            };

            partitions.push(Partition { flash_id, name, start, end, length, attr });
            off += 28;
        }

        Ok(Self { version, partitions })
    }

    pub fn find(&self, name: &str) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.name == name)
    }
}

/// Scans `reader` block by block for a partition table at one of the
/// fixed candidate offsets (`0x200`, `0x800`, `0x1000` within the block),
/// mirroring `lookup_partition`'s scan loop in the original dumper.
pub fn scan<R: Read + Seek>(reader: &mut R, block_size: u64) -> Result<PartitionTable> {
    let len = reader.seek(SeekFrom::End(0))?;
    reader.seek(SeekFrom::Start(0))?;

    let mut offset = 0u64;
    let mut buf = vec![0u8; block_size as usize];
    const CANDIDATE_OFFSETS: [usize; 3] = [0x200, 0x800, 0x1000];

    while offset + block_size <= len {
        reader.seek(SeekFrom::Start(offset))?;
        reader.read_exact(&mut buf)?;

        for &cand in &CANDIDATE_OFFSETS {
            if cand + 8 <= buf.len() && buf[cand..cand + 8] == PARTITION_MAGIC {
                if let Ok(table) = PartitionTable::parse(&buf[cand..], block_size) {
                    return Ok(table);
                }
            }
        }

        offset += block_size;
    }

    Err(Efs2Error::CorruptStructure("could not find partition table".into()))
}

/// Looks up `name` in the partition table found by scanning `reader`,
/// returning its `(start, end)` byte range. `end` is `None` for a
/// partition with no stored length (extends to EOF or to a
/// filesystem-computed size, e.g. EFS2/EFS2APPS).
pub fn lookup<R: Read + Seek>(reader: &mut R, name: &str, block_size: u64) -> Result<(u64, Option<u64>)> {
    let table = scan(reader, block_size)?;
    let part = table
        .find(name)
        .ok_or_else(|| Efs2Error::CorruptStructure(format!("could not find partition with the name {name}")))?;
    Ok((part.start, part.end))
}

/// Computes the logical size of an EFS2 image embedded in `data` by
/// scanning for its superblock chain and reading `page_total * page_size`
/// off the highest-generation valid candidate. Used to bound
/// auto-length (`block_length == 0xffffffff`) `EFS2`/`EFS2APPS`
/// partitions when splitting a flash dump.
pub fn compute_efs2_size(data: &[u8]) -> Result<u64> {
    let mut cursor = std::io::Cursor::new(data);
    let result = superblock::scan(&mut cursor, 0, None, None)?;
    Ok(result.superblock.page_total as u64 * result.superblock.page_size as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn make_entry(flash_id: u8, name: &str, block_start: u32, block_length: u32, attr: u32) -> Vec<u8> {
        let mut e = vec![flash_id, 0];
        let mut name_bytes = name.as_bytes().to_vec();
        name_bytes.resize(14, 0);
        e.extend_from_slice(&name_bytes);
        e.extend_from_slice(&block_start.to_le_bytes());
        e.extend_from_slice(&block_length.to_le_bytes());
        e.extend_from_slice(&attr.to_le_bytes());
        e
    }

    #[test]
    fn parses_table_with_fixed_length_partition() {
        let mut data = Vec::new();
        data.extend_from_slice(&PARTITION_MAGIC);
        data.extend_from_slice(&1u32.to_le_bytes()); // version
        data.extend_from_slice(&1u32.to_le_bytes()); // count
        data.extend(make_entry(0, "EFS2", 10, 20, 0));

        let table = PartitionTable::parse(&data, 0x1000).unwrap();
        assert_eq!(table.partitions.len(), 1);
        let p = &table.partitions[0];
        assert_eq!(p.name, "EFS2");
        assert_eq!(p.start, 10 * 0x1000);
        assert_eq!(p.length, Some(20 * 0x1000));
    }

    #[test]
    fn auto_length_partition_has_no_end() {
        let mut data = Vec::new();
        data.extend_from_slice(&PARTITION_MAGIC);
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend(make_entry(0, "EFS2APPS", 5, 0xffffffff, 0));

        let table = PartitionTable::parse(&data, 0x1000).unwrap();
        assert_eq!(table.partitions[0].end, None);
        assert_eq!(table.partitions[0].length, None);
    }

    #[test]
    fn scan_finds_table_at_embedded_offset() {
        let mut block = vec![0u8; 0x1000];
        let mut table_bytes = Vec::new();
        table_bytes.extend_from_slice(&PARTITION_MAGIC);
        table_bytes.extend_from_slice(&1u32.to_le_bytes());
        table_bytes.extend_from_slice(&1u32.to_le_bytes());
        table_bytes.extend(make_entry(0, "MODEM", 1, 2, 0));
        block[0x200..0x200 + table_bytes.len()].copy_from_slice(&table_bytes);

        let mut cursor = Cursor::new(block);
        let table = scan(&mut cursor, 0x1000).unwrap();
        assert_eq!(table.find("MODEM").unwrap().start, 0x1000);
    }
}
