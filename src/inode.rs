//! Inode parsing and the flattened cluster list backing file reads.
//!
//! EFS2 shipped three on-disk inode layouts across firmware generations;
//! [`InodeLayout::classify`] picks the right one from the superblock
//! version the same way `original_source/efs2/inode.py` does, including
//! the Sanyo Katana (wide 32-bit fields) and Sanyo A5522SA (legacy layout
//! despite a modern version number) vendor quirks.

use std::io::{Read, Result as IoResult, Seek, SeekFrom};
use std::rc::Rc;

use chrono::{DateTime, TimeZone, Utc};

use crate::db::{DatabaseItem, InlineData};
use crate::error::{Efs2Error, Result};
use crate::pm::PageManager;
use crate::util::{actual_version, ilog2, le16, le32};

pub const S_IFMT: u32 = 0o170000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFDIR: u32 = 0o040000;

pub fn is_reg(mode: u32) -> bool {
    mode & S_IFMT == S_IFREG
}

pub fn is_dir(mode: u32) -> bool {
    mode & S_IFMT == S_IFDIR
}

pub fn is_symlink(mode: u32) -> bool {
    mode & S_IFMT == S_IFLNK
}

/// Which wire layout an inode's fixed-size record follows. Chosen once per
/// mounted filesystem from the superblock version, never per-inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeLayout {
    /// `EFS2_INODE_V1`: 16-bit mode/nlink, no uid/gid/atime, 6 direct + 3
    /// indirect cluster slots. 0x3c (60) bytes.
    Legacy,
    /// `EFS2_INODE_V2`: 32-bit mode/nlink/attr, full uid/gid/atime, 13
    /// direct + 3 indirect cluster slots. 0x80 (128) bytes.
    ModernV2,
    /// `EFS2_INODE_V2_32BIT`: same field layout as `ModernV2` but widened
    /// by 4 bytes (Sanyo Katana's 32-bit inode variant).
    ModernV2Wide,
}

impl InodeLayout {
    pub fn classify(version: u16) -> Self {
        let v = actual_version(version);
        let vendor = version >> 8;
        if v == 0xe || v == 0xf {
            return if vendor & 4 != 0 {
                InodeLayout::ModernV2Wide
            } else if vendor & 0x10 != 0 {
                InodeLayout::Legacy
            } else {
                InodeLayout::ModernV2
            };
        }
        if v >= 0x24 {
            InodeLayout::ModernV2
        } else {
            InodeLayout::Legacy
        }
    }

    pub fn size(self) -> u32 {
        match self {
            InodeLayout::Legacy => 0x3c,
            InodeLayout::ModernV2 => 0x80,
            InodeLayout::ModernV2Wide => 0x84,
        }
    }

    fn has_uid_gid_atime(self, version: u16) -> bool {
        let v = actual_version(version);
        let vendor = version >> 8;
        v >= 0x24 || (matches!(v, 0xe | 0xf) && vendor & 0x10 == 0)
    }
}

/// A parsed inode, regardless of whether it came from the on-disk fixed
/// record (`Entry::Inode`) or an inline short/long directory record
/// (`Entry::Inline`).
#[derive(Debug, Clone)]
pub struct Inode {
    pub name: String,
    pub id: Option<u32>,
    pub mode: u32,
    pub file_size: u64,
    pub generation: u32,
    pub blocks: u32,
    pub modified_time: Option<DateTime<Utc>>,
    pub created_time: Option<DateTime<Utc>>,
    pub accessed_time: Option<DateTime<Utc>>,
    pub user_id: u32,
    pub group_id: u32,
    pub direct_clusters: Vec<u32>,
    pub indirect_clusters: Vec<u32>,
    /// Present only for `Entry::Inline` inodes: the literal file body
    /// stored alongside the directory entry instead of in its own cluster.
    pub inline_data: Option<Vec<u8>>,
}

fn read_u32_field(buf: &[u8], off: usize, wide: bool) -> (u32, usize) {
    if wide {
        (le32(&buf[off..]), off + 4)
    } else {
        (le16(&buf[off..]) as u32, off + 2)
    }
}

/// Parses one fixed-size on-disk inode record out of `buf` (already
/// positioned at the record's start) per `layout`.
fn parse_inode_record(buf: &[u8], layout: InodeLayout, version: u16) -> Result<(u32, u32, u32, u32, u32, u32, u32, u32, u32, u32, u32, Vec<u32>, Vec<u32>)> {
    // Returns (mode, nlink, attr, size, uid, gid, generation, blocks, mtime, ctime, atime, direct, indirect)
    match layout {
        InodeLayout::Legacy => {
            if buf.len() < 0x3c {
                return Err(Efs2Error::CorruptStructure("inode record truncated (legacy)".into()));
            }
            let mode = le16(&buf[0..2]) as u32;
            let nlink = le16(&buf[2..4]) as u32;
            let size = le32(&buf[4..8]);
            let generation = le32(&buf[8..12]);
            let blocks = le32(&buf[12..16]);
            let mtime = le32(&buf[16..20]);
            let ctime = le32(&buf[20..24]);
            let mut direct = Vec::with_capacity(6);
            for i in 0..6 {
                direct.push(le32(&buf[24 + i * 4..]));
            }
            let mut indirect = Vec::with_capacity(3);
            for i in 0..3 {
                indirect.push(le32(&buf[48 + i * 4..]));
            }
            Ok((mode, nlink, 0, size, 0, 0, generation, blocks, mtime, ctime, 0, direct, indirect))
        }
        InodeLayout::ModernV2 | InodeLayout::ModernV2Wide => {
            let wide = layout == InodeLayout::ModernV2Wide;
            let min_len = if wide { 0x84 } else { 0x80 };
            if buf.len() < min_len {
                return Err(Efs2Error::CorruptStructure("inode record truncated (v2)".into()));
            }
            let (mode, off) = read_u32_field(buf, 0, wide);
            let (nlink, off) = read_u32_field(buf, off, wide);
            let attr = le32(&buf[off..]);
            let off = off + 4;
            let size = le32(&buf[off..]);
            let off = off + 4;
            let uid = le16(&buf[off..]) as u32;
            let off = off + 2;
            let gid = le16(&buf[off..]) as u32;
            let off = off + 2;
            let generation = le32(&buf[off..]);
            let off = off + 4;
            let blocks = le32(&buf[off..]);
            let off = off + 4;
            let mtime = le32(&buf[off..]);
            let off = off + 4;
            let ctime = le32(&buf[off..]);
            let off = off + 4;
            let atime = le32(&buf[off..]);
            let off = off + 4;
            let off = off + 7 * 4; // reserved
            let mut direct = Vec::with_capacity(13);
            let mut o = off;
            for _ in 0..13 {
                direct.push(le32(&buf[o..]));
                o += 4;
            }
            let mut indirect = Vec::with_capacity(3);
            for _ in 0..3 {
                indirect.push(le32(&buf[o..]));
                o += 4;
            }
            let _ = version;
            Ok((mode, nlink, attr, size, uid, gid, generation, blocks, mtime, ctime, atime, direct, indirect))
        }
    }
}

fn timestamp(t: u32) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(t as i64, 0).single()
}

impl Inode {
    /// Reads and classifies the fixed-size inode record named by
    /// `item.inode`, locating it via the same page/index bitmask scheme as
    /// `original_source/efs2/inode.py`.
    pub fn read(item: &DatabaseItem, pm: &Rc<dyn PageManager>, encoding: &'static encoding_rs::Encoding) -> Result<Self> {
        let inode_num = item.inode.ok_or_else(|| Efs2Error::CorruptStructure("directory entry is not an inode".into()))?;
        let version = pm.superblock().version;
        let layout = InodeLayout::classify(version);
        let inode_size = layout.size();

        let inode_bits = ilog2(pm.superblock().page_size / inode_size);
        let inode_mask = (1u32 << inode_bits) - 1;

        let inode_page = inode_num >> inode_bits;
        let inode_index = inode_num & inode_mask;

        pm.forward_seek(inode_page, inode_index as u64 * inode_size as u64)?;
        let mut buf = vec![0u8; inode_size as usize];
        {
            let mut io = pm.io().borrow_mut();
            io.read_exact(&mut buf)?;
        }

        let (mode, _nlink, _attr, size, uid, gid, generation, blocks, mtime, ctime, atime, direct, indirect) =
            parse_inode_record(&buf, layout, version)?;

        let name = if item.name.is_empty() {
            ".".to_string()
        } else if item.name == [0u8] {
            "..".to_string()
        } else {
            let (decoded, _, _) = encoding.decode(&item.name);
            decoded.into_owned()
        };

        let has_uid_gid_atime = layout.has_uid_gid_atime(version);

        Ok(Inode {
            name,
            id: Some(inode_num),
            mode,
            file_size: size as u64,
            generation,
            blocks,
            modified_time: timestamp(mtime),
            created_time: timestamp(ctime),
            accessed_time: if has_uid_gid_atime { timestamp(atime) } else { timestamp(0) },
            user_id: if has_uid_gid_atime { uid } else { 0 },
            group_id: if has_uid_gid_atime { gid } else { 0 },
            direct_clusters: direct,
            indirect_clusters: indirect,
            inline_data: None,
        })
    }

    /// Builds the synthetic inode for a directory entry's inline data
    /// record (`'n'`/`'N'` entries never have a separate on-disk inode).
    /// Short (`'n'`) entries carry no creation time on disk, so it
    /// defaults to the Unix epoch like the original's `datetime.fromtimestamp(0)`.
    pub fn from_inline(name: String, inline: &InlineData) -> Self {
        let created = inline.created_time.or_else(|| timestamp(0));
        Inode {
            name,
            id: None,
            mode: S_IFREG | inline.mode as u32,
            file_size: inline.data.len() as u64,
            generation: 1,
            blocks: 1,
            modified_time: created,
            created_time: created,
            accessed_time: created,
            user_id: 0,
            group_id: inline.group_id as u32,
            direct_clusters: Vec::new(),
            indirect_clusters: Vec::new(),
            inline_data: Some(inline.data.clone()),
        }
    }

    /// Builds the synthetic inode for a symlink directory entry (`'s'`),
    /// which like inline data has no separate on-disk inode: its "file
    /// contents" are the literal target path bytes.
    pub fn symlink(name: String, target: Vec<u8>) -> Self {
        Inode {
            name,
            id: None,
            mode: S_IFLNK | 0o777,
            file_size: target.len() as u64,
            generation: 1,
            blocks: 1,
            modified_time: timestamp(0),
            created_time: timestamp(0),
            accessed_time: timestamp(0),
            user_id: 0,
            group_id: 0,
            direct_clusters: Vec::new(),
            indirect_clusters: Vec::new(),
            inline_data: Some(target),
        }
    }
}

/// Recursively flattens one indirect-block subtree into a run of direct
/// page clusters, stopping at the first `0xffffffff` terminator entry in
/// any table read along the way.
fn flatten_indirect(pm: &Rc<dyn PageManager>, depth: u32, cluster: u32, table_count: usize) -> Result<Vec<u32>> {
    pm.forward_seek(cluster, 0)?;
    let mut table = Vec::with_capacity(table_count);
    {
        let mut io = pm.io().borrow_mut();
        let mut raw = vec![0u8; 4];
        for _ in 0..table_count {
            io.read_exact(&mut raw)?;
            table.push(le32(&raw));
        }
    }

    if depth == 0 {
        return Ok(table);
    }

    let mut out = Vec::new();
    for c in table {
        if c == 0xffffffff {
            break;
        }
        out.extend(flatten_indirect(pm, depth - 1, c, table_count)?);
    }
    Ok(out)
}

/// A `Read + Seek` view over a regular file's flattened cluster list, or
/// over an inline file's literal byte buffer.
pub struct InodeReader {
    pm: Rc<dyn PageManager>,
    clusters: Vec<u32>,
    inline: Option<Vec<u8>>,
    file_size: u64,
    offset: u64,
    page_size: u64,
}

impl InodeReader {
    pub fn new(inode: &Inode, pm: Rc<dyn PageManager>) -> Result<Self> {
        if !is_reg(inode.mode) && inode.inline_data.is_none() {
            return Err(Efs2Error::CorruptStructure("not a regular file".into()));
        }

        if let Some(data) = &inode.inline_data {
            return Ok(Self {
                pm,
                clusters: Vec::new(),
                inline: Some(data.clone()),
                file_size: data.len() as u64,
                offset: 0,
                page_size: 1,
            });
        }

        let page_size = pm.superblock().page_size as u64;
        let table_count = pm.superblock().page_size as usize / 4;

        let mut clusters = inode.direct_clusters.clone();
        for (depth, &cluster) in inode.indirect_clusters.iter().enumerate() {
            if cluster == 0xffffffff {
                break;
            }
            clusters.extend(flatten_indirect(&pm, depth as u32, cluster, table_count)?);
        }

        Ok(Self {
            pm,
            clusters,
            inline: None,
            file_size: inode.file_size,
            offset: 0,
            page_size,
        })
    }
}

impl Read for InodeReader {
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        if self.offset >= self.file_size || buf.is_empty() {
            return Ok(0);
        }

        if let Some(data) = &self.inline {
            let remaining = (self.file_size - self.offset) as usize;
            let n = remaining.min(buf.len());
            let start = self.offset as usize;
            buf[..n].copy_from_slice(&data[start..start + n]);
            self.offset += n as u64;
            return Ok(n);
        }

        let mut total = 0usize;
        let mut want = buf.len().min((self.file_size - self.offset) as usize);

        while want > 0 {
            let page_idx = (self.offset / self.page_size) as usize;
            let cluster = *self.clusters.get(page_idx).ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "inode cluster table exhausted")
            })?;

            self.pm
                .forward_seek(cluster, 0)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

            let in_page = self.page_size - (self.offset % self.page_size);
            let chunk = (in_page as usize).min(want);

            {
                let mut io = self.pm.io().borrow_mut();
                io.read_exact(&mut buf[total..total + chunk])?;
            }

            total += chunk;
            self.offset += chunk as u64;
            want -= chunk;
        }

        Ok(total)
    }
}

impl Seek for InodeReader {
    /// Fixed relative to the original's `SEEK_SET`/`SEEK_CUR` bug (which
    /// left the offset unchanged and doubled it, respectively): this
    /// implements the semantics `std::io::Seek` actually specifies.
    fn seek(&mut self, pos: SeekFrom) -> IoResult<u64> {
        let new_offset = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::Current(n) => self.offset as i64 + n,
            SeekFrom::End(n) => self.file_size as i64 + n,
        };
        if new_offset < 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "negative seek offset"));
        }
        self.offset = new_offset as u64;
        Ok(self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_legacy_below_0x24() {
        assert_eq!(InodeLayout::classify(0x10), InodeLayout::Legacy);
        assert_eq!(InodeLayout::size(InodeLayout::Legacy), 0x3c);
    }

    #[test]
    fn classifies_modern_v2_at_and_above_0x24() {
        assert_eq!(InodeLayout::classify(0x24), InodeLayout::ModernV2);
        assert_eq!(InodeLayout::classify(0x30), InodeLayout::ModernV2);
    }

    #[test]
    fn classifies_sanyo_katana_wide() {
        // vendor nibble 0x04 set, actual_version 0xe -> wide 32-bit inode.
        let version = (0x04 << 8) | 0x0e;
        assert_eq!(InodeLayout::classify(version), InodeLayout::ModernV2Wide);
        assert_eq!(InodeLayout::size(InodeLayout::ModernV2Wide), 0x84);
    }

    #[test]
    fn classifies_sanyo_a5522sa_as_legacy_despite_modern_version() {
        let version = (0x10 << 8) | 0x0f;
        assert_eq!(InodeLayout::classify(version), InodeLayout::Legacy);
    }

    #[test]
    fn mode_helpers_match_posix_bits() {
        assert!(is_reg(S_IFREG | 0o644));
        assert!(is_dir(S_IFDIR | 0o755));
        assert!(is_symlink(S_IFLNK | 0o777));
        assert!(!is_reg(S_IFDIR | 0o755));
    }

    #[test]
    fn seek_end_matches_stdlib_semantics() {
        // Exercise just the arithmetic `InodeReader::seek` performs, without
        // constructing a full PageManager.
        let file_size: i64 = 100;
        let offset = 10i64;
        let n = -5i64; // SeekFrom::End(-5)
        assert_eq!(file_size + n, 95);
        let _ = offset;
    }
}
