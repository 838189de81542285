//! Directory database: the on-disk B-tree of directory entries, read
//! eagerly at mount time into an in-memory map keyed by parent inode
//! number.

use std::collections::HashMap;
use std::io::Read;
use std::rc::Rc;

use chrono::{DateTime, TimeZone, Utc};

use crate::error::{Efs2Error, Result};
use crate::pm::PageManager;
use crate::util::{actual_version, le16, le32};

#[derive(Debug, Clone)]
pub struct InlineData {
    pub is_long: bool,
    pub mode: u16,
    pub group_id: u16,
    pub created_time: Option<DateTime<Utc>>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct DatabaseItem {
    pub name: Vec<u8>,
    pub parent_inode: u32,
    pub inode_type: u8,
    pub inode: Option<u32>,
    pub inline: Option<InlineData>,
    pub symlink_path: Option<Vec<u8>>,
    pub long_name: Option<Vec<u8>>,
}

struct NodeHeader {
    level: u8,
    data: Vec<u8>,
}

fn read_node<R: Read>(r: &mut R, v2: bool) -> Result<NodeHeader> {
    let mut header = vec![0u8; if v2 { 18 } else { 12 }];
    r.read_exact(&mut header)?;
    let used = if v2 { le16(&header[8..10]) } else { le16(&header[8..10]) };
    let level = if v2 { header[17] } else { header[11] };
    let mut data = vec![0u8; used as usize];
    r.read_exact(&mut data)?;
    Ok(NodeHeader { level, data })
}

/// Parses an upper (interior) node's body: a leading `upper_cluster`
/// pointer followed by a run of `(type, data, next_cluster)` records. Each
/// record's `size` byte covers the 1-byte type tag plus its data.
fn parse_upper_level(data: &[u8]) -> Result<(u32, Vec<u32>)> {
    if data.len() < 4 {
        return Err(Efs2Error::CorruptStructure("db upper node truncated".into()));
    }
    let upper_cluster = le32(&data[0..4]);
    let mut clusters = vec![upper_cluster];

    let mut off = 4usize;
    while off < data.len() {
        if off + 1 > data.len() {
            break;
        }
        let size = data[off] as usize;
        if off + 1 + size + 4 > data.len() {
            break;
        }
        if data[off + 1] != b'd' {
            return Err(Efs2Error::CorruptStructure("db upper node type tag mismatch".into()));
        }
        let next_cluster = le32(&data[off + 1 + size..off + 1 + size + 4]);
        clusters.push(next_cluster);
        off += 1 + size + 4;
    }

    Ok((upper_cluster, clusters))
}

/// Parses a leaf node's body: a run of directory-entry records, each
/// tagged by its single-byte `inode_type` discriminator (`'i'` plain
/// inode, `'n'`/`'N'` short/long inline data, `'s'` symlink, `'L'` an
/// overflow long name).
fn parse_lower_level(data: &[u8]) -> Result<Vec<DatabaseItem>> {
    let mut items = Vec::new();
    let mut off = 0usize;

    while off < data.len() {
        if off + 7 > data.len() {
            break;
        }
        let data_size = data[off] as usize;
        let inode_size = data[off + 1] as usize;
        if data[off + 2] != b'd' {
            return Err(Efs2Error::CorruptStructure("db leaf node type tag mismatch".into()));
        }
        if data_size < 5 {
            return Err(Efs2Error::CorruptStructure("db leaf entry data_size too small".into()));
        }
        let parent_inode = le32(&data[off + 3..off + 7]);
        let name_len = data_size - 5;
        let name_start = off + 7;
        if name_start + name_len + 1 > data.len() {
            break;
        }
        let name = data[name_start..name_start + name_len].to_vec();
        let inode_type = data[name_start + name_len];

        let mut cursor = name_start + name_len + 1;
        let mut inode = None;
        let mut inline = None;
        let mut symlink_path = None;
        let mut long_name = None;

        match inode_type {
            b'i' => {
                if cursor + 4 > data.len() {
                    break;
                }
                inode = Some(le32(&data[cursor..cursor + 4]));
                cursor += 4;
            }
            b'n' => {
                if inode_size < 3 || cursor + (inode_size - 1) > data.len() {
                    break;
                }
                let mode = le16(&data[cursor..cursor + 2]);
                let body = data[cursor + 2..cursor + (inode_size - 1)].to_vec();
                inline = Some(InlineData { is_long: false, mode, group_id: 0, created_time: None, data: body });
                cursor += inode_size - 1;
            }
            b'N' => {
                if inode_size < 9 || cursor + (inode_size - 1) > data.len() {
                    break;
                }
                let mode = le16(&data[cursor..cursor + 2]);
                let gid = le16(&data[cursor + 2..cursor + 4]);
                let ctime = le32(&data[cursor + 4..cursor + 8]);
                let body = data[cursor + 8..cursor + (inode_size - 1)].to_vec();
                let created_time = Utc.timestamp_opt(ctime as i64, 0).single();
                inline = Some(InlineData { is_long: true, mode, group_id: gid, created_time, data: body });
                cursor += inode_size - 1;
            }
            b's' => {
                if inode_size < 1 || cursor + (inode_size - 1) > data.len() {
                    break;
                }
                symlink_path = Some(data[cursor..cursor + (inode_size - 1)].to_vec());
                cursor += inode_size - 1;
            }
            b'L' => {
                if inode_size < 1 || cursor + (inode_size - 1) > data.len() {
                    break;
                }
                long_name = Some(data[cursor..cursor + (inode_size - 1)].to_vec());
                cursor += inode_size - 1;
            }
            _ => {}
        }

        items.push(DatabaseItem { name, parent_inode, inode_type, inode, inline, symlink_path, long_name });
        off = cursor;
    }

    Ok(items)
}

/// The full directory graph, materialized eagerly at mount time into a
/// fresh map keyed by parent inode (never shared across mounts).
pub struct Database {
    nodes: HashMap<u32, Vec<DatabaseItem>>,
    encoding: &'static encoding_rs::Encoding,
}

impl Database {
    pub fn mount(root_cluster: u32, pm: &Rc<dyn PageManager>, encoding: &'static encoding_rs::Encoding) -> Result<Self> {
        let sb_version = actual_version(pm.superblock().version);
        let v2 = sb_version >= 0x24;
        let mut nodes = HashMap::new();
        Self::recurse(root_cluster, pm, v2, &mut nodes)?;
        Ok(Self { nodes, encoding })
    }

    fn recurse(cluster: u32, pm: &Rc<dyn PageManager>, v2: bool, nodes: &mut HashMap<u32, Vec<DatabaseItem>>) -> Result<()> {
        pm.forward_seek(cluster, 0)?;
        let node = {
            let mut io = pm.io().borrow_mut();
            read_node(&mut *io, v2)?
        };

        if node.level > 0 {
            let (_upper_cluster, clusters) = parse_upper_level(&node.data)?;
            for c in clusters {
                Self::recurse(c, pm, v2, nodes)?;
            }
        } else {
            for item in parse_lower_level(&node.data)? {
                nodes.entry(item.parent_inode).or_default().push(item);
            }
        }

        Ok(())
    }

    /// Looks up `name` within `dir`, mapping the synthetic `.`/`..` names
    /// to their empty-name / NUL-name on-disk markers.
    pub fn lookup(&self, dir: u32, name: &str) -> Option<&DatabaseItem> {
        let entries = self.nodes.get(&dir)?;
        entries.iter().find(|n| {
            if name == "." {
                n.name.is_empty()
            } else if name == ".." {
                n.name == [0u8]
            } else {
                let (decoded, _, _) = self.encoding.decode(&n.name);
                decoded == name
            }
        })
    }

    pub fn list(&self, dir: u32) -> &[DatabaseItem] {
        self.nodes.get(&dir).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn set_encoding(&mut self, encoding: &'static encoding_rs::Encoding) {
        self.encoding = encoding;
    }

    pub fn encoding(&self) -> &'static encoding_rs::Encoding {
        self.encoding
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lower_level_plain_inode_entry() {
        let mut data = Vec::new();
        let name = b"foo";
        let data_size = (5 + name.len()) as u8;
        data.push(data_size);
        data.push(5); // inode_size unused for 'i'
        data.push(b'd');
        data.extend_from_slice(&7u32.to_le_bytes());
        data.extend_from_slice(name);
        data.push(b'i');
        data.extend_from_slice(&42u32.to_le_bytes());

        let items = parse_lower_level(&data).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, b"foo");
        assert_eq!(items[0].parent_inode, 7);
        assert_eq!(items[0].inode, Some(42));
    }

    #[test]
    fn parses_symlink_entry() {
        let mut data = Vec::new();
        let name = b"link";
        let target = b"/target";
        let inode_size = (target.len() + 1) as u8;
        let data_size = (5 + name.len()) as u8;
        data.push(data_size);
        data.push(inode_size);
        data.push(b'd');
        data.extend_from_slice(&3u32.to_le_bytes());
        data.extend_from_slice(name);
        data.push(b's');
        data.extend_from_slice(target);

        let items = parse_lower_level(&data).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].symlink_path.as_deref(), Some(&target[..]));
    }

    #[test]
    fn parses_upper_level_chain() {
        let mut data = Vec::new();
        data.extend_from_slice(&100u32.to_le_bytes()); // upper_cluster
        // one record: size=2 (type+1 data byte), data byte, next_cluster
        data.push(2);
        data.push(b'd');
        data.push(0xab);
        data.extend_from_slice(&200u32.to_le_bytes());

        let (upper, clusters) = parse_upper_level(&data).unwrap();
        assert_eq!(upper, 100);
        assert_eq!(clusters, vec![100, 200]);
    }
}
