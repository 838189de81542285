//! CEFS: the "gang image" factory-programming variant. A CEFS image has
//! no log journal and keeps its free/used page bookkeeping in a flat
//! bitmap (the "fcache") instead of a page-table tree, so it gets its own
//! superblock-equivalent (`CefsSuperblock`) and its own [`PageManager`]
//! implementation rather than reusing [`crate::superblock::Superblock`]
//! directly.

use std::cell::RefCell;
use std::io::{Read, Seek, SeekFrom};
use std::rc::Rc;

use log::debug;

use crate::error::{Efs2Error, Result};
use crate::pm::{PageManager, SharedIo};
use crate::superblock::Superblock;
use crate::util::{ilog2, le16, le32};

const FACTORY_MAGIC: [u8; 8] = [0x87, 0x67, 0x85, 0x34, 0x59, 0x77, 0x34, 0x92];

/// Parsed CEFS factory header. Carries the subset of superblock-shaped
/// fields a CEFS image needs; wrapped in a [`Superblock`] value (with
/// `is_nand = false`, no NAND/NOR-specific data) so it can be handed to
/// code that expects one, e.g. [`crate::db::Database::mount`].
#[derive(Debug, Clone)]
pub struct CefsSuperblock {
    pub factory_version: u16,
    pub version: u16,
    pub block_size: u32,
    pub page_size: u32,
    pub block_count: u32,
    pub block_length: u64,
    pub page_total: u32,
    pub cefs_page_count: u32,
    pub upper_data: Vec<u32>,
}

impl CefsSuperblock {
    /// Parses either the V2 layout (no leading `page_header` field) or the
    /// V1 layout (4-byte `page_header` prefix), detected by whether the
    /// 8-byte factory magic starts at offset 0 or offset 4.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let off = if data.len() >= 8 && data[0..8] == FACTORY_MAGIC {
            0usize
        } else if data.len() >= 12 && data[4..12] == FACTORY_MAGIC {
            4usize
        } else {
            return Err(Efs2Error::CorruptStructure("CEFS factory magic mismatch".into()));
        };

        let mut o = off + 8;
        let factory_version = le16(&data[o..]);
        o += 2;
        let version = le16(&data[o..]);
        o += 2;
        let block_size = le32(&data[o..]);
        o += 4;
        let page_size = le32(&data[o..]);
        o += 4;
        let block_count = le32(&data[o..]);
        o += 4;
        let cefs_page_count = le32(&data[o..]);
        o += 4;

        let upper_count = if (version & 0xff) >= 0x24 { 32 } else { 7 };
        let mut upper_data = Vec::with_capacity(upper_count);
        for i in 0..upper_count {
            upper_data.push(le32(&data[o + i * 4..]));
        }

        let block_length = block_size as u64 * page_size as u64;
        let page_total = block_size.wrapping_mul(block_count);

        Ok(Self {
            factory_version,
            version,
            block_size,
            page_size,
            block_count,
            block_length,
            page_total,
            cefs_page_count,
            upper_data,
        })
    }

    /// Wraps this factory header in a [`Superblock`] value so it can flow
    /// through the same `Database`/`Inode` code NAND/NOR images use.
    pub fn as_superblock(&self) -> Superblock {
        let block_shift = ilog2(self.block_size);
        Superblock {
            version: self.version,
            age: 0,
            checksum: 0,
            computed_checksum: 0,
            block_size: self.block_size,
            page_size: self.page_size,
            block_count: self.block_count,
            block_length: self.block_length as u32,
            page_total: self.page_total,
            is_nand: false,
            block_shift,
            block_mask: !((1u32 << block_shift) - 1),
            log_head: 0,
            upper_data: self.upper_data.clone(),
            nand: None,
            nor_writing_style: None,
        }
    }
}

/// The CEFS page manager: `cluster -> page` is recovered by sweeping the
/// fcache bitmap once and assigning ascending page numbers to free-bit
/// runs. There is no reverse direction used by readers, so `reverse` is
/// only ever consulted by [`Self::compute_ptables`] itself.
pub struct CefsPageManager {
    sb: Rc<Superblock>,
    cefs_page_count: u32,
    factory_version: u16,
    io: SharedIo,
    base_offset: u64,
    fcache: Vec<u8>,
    ptables: RefCell<Vec<u32>>,
    rtables: RefCell<Vec<u32>>,
}

impl CefsPageManager {
    /// Reads the fcache bitmap (immediately following the factory header,
    /// one page in) and sizes the forward/reverse tables.
    pub fn new(factory: &CefsSuperblock, sb: Rc<Superblock>, io: SharedIo, base_offset: u64) -> Result<Self> {
        let mut fcache = vec![0u8; 0x100000];
        {
            let mut fio = io.borrow_mut();
            fio.seek(SeekFrom::Start(base_offset + factory.page_size as u64))?;
            fio.read_exact(&mut fcache)?;
        }

        let n = factory.cefs_page_count as usize;
        Ok(Self {
            sb,
            cefs_page_count: factory.cefs_page_count,
            factory_version: factory.factory_version,
            io,
            base_offset,
            fcache,
            ptables: RefCell::new(vec![0xffffffffu32; n]),
            rtables: RefCell::new(vec![0xffffffffu32; n]),
        })
    }

    /// `1` means free for factory version >= 3, inverted (`0` means free)
    /// for earlier factory versions.
    fn fcache_free(&self, cluster: u32) -> bool {
        let fc_offset = (cluster >> 3) as usize;
        let fc_bit = cluster & 7;
        let byte = self.fcache[fc_offset];
        if self.factory_version >= 3 {
            byte & (1 << fc_bit) != 0
        } else {
            byte & (1 << (7 - fc_bit)) == 0
        }
    }

    /// Sweeps the fcache once, in cluster order, assigning each used
    /// cluster the next sequential flash page starting just past the
    /// factory header/fcache region (offset by `fs_page_start` for
    /// factory versions before 3, which reserve that space up front).
    pub fn compute_ptables(&self) -> Result<()> {
        let page_size = self.sb.page_size as u64;
        let mut cluster = 0u32;
        let mut page = self.base_offset / page_size;

        let fs_page_start = (((page_size << 3) + self.cefs_page_count as u64 - 1) / (page_size << 3)) + 1;

        let mut ptables = self.ptables.borrow_mut();
        let mut rtables = self.rtables.borrow_mut();

        while cluster < self.cefs_page_count {
            while cluster < self.cefs_page_count && self.fcache_free(cluster) {
                cluster += 1;
            }
            if cluster < self.cefs_page_count {
                let assigned = if self.factory_version >= 3 { page } else { page + fs_page_start };
                ptables[cluster as usize] = assigned as u32;
                rtables[assigned as usize] = cluster;
                cluster += 1;
                page += 1;
            }
        }

        debug!("CEFS ptables computed: {} clusters mapped", self.cefs_page_count);
        Ok(())
    }
}

impl PageManager for CefsPageManager {
    fn forward(&self, cluster: u32) -> u32 {
        self.ptables.borrow()[cluster as usize]
    }

    fn reverse(&self, page: u32) -> u32 {
        self.rtables.borrow()[page as usize]
    }

    fn superblock(&self) -> &Superblock {
        &self.sb
    }

    fn io(&self) -> &SharedIo {
        &self.io
    }

    fn base_offset(&self) -> u64 {
        self.base_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_v2_factory(fact_version: u16, version: u16, block_size: u32, page_size: u32, block_count: u32, cefs_page_count: u32) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&FACTORY_MAGIC);
        data.extend_from_slice(&fact_version.to_le_bytes());
        data.extend_from_slice(&version.to_le_bytes());
        data.extend_from_slice(&block_size.to_le_bytes());
        data.extend_from_slice(&page_size.to_le_bytes());
        data.extend_from_slice(&block_count.to_le_bytes());
        data.extend_from_slice(&cefs_page_count.to_le_bytes());
        let upper_count = if (version & 0xff) >= 0x24 { 32 } else { 7 };
        for i in 0..upper_count {
            data.extend_from_slice(&(i as u32).to_le_bytes());
        }
        data
    }

    #[test]
    fn parses_v2_factory_header() {
        let data = make_v2_factory(3, 0x12, 0x10, 0x200, 0x40, 0x400);
        let sb = CefsSuperblock::parse(&data).unwrap();
        assert_eq!(sb.factory_version, 3);
        assert_eq!(sb.page_size, 0x200);
        assert_eq!(sb.cefs_page_count, 0x400);
        assert_eq!(sb.upper_data.len(), 7);
    }

    #[test]
    fn parses_v1_factory_header_with_page_header_prefix() {
        let mut data = vec![0xaa, 0xbb, 0xcc, 0xdd];
        data.extend(make_v2_factory(2, 0x30, 0x10, 0x200, 0x40, 0x400));
        let sb = CefsSuperblock::parse(&data).unwrap();
        assert_eq!(sb.factory_version, 2);
        assert_eq!(sb.upper_data.len(), 32);
    }

    #[test]
    fn fcache_bit_polarity_flips_before_factory_version_3() {
        let factory = CefsSuperblock {
            factory_version: 2,
            version: 0x12,
            block_size: 0x10,
            page_size: 0x200,
            block_count: 0x40,
            block_length: 0x2000,
            page_total: 0x400,
            cefs_page_count: 16,
            upper_data: vec![0; 7],
        };
        let sb = Rc::new(factory.as_superblock());
        let io: SharedIo = Rc::new(RefCell::new(std::io::Cursor::new(vec![0u8; 0x100000 + 0x200])));
        let pm = CefsPageManager::new(&factory, sb, io, 0).unwrap();
        // all-zero fcache: factory_version < 3 means 0 means free.
        assert!(pm.fcache_free(0));
    }
}
