//! NAND page manager: the forward/reverse mapping lives in a recursive
//! multi-level node tree (`depth_shift`/`depth_masks` per level), and the
//! log ring is a simple run of pages between `log_head` and the first
//! blank page.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::rc::Rc;

use log::debug;

use crate::error::{Efs2Error, Result};
use crate::log::{parse_log_page, PageLog, TableUpdateEvent, UpdateTableType};
use crate::pm::{PageManager, SharedIo};
use crate::superblock::{Regions, Superblock};
use crate::util::le32;

pub struct NandLog {
    override_ptable_index: HashMap<u32, u32>,
    override_rtable_index: HashMap<u32, u32>,
    override_upper: Vec<u32>,
    override_ptable_level: HashMap<u32, HashMap<u32, u32>>,
    override_rtable_level: HashMap<u32, HashMap<u32, u32>>,
}

impl NandLog {
    /// Scans the log ring described by `sb.log_head` and the
    /// `super_log_{start,end}` regions, replaying every sequence-contiguous
    /// page into the override maps.
    pub fn scan(sb: &Superblock, io: &SharedIo, base_offset: u64, sb_start_page: u32) -> Result<Self> {
        let nand = sb.nand.as_ref().ok_or_else(|| Efs2Error::CorruptStructure("NAND log scan on a NOR superblock".into()))?;

        let log_uppermost = nand.regions[Regions::SuperLogStart as usize] * sb.block_size;
        let log_lowermost = nand.regions[Regions::SuperLogEnd as usize] * sb.block_size;

        let log_start = sb.log_head;
        let mut log_end = log_start;

        let mut fio = io.borrow_mut();
        fio.seek(SeekFrom::Start(base_offset + log_start as u64 * sb.page_size as u64))?;

        let mut page_buf = vec![0u8; sb.page_size as usize];
        loop {
            fio.read_exact(&mut page_buf)?;
            if page_buf.iter().all(|&b| b == 0xff) {
                break;
            }
            log_end += 1;
            if log_end >= log_lowermost {
                fio.seek(SeekFrom::Start(base_offset + log_uppermost as u64 * sb.page_size as u64))?;
                log_end = log_uppermost;
            } else if log_end == sb.log_head {
                return Err(Efs2Error::CorruptStructure("cannot find free log space".into()));
            }
        }

        let log_end_block = log_end >> sb.block_shift;
        let log_end_page = log_end & !sb.block_mask;
        if log_end_block != (sb_start_page >> sb.block_shift) && log_end_page == 1 {
            log_end -= 1;
        }

        debug!("log_start: {:#010x}, log_end: {:#010x}", log_start, log_end);

        let mut result = Self {
            override_ptable_index: HashMap::new(),
            override_rtable_index: HashMap::new(),
            override_upper: sb.upper_data.clone(),
            override_ptable_level: HashMap::new(),
            override_rtable_level: HashMap::new(),
        };

        let mut log_index = log_start;
        let mut prev_log_seq: Option<u32> = None;

        while log_index != log_end {
            if log_index & !sb.block_mask != 0 {
                fio.seek(SeekFrom::Start(base_offset + log_index as u64 * sb.page_size as u64))?;
                fio.read_exact(&mut page_buf)?;

                let log_seq = le32(&page_buf[0..4]);
                if log_seq != 0xffffffff {
                    if let Some(prev) = prev_log_seq {
                        if log_seq != 1 && log_seq.wrapping_sub(1) != prev {
                            return Err(Efs2Error::LogSequenceBroken { expected: prev + 1, got: log_seq });
                        }
                    }
                    prev_log_seq = Some(log_seq);

                    for event in parse_log_page(&page_buf, sb, log_index) {
                        result.apply(event);
                    }
                }
            }

            log_index += 1;
            if log_index >= log_lowermost {
                log_index = log_uppermost;
            }
        }

        Ok(result)
    }

    fn apply(&mut self, event: TableUpdateEvent) {
        match event.kind {
            UpdateTableType::PtableIndex => {
                self.override_ptable_index.insert(event.index, event.value);
            }
            UpdateTableType::RtableIndex => {
                self.override_rtable_index.insert(event.index, event.value);
            }
            UpdateTableType::PtableMeta => {
                self.override_ptable_level.entry(event.level).or_default().insert(event.index, event.value);
            }
            UpdateTableType::RtableMeta => {
                self.override_rtable_level.entry(event.level).or_default().insert(event.index, event.value);
            }
            UpdateTableType::UpperData => {
                if let Some(slot) = self.override_upper.get_mut(event.index as usize) {
                    *slot = event.value;
                }
            }
            UpdateTableType::LogAlloc => {}
        }
    }
}

impl PageLog for NandLog {
    fn upper_data(&self) -> Vec<u32> {
        self.override_upper.clone()
    }

    fn ptable_index(&self, cluster: u32, fallback: i64) -> i64 {
        self.override_ptable_index.get(&cluster).map(|&v| v as i64).unwrap_or(fallback)
    }

    fn rtable_index(&self, page: u32, fallback: i64) -> i64 {
        self.override_rtable_index.get(&page).map(|&v| v as i64).unwrap_or(fallback)
    }

    fn ptable_node(&self, level: u32, index: u32, fallback: i64) -> i64 {
        self.override_ptable_level
            .get(&level)
            .and_then(|m| m.get(&index))
            .map(|&v| v as i64)
            .unwrap_or(fallback)
    }

    fn rtable_node(&self, level: u32, index: u32, fallback: i64) -> i64 {
        self.override_rtable_level
            .get(&level)
            .and_then(|m| m.get(&index))
            .map(|&v| v as i64)
            .unwrap_or(fallback)
    }
}

pub struct NandPageManager {
    sb: Rc<Superblock>,
    io: SharedIo,
    base_offset: u64,
    log: Option<Rc<dyn PageLog>>,
}

impl NandPageManager {
    pub fn new(sb: Rc<Superblock>, io: SharedIo, base_offset: u64) -> Self {
        Self { sb, io, base_offset, log: None }
    }

    pub fn set_log(&mut self, log: Rc<dyn PageLog>) {
        self.log = Some(log);
    }

    fn recurse_nodes(&self, cur_node: u32, depth: u32, nodenum: u32, table_type: u32) -> Result<u32> {
        let nand = self.sb.nand.as_ref().unwrap();
        let node_offset = (nodenum & nand.depth_masks[depth as usize]) >> nand.depth_shift[depth as usize];

        let mut fio = self.io.borrow_mut();
        fio.seek(SeekFrom::Start(
            self.base_offset + self.sb.page_size as u64 * cur_node as u64 + 4 * node_offset as u64,
        ))?;
        let mut buf = [0u8; 4];
        fio.read_exact(&mut buf)?;
        drop(fio);
        let mut node = u32::from_le_bytes(buf);

        if let Some(log) = &self.log {
            let shifted = nodenum >> nand.depth_shift[depth as usize];
            node = if table_type == 0 {
                let v = log.ptable_node(depth, shifted, node as i64);
                v as u32
            } else {
                let v = log.rtable_node(depth, shifted, node as i64);
                v as u32
            };
        }

        if depth > 0 {
            if node >= self.sb.page_total {
                return Ok(node);
            }
            self.recurse_nodes(node, depth - 1, nodenum, table_type)
        } else {
            Ok(node)
        }
    }
}

impl PageManager for NandPageManager {
    fn forward(&self, cluster: u32) -> u32 {
        let nand = self.sb.nand.as_ref().unwrap();

        if let Some(log) = &self.log {
            let ov = log.ptable_index(cluster, -1);
            if ov != -1 {
                return ov as u32;
            }
        }

        if nand.page_depth == 1 {
            let failover = nand.ptables[cluster as usize];
            return match &self.log {
                Some(log) => log.ptable_node(0, cluster, failover as i64) as u32,
                None => failover,
            };
        }

        let pt_start = cluster >> nand.depth_shift[nand.page_depth as usize - 1];
        let failover = nand.ptables[pt_start as usize];
        let start = match &self.log {
            Some(log) => log.ptable_node(nand.page_depth as u32 - 1, pt_start, failover as i64) as u32,
            None => failover,
        };
        self.recurse_nodes(start, nand.page_depth as u32 - 2, cluster, 0).unwrap_or(0xffffffff)
    }

    fn reverse(&self, page: u32) -> u32 {
        let nand = self.sb.nand.as_ref().unwrap();

        if let Some(log) = &self.log {
            let ov = log.rtable_index(page, -1);
            if ov != -1 {
                let mut temp = ov as u32;
                if (temp >> 31) == 0 {
                    temp &= 0xffffff;
                }
                return temp;
            }
        }

        let mut temp = if nand.page_depth == 1 {
            let failover = nand.rtables[page as usize];
            match &self.log {
                Some(log) => log.rtable_node(0, page, failover as i64) as u32,
                None => failover,
            }
        } else {
            let pt_start = page >> nand.depth_shift[nand.page_depth as usize - 1];
            let failover = nand.rtables[pt_start as usize];
            let start = match &self.log {
                Some(log) => log.rtable_node(nand.page_depth as u32 - 1, pt_start, failover as i64) as u32,
                None => failover,
            };
            self.recurse_nodes(start, nand.page_depth as u32 - 2, page, 1).unwrap_or(0xffffffff)
        };

        if (temp >> 31) == 0 {
            temp &= 0xffffff;
        }
        temp
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
