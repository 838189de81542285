//! NOR page manager: each page carries its own reverse pointer (cluster
//! number) in a reserved trailing region of its block, recovered via a
//! fixed header-check pattern. The log ring is scattered rather than
//! contiguous, so it is found by scanning every page whose reverse
//! pointer marks it as log-allocated (`0xfffffff8`) and chaining them in
//! sequence-number order.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::rc::Rc;

use log::{debug, warn};

use crate::error::Result;
use crate::log::{parse_log_page, verify_log_page, PageLog, UpdateTableType};
use crate::pm::{PageManager, SharedIo};
use crate::superblock::Superblock;
use crate::util::le32;

const LOG_ALLOCATED: u32 = 0xfffffff8;
const GARBAGE: u32 = 0xfffffff4;
const FREE: u32 = 0xfffffff1;
const RESERVED: u32 = 0xfffffff9;

pub struct NorLog {
    override_rtable_index: RefCell<HashMap<u32, u32>>,
    override_upper: RefCell<Vec<u32>>,
}

impl NorLog {
    /// Runs the two-phase scan (collect candidate log pages by reverse
    /// pointer, then replay them starting at `sb.log_head`) and keeps
    /// rescanning while replay discovers log pages the first pass missed.
    pub fn scan(sb: &Superblock, io: &SharedIo, base_offset: u64, pm: &dyn PageManager) -> Result<Self> {
        let log = Self {
            override_rtable_index: RefCell::new(HashMap::new()),
            override_upper: RefCell::new(sb.upper_data.clone()),
        };

        loop {
            if !log.do_scan(sb, io, base_offset, pm)? {
                break;
            }
        }

        Ok(log)
    }

    fn do_scan(&self, sb: &Superblock, io: &SharedIo, base_offset: u64, pm: &dyn PageManager) -> Result<bool> {
        let mut fio = io.borrow_mut();
        let page_size = sb.page_size as usize;
        let mut buf = vec![0u8; page_size];

        fio.seek(SeekFrom::Start(base_offset + sb.log_head as u64 * sb.page_size as u64))?;
        fio.read_exact(&mut buf)?;

        let (start, mut end, no_log) = if verify_log_page(&buf) {
            let s = le32(&buf[0..4]);
            (s, s, false)
        } else {
            (0u32, 0u32, true)
        };

        let mut log_pages = Vec::new();
        for page in 0..sb.page_total {
            let state = {
                let ov = self.override_rtable_index.borrow().get(&page).copied();
                ov.unwrap_or_else(|| pm.reverse(page))
            };
            if state == LOG_ALLOCATED {
                fio.seek(SeekFrom::Start(base_offset + page as u64 * sb.page_size as u64))?;
                fio.read_exact(&mut buf)?;

                let valid = verify_log_page(&buf);
                let blank = buf.iter().all(|&b| b == 0xff);
                let seq = le32(&buf[0..4]);

                let log_to_use = blank || (!no_log && seq >= start && valid);
                if log_to_use {
                    log_pages.push(page);
                }
                if valid && seq != 0xffffffff && seq >= end {
                    end = seq;
                }
            }
        }
        let found = log_pages.iter().position(|&p| p == sb.log_head);
        let Some(found_idx) = found else {
            warn!("log scan found no entry for log_head {:#x}", sb.log_head);
            return Ok(false);
        };

        let mut cur = found_idx;
        let stop = found_idx;
        let mut prev_log_seq: Option<u32> = None;
        let mut reload = false;

        loop {
            fio.seek(SeekFrom::Start(base_offset + log_pages[cur] as u64 * sb.page_size as u64))?;
            fio.read_exact(&mut buf)?;

            let log_seq = le32(&buf[0..4]);
            if log_seq != 0xffffffff {
                let broken = match prev_log_seq {
                    None => false,
                    Some(prev) => log_seq != 1 && log_seq.wrapping_sub(1) != prev,
                };
                if broken {
                    debug!("NOR log sequence broken at page {:#x}", log_pages[cur]);
                }
                prev_log_seq = Some(log_seq);

                if verify_log_page(&buf) {
                    let check_header = le32(&buf[4..8]);
                    for f in parse_log_page(&buf, sb, log_pages[cur]) {
                        match f.kind {
                            UpdateTableType::RtableIndex if check_header == 0xffffffff => {
                                self.override_rtable_index.borrow_mut().insert(f.index, f.value);
                            }
                            UpdateTableType::UpperData => {
                                if let Some(slot) = self.override_upper.borrow_mut().get_mut(f.index as usize) {
                                    *slot = f.value;
                                }
                            }
                            UpdateTableType::LogAlloc => {
                                let state = {
                                    let ov = self.override_rtable_index.borrow().get(&f.index).copied();
                                    ov.unwrap_or_else(|| pm.reverse(f.index))
                                };
                                if state != LOG_ALLOCATED && state != GARBAGE {
                                    if log_pages.iter().any(|&p| p == f.index) {
                                        reload = true;
                                        self.override_rtable_index.borrow_mut().insert(f.index, LOG_ALLOCATED);
                                    } else {
                                        fio.seek(SeekFrom::Start(base_offset + f.index as u64 * sb.page_size as u64))?;
                                        let mut check = vec![0u8; page_size];
                                        fio.read_exact(&mut check)?;
                                        let val = if check.iter().all(|&b| b == 0xff) { LOG_ALLOCATED } else { GARBAGE };
                                        self.override_rtable_index.borrow_mut().insert(f.index, val);
                                    }
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }

            cur += 1;
            if cur == log_pages.len() {
                cur = 0;
            }
            if cur == stop {
                break;
            }
        }

        Ok(reload)
    }
}

impl PageLog for NorLog {
    fn upper_data(&self) -> Vec<u32> {
        self.override_upper.borrow().clone()
    }

    fn ptable_index(&self, _cluster: u32, fallback: i64) -> i64 {
        fallback
    }

    fn rtable_index(&self, page: u32, fallback: i64) -> i64 {
        self.override_rtable_index.borrow().get(&page).map(|&v| v as i64).unwrap_or(fallback)
    }

    fn ptable_node(&self, _level: u32, _index: u32, fallback: i64) -> i64 {
        fallback
    }

    fn rtable_node(&self, _level: u32, _index: u32, fallback: i64) -> i64 {
        fallback
    }
}

pub struct NorPageManager {
    sb: Rc<Superblock>,
    io: SharedIo,
    base_offset: u64,
    log: Option<Rc<dyn PageLog>>,

    write_style: u16,
    minor_mask: u32,
    major_shift: u32,
    reserved_offset: u32,
    ptables: RefCell<Vec<u32>>,
}

impl NorPageManager {
    pub fn new(sb: Rc<Superblock>, io: SharedIo, base_offset: u64) -> Self {
        let write_style = sb.nor_writing_style.unwrap_or(0);
        let field_shift = if write_style == 0 { 2 } else { 3 };
        let field_size = sb.page_size >> field_shift;

        let minor_mask = field_size - 1;
        let mut temp = minor_mask;
        let mut major_shift = 0u32;
        while temp != 0 {
            temp >>= 1;
            major_shift += 1;
        }

        let reserved_offset = sb.block_size - ((sb.block_size + minor_mask) >> major_shift);
        let page_total = sb.page_total as usize;

        Self {
            sb,
            io,
            base_offset,
            log: None,
            write_style,
            minor_mask,
            major_shift,
            reserved_offset,
            ptables: RefCell::new(vec![0xffffffffu32; page_total]),
        }
    }

    pub fn set_log(&mut self, log: Rc<dyn PageLog>) {
        self.log = Some(log);
    }

    /// Rebuilds the forward (`cluster -> page`) map by sweeping every
    /// page's reverse pointer once. Call after the log has been attached.
    pub fn compute_ptables(&self) -> Result<()> {
        let mut ptables = self.ptables.borrow_mut();
        for page in 0..self.sb.page_total {
            let cluster = self.reverse(page);
            if (cluster >> 31) == 0 {
                if ptables[cluster as usize] != 0xffffffff {
                    return Err(crate::error::Efs2Error::DuplicatePage { page });
                }
                ptables[cluster as usize] = page;
            }
        }
        Ok(())
    }

    fn get_paired_bits(paired: u32) -> u32 {
        let mut paired = ((paired & 0x44444444) >> 1) | (paired & 0x11111111);
        paired = ((paired & 0x30303030) >> 2) | (paired & 0x03030303);
        paired = ((paired & 0x0f000f00) >> 4) | (paired & 0x000f000f);
        ((paired & 0x00ff0000) >> 8) | (paired & 0x000000ff)
    }
}

impl PageManager for NorPageManager {
    fn forward(&self, cluster: u32) -> u32 {
        self.ptables.borrow()[cluster as usize]
    }

    fn reverse(&self, page: u32) -> u32 {
        if let Some(log) = &self.log {
            let ov = log.rtable_index(page, -1);
            if ov != -1 {
                let temp = ov as u32;
                return match temp {
                    0 => GARBAGE,
                    0xffffffff => FREE,
                    mut t => {
                        if (t >> 31) == 0 {
                            t &= 0xffffff;
                        }
                        t
                    }
                };
            }
        }

        let current_block = page & self.sb.block_mask;
        let current_offset = page & !self.sb.block_mask;
        let last_offset = self.sb.block_size - 1;

        if current_offset >= self.reserved_offset {
            return RESERVED;
        }

        let current_major = self.reserved_offset + (current_offset >> self.major_shift);
        let current_minor = current_offset & self.minor_mask;

        let last_major = self.reserved_offset + (last_offset >> self.major_shift);
        let last_minor = last_offset & self.minor_mask;

        let mut fio = self.io.borrow_mut();
        let temp = if self.write_style == 0 {
            let header_check_offset = (current_block as u64 + last_major as u64) * self.sb.page_size as u64 + (last_minor as u64 * 4);
            let cur_rtable_offset = (current_block as u64 + current_major as u64) * self.sb.page_size as u64 + (current_minor as u64 * 4);

            let mut check = [0u8; 4];
            let _ = fio.seek(SeekFrom::Start(self.base_offset + header_check_offset));
            let _ = fio.read_exact(&mut check);
            if check != [0xe1, 0xe1, 0xf0, 0xf0] {
                return GARBAGE;
            }

            let mut raw = [0u8; 4];
            let _ = fio.seek(SeekFrom::Start(self.base_offset + cur_rtable_offset));
            let _ = fio.read_exact(&mut raw);
            u32::from_le_bytes(raw)
        } else {
            let header_check_offset = (current_block as u64 + last_major as u64) * self.sb.page_size as u64 + (2 * last_minor as u64 * 4);
            let cur_rtable_offset = (current_block as u64 + current_major as u64) * self.sb.page_size as u64 + (2 * current_minor as u64 * 4);

            let mut check = [0u8; 8];
            let _ = fio.seek(SeekFrom::Start(self.base_offset + header_check_offset));
            let _ = fio.read_exact(&mut check);
            if check != [0x03, 0xfc, 0x03, 0xfc, 0x00, 0xff, 0x00, 0xff] {
                return GARBAGE;
            }

            let mut raw1 = [0u8; 4];
            let mut raw2 = [0u8; 4];
            let _ = fio.seek(SeekFrom::Start(self.base_offset + cur_rtable_offset));
            let _ = fio.read_exact(&mut raw1);
            let _ = fio.read_exact(&mut raw2);
            let t1 = Self::get_paired_bits(u32::from_le_bytes(raw1));
            let t2 = Self::get_paired_bits(u32::from_le_bytes(raw2));
            (t2 << 16) | t1
        };

        match temp {
            0 => GARBAGE,
            0xffffffff => FREE,
            mut t => {
                if (t >> 31) == 0 {
                    t &= 0xffffff;
                }
                t
            }
        }
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
