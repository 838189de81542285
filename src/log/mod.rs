//! Page log: the small ring of pending page-table updates EFS2 keeps
//! instead of rewriting the whole page table on every allocation. Log
//! pages are scanned in sequence order and replayed into override maps
//! that the page managers consult ahead of the on-disk (possibly stale)
//! tables.

use log::{debug, warn};

use crate::superblock::Superblock;
use crate::util::{crc16_log, le32};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateTableType {
    PtableIndex,
    RtableIndex,
    PtableMeta,
    RtableMeta,
    UpperData,
    LogAlloc,
}

#[derive(Debug, Clone, Copy)]
pub struct TableUpdateEvent {
    pub kind: UpdateTableType,
    pub level: u32,
    pub index: u32,
    pub value: u32,
}

impl TableUpdateEvent {
    fn simple(kind: UpdateTableType, index: u32, value: u32) -> Self {
        Self { kind, level: 0, index, value }
    }
}

/// Overrides read by the page managers in place of stale on-disk tables.
/// Read-only after construction; the NAND and NOR scanners populate one
/// each by replaying every log page in sequence order.
pub trait PageLog {
    fn upper_data(&self) -> Vec<u32>;
    fn ptable_index(&self, cluster: u32, fallback: i64) -> i64;
    fn rtable_index(&self, page: u32, fallback: i64) -> i64;
    fn ptable_node(&self, level: u32, index: u32, fallback: i64) -> i64;
    fn rtable_node(&self, level: u32, index: u32, fallback: i64) -> i64;
}

/// Verifies a log page's terminal-marker CRC. Blank (all-`0xff`) pages are
/// not logs and verify `false`; anything else must end in a `0xfe`
/// (no-erase-pending) or `0xfd` (erase-pending) marker whose CRC-16 checks
/// out, `0xfd` additionally requiring the tail past the marker to be
/// zero-padded.
pub fn verify_log_page(buf: &[u8]) -> bool {
    if buf.iter().all(|&b| b == 0xff) {
        return false;
    }

    let mut log_offs = 8usize;
    loop {
        if log_offs >= buf.len() {
            warn!("log page ran off the end with no terminal marker");
            return false;
        }
        let marker = buf[log_offs];
        if marker == 0xfe {
            if log_offs + 2 < buf.len() {
                let expect = crc16_log(&buf[8..=log_offs]);
                let got = u16::from_le_bytes([buf[log_offs + 1], buf[log_offs + 2]]);
                if expect != got {
                    debug!("log page CRC mismatch at {:#x}: expected {:#x}, got {:#x}", log_offs, expect, got);
                    return false;
                }
                return true;
            }
            return false;
        } else if marker == 0xfd {
            if log_offs + 3 < buf.len() {
                if buf[log_offs + 3..].iter().any(|&b| b != 0) {
                    debug!("log page erase-pending tail not zero-padded");
                    return false;
                }
                let mut body = Vec::with_capacity(4 + (log_offs - 8) + 1);
                body.extend_from_slice(&buf[0..4]);
                body.extend_from_slice(&buf[8..=log_offs]);
                let expect = crc16_log(&body);
                let got = u16::from_le_bytes([buf[log_offs + 1], buf[log_offs + 2]]);
                if expect != got {
                    debug!("log page CRC mismatch (erase-pending) at {:#x}: expected {:#x}, got {:#x}", log_offs, expect, got);
                    return false;
                }
                return true;
            }
            return false;
        } else {
            let nargs = (marker >> 6) as usize;
            log_offs += 1 + 4 * nargs;
        }
    }
}

/// Replays a verified log page's records into a list of table-update
/// events. Callers must have already confirmed [`verify_log_page`].
pub fn parse_log_page(buf: &[u8], sb: &Superblock, log_index: u32) -> Vec<TableUpdateEvent> {
    let mut events = Vec::new();
    let mut log_offs = 8usize;

    loop {
        if log_offs >= buf.len() {
            break;
        }
        let marker = buf[log_offs];
        if marker == 0xfe || marker == 0xfd {
            break;
        }

        let nargs = (marker >> 6) as usize;
        let op = marker & 0x3f;
        let mut args = [0u32; 3];
        for (i, a) in args.iter_mut().enumerate().take(nargs) {
            *a = le32(&buf[log_offs + 1 + i * 4..]);
        }

        match op {
            4 | 11 => {
                events.push(TableUpdateEvent::simple(UpdateTableType::RtableIndex, args[1], 0xfffffff4));
                events.push(TableUpdateEvent::simple(UpdateTableType::RtableIndex, args[2], args[0]));
                events.push(TableUpdateEvent::simple(UpdateTableType::PtableIndex, args[0] & 0xffffff, args[2]));
            }
            5 => {
                events.push(TableUpdateEvent::simple(UpdateTableType::RtableIndex, args[1], args[0]));
                events.push(TableUpdateEvent::simple(UpdateTableType::PtableIndex, args[0] & 0xffffff, args[1]));
            }
            6 => {
                events.push(TableUpdateEvent::simple(UpdateTableType::RtableIndex, args[1], 0xfffffff4));
                events.push(TableUpdateEvent::simple(UpdateTableType::RtableIndex, args[2], args[0]));

                let is_reverse = (args[0] >> 29) & 1;
                let page_depth = sb.nand.as_ref().map(|n| n.page_depth as u32).unwrap_or(1);
                let level = page_depth.wrapping_sub((args[0] >> 26) & 7);
                let depth_shift = sb
                    .nand
                    .as_ref()
                    .and_then(|n| n.depth_shift.get(level as usize))
                    .copied()
                    .unwrap_or(0);
                let index = ((args[0] & 0x3ffffff) << 6) >> depth_shift;

                let kind = if is_reverse == 1 { UpdateTableType::RtableMeta } else { UpdateTableType::PtableMeta };
                events.push(TableUpdateEvent { kind, level, index, value: args[2] });
            }
            7 => {
                events.push(TableUpdateEvent::simple(UpdateTableType::UpperData, args[0], args[1]));
            }
            13 => {
                events.push(TableUpdateEvent::simple(UpdateTableType::RtableIndex, args[1], 0xfffffff4));
                events.push(TableUpdateEvent::simple(UpdateTableType::PtableIndex, args[0], 0xffffffff));
            }
            14 => {
                events.push(TableUpdateEvent::simple(UpdateTableType::RtableIndex, args[0], 0xfffffff4));
            }
            17 => {
                events.push(TableUpdateEvent::simple(UpdateTableType::LogAlloc, args[0], 0));
            }
            other => {
                debug!("log page {:#x}: unrecognized opcode {:#x}, skipping", log_index, other);
            }
        }

        log_offs += 1 + 4 * nargs;
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_page(size: usize, body: &[u8], terminal: u8) -> Vec<u8> {
        let mut buf = vec![0xffu8; size];
        buf[0..4].copy_from_slice(&1u32.to_le_bytes());
        buf[4..8].copy_from_slice(&0xffffffffu32.to_le_bytes());
        buf[8..8 + body.len()].copy_from_slice(body);
        let log_offs = 8 + body.len();
        buf[log_offs] = terminal;
        let crc = crc16_log(&buf[8..=log_offs]);
        buf[log_offs + 1..log_offs + 3].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    #[test]
    fn blank_page_does_not_verify() {
        let buf = vec![0xffu8; 512];
        assert!(!verify_log_page(&buf));
    }

    #[test]
    fn verifies_and_parses_upper_data_record() {
        // op=7 (upper data), nargs=2: top 2 bits = 0b10 -> 0x80 | 7
        let mut body = vec![0x80 | 7u8];
        body.extend_from_slice(&3u32.to_le_bytes());
        body.extend_from_slice(&0x1234u32.to_le_bytes());
        let buf = make_page(512, &body, 0xfe);
        assert!(verify_log_page(&buf));

        // page_depth defaults to 1 when nand is None, sufficient for op 7.
        let sb = crate::superblock::Superblock {
            version: 0,
            age: 0,
            checksum: 0,
            computed_checksum: 0,
            block_size: 0x10,
            page_size: 512,
            block_count: 1,
            block_length: 0,
            page_total: 1,
            is_nand: false,
            block_shift: 4,
            block_mask: !0xf,
            log_head: 0,
            upper_data: vec![0; 7],
            nand: None,
            nor_writing_style: Some(0),
        };
        let events = parse_log_page(&buf, &sb, 0);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, UpdateTableType::UpperData);
        assert_eq!(events[0].index, 3);
        assert_eq!(events[0].value, 0x1234);
    }
}
