//! Transparent ECC-correcting byte stream over a raw flash dump.

pub mod gf1024;
pub mod hamming20;

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use log::warn;

use crate::error::Result;
use gf1024::Gf1024;
use hamming20::Hamming20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpareType {
    Riff,
    Standard,
    QcomStd,
    /// Spare bytes supplied from a second, separately-dumped file.
    Separate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EccAlgo {
    Rs,
    Hamming20,
    Hamming20Bitpack,
}

/// A codec that can decode one page's worth of data given its stored parity.
enum Codec {
    Rs(Gf1024),
    Hamming(Hamming20),
}

impl Codec {
    fn size(&self) -> usize {
        match self {
            Codec::Rs(_) => 10,
            Codec::Hamming(h) => h.size(),
        }
    }

    fn decode(&self, data: &[u8], ecc: &[u8]) -> Result<Vec<u8>> {
        match self {
            Codec::Rs(gf) => {
                let padded_len = 1015usize;
                let mut padded = vec![0u8; padded_len - data.len()];
                padded.extend_from_slice(data);
                let msg: Vec<u16> = padded.iter().map(|&b| b as u16).collect();
                let parity = bytes_to_10bit(ecc);
                let mut full = msg;
                full.extend(parity);
                let decoded = gf.decode(&full).ok_or(crate::error::Efs2Error::EccUncorrectable { offset: 0 })?;
                Ok(decoded[decoded.len() - data.len()..].to_vec())
            }
            Codec::Hamming(h) => h.decode(data, ecc),
        }
    }
}

/// Packs 8 ten-bit RS parity symbols into 10 bytes, MSB-first, mirroring
/// the original's `__10bit_ecc_to_bytes`.
fn tenbit_to_bytes(eccpre: &[u16]) -> [u8; 10] {
    let mut out = [0u8; 10];
    let mut pos: usize = 0;
    for i in 0..10usize {
        let relpos = i % 5;
        if relpos != 0 {
            pos += 1;
        }
        let mut byte: u32 = 0;
        let shift_cur = 2 * relpos;
        if shift_cur != 8 {
            byte += (eccpre[pos] as u32) << shift_cur;
        }
        let shift_last = 10 - 2 * relpos as i32;
        if shift_last != 10 {
            byte += (eccpre[pos - 1] as u32) >> shift_last;
        }
        out[i] = (byte & 0xff) as u8;
    }
    out
}

/// Unpacks 10 stored bytes back into 8 ten-bit RS parity symbols.
fn bytes_to_10bit(ecc: &[u8]) -> Vec<u16> {
    debug_assert_eq!(ecc.len(), 10);
    let mut data: u32 = 0x100 | ecc[0] as u32;
    let mut offset = 0usize;
    let mut read_bit = |count: u32| -> u16 {
        let mut temp: u16 = 0;
        for i in 0..count {
            if data == 0x1 {
                offset += 1;
                data = 0x100 | ecc[offset] as u32;
            }
            temp |= ((data & 0x1) as u16) << i;
            data >>= 1;
        }
        temp
    };
    (0..8).map(|_| read_bit(10)).collect()
}

#[allow(dead_code)]
fn rs_encode(gf: &Gf1024, data: &[u8]) -> [u8; 10] {
    let padded_len = 1015usize;
    let mut padded = vec![0u8; padded_len - data.len()];
    padded.extend_from_slice(data);
    let msg: Vec<u16> = padded.iter().map(|&b| b as u16).collect();
    let parity = gf.encode(&msg);
    tenbit_to_bytes(&parity)
}

pub struct EccConfig {
    pub spare_offset_or_page_size: u32,
    pub spare_type: SpareType,
    pub separate_spare_path: Option<std::path::PathBuf>,
    pub bbm: u32,
    pub page_width: u32,
    pub algo: EccAlgo,
}

impl Default for EccConfig {
    fn default() -> Self {
        Self {
            spare_offset_or_page_size: 0,
            spare_type: SpareType::Riff,
            separate_spare_path: None,
            bbm: 5,
            page_width: 16,
            algo: EccAlgo::Rs,
        }
    }
}

/// Presents a corrected, de-interleaved `Read + Seek` byte stream over a
/// raw flash dump whose pages are interleaved with spare (OOB) bytes.
pub struct EccReader {
    fio: BufReader<File>,
    spare_io: Option<BufReader<File>>,
    eof: u64,
    page_size: u64,
    spare_type: SpareType,
    bbm: u32,
    page_width: u32,
    codec: Codec,
    cur_offset: u64,
    block: Vec<u8>,
}

impl EccReader {
    pub fn open<P: AsRef<Path>>(path: P, cfg: EccConfig) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let size = file.metadata()?.len();
        let mut fio = BufReader::new(file);

        let (eof, page_size, spare_io) = match cfg.spare_type {
            SpareType::Riff => {
                if cfg.spare_offset_or_page_size == 0 {
                    return Err(crate::error::Efs2Error::BadArgument(
                        "an offset to spare data must be specified for RIFF layout".into(),
                    ));
                }
                fio.seek(SeekFrom::Start(cfg.spare_offset_or_page_size as u64))?;
                let mut spare_bytes = Vec::new();
                fio.read_to_end(&mut spare_bytes)?;
                let spare_file = File::open(path.as_ref())?;
                let mut spare_io = BufReader::new(spare_file);
                spare_io.seek(SeekFrom::Start(cfg.spare_offset_or_page_size as u64))?;
                fio.seek(SeekFrom::Start(0))?;
                (cfg.spare_offset_or_page_size as u64, 0x200, Some(spare_io))
            }
            SpareType::Standard => {
                if cfg.spare_offset_or_page_size == 0 {
                    return Err(crate::error::Efs2Error::BadArgument("a page size must be specified for STANDARD layout".into()));
                }
                let page_size = cfg.spare_offset_or_page_size as u64;
                let stride = page_size + 0x10 * (page_size / 0x200);
                let eof = (size / stride) * page_size;
                (eof, page_size, None)
            }
            SpareType::QcomStd => {
                let eof = (size / 0x210) * 0x200;
                (eof, 0x200, None)
            }
            SpareType::Separate => {
                let spare_path = cfg.separate_spare_path.clone().ok_or_else(|| {
                    crate::error::Efs2Error::BadArgument("--ecc-spare-path required for separate spare layout".into())
                })?;
                let spare_file = File::open(spare_path)?;
                let eof = size - (size % 0x200);
                (eof, 0x200, Some(BufReader::new(spare_file)))
            }
        };

        let codec = match cfg.algo {
            EccAlgo::Rs => Codec::Rs(Gf1024::new()),
            EccAlgo::Hamming20 => Codec::Hamming(Hamming20::new(false)),
            EccAlgo::Hamming20Bitpack => Codec::Hamming(Hamming20::new(true)),
        };

        let mut reader = Self {
            fio,
            spare_io,
            eof,
            page_size,
            spare_type: cfg.spare_type,
            bbm: cfg.bbm,
            page_width: cfg.page_width,
            codec,
            cur_offset: 0,
            block: Vec::new(),
        };
        reader.seek(SeekFrom::Start(0))?;
        Ok(reader)
    }

    fn read_page(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        if self.cur_offset >= self.eof {
            return Ok((Vec::new(), Vec::new()));
        }
        match self.spare_type {
            SpareType::Riff => {
                let mut data = vec![0u8; 0x200];
                self.fio.read_exact(&mut data)?;
                let mut spare = vec![0u8; 0x10];
                self.spare_io.as_mut().unwrap().read_exact(&mut spare)?;
                Ok((data, spare))
            }
            SpareType::Standard => {
                let page_size = self.page_size;
                let stride = page_size + 0x10 * (page_size / 0x200);
                let data_offset_floor = (self.cur_offset / page_size) * stride;
                let sub = (self.cur_offset % page_size) / 0x200;
                let data_offset = data_offset_floor + sub * 0x200;
                let spare_offset = data_offset_floor + page_size + sub * 0x10;

                self.fio.seek(SeekFrom::Start(data_offset))?;
                let mut data = vec![0u8; 0x200];
                self.fio.read_exact(&mut data)?;
                self.fio.seek(SeekFrom::Start(spare_offset))?;
                let mut spare = vec![0u8; 0x10];
                self.fio.read_exact(&mut spare)?;
                Ok((data, spare))
            }
            SpareType::QcomStd => {
                let (data_len, pad_len, tail_len, spare_len) = if self.page_width == 16 {
                    (0x1d0, 2, 0x30, 0xe)
                } else {
                    (0x1d1, 1, 0x2f, 0xf)
                };
                let mut a = vec![0u8; data_len];
                self.fio.read_exact(&mut a)?;
                let mut pad = vec![0u8; pad_len];
                self.fio.read_exact(&mut pad)?;
                let mut b = vec![0u8; tail_len];
                self.fio.read_exact(&mut b)?;
                a.extend(b);
                let mut spare = vec![0u8; spare_len];
                self.fio.read_exact(&mut spare)?;
                Ok((a, spare))
            }
            SpareType::Separate => {
                let mut data = vec![0u8; 0x200];
                self.fio.read_exact(&mut data)?;
                let mut spare = vec![0u8; 0x10];
                self.spare_io.as_mut().unwrap().read_exact(&mut spare)?;
                Ok((data, spare))
            }
        }
    }

    fn update_block(&mut self) -> Result<()> {
        let offset = self.cur_offset;
        let (data, mut spare) = self.read_page()?;
        if data.is_empty() {
            self.block = data;
            return Ok(());
        }

        if self.spare_type != SpareType::QcomStd {
            let bbm_mul = self.bbm as usize * if self.page_width == 16 { 2 } else { 1 };
            let bbm_width = if self.page_width == 16 { 2 } else { 1 };
            let mut stripped = spare[..bbm_mul].to_vec();
            stripped.extend_from_slice(&spare[bbm_mul + bbm_width..]);
            spare = stripped;
        }

        let ecc_size = self.codec.size();
        match self.codec.decode(&data, &spare[..ecc_size]) {
            Ok(block) => self.block = block,
            Err(_) => {
                if spare[..ecc_size].iter().any(|&b| b != 0xff) {
                    warn!("uncorrectable ECC at {:#010x} (custom ecc?)", offset);
                }
                self.block = data;
            }
        }
        Ok(())
    }

    pub fn tell(&self) -> u64 {
        self.cur_offset
    }
}

impl Seek for EccReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.cur_offset = match pos {
            SeekFrom::Start(n) => n,
            SeekFrom::Current(n) => (self.cur_offset as i64 + n) as u64,
            SeekFrom::End(n) => {
                if n <= 0 {
                    return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "offset in SeekFrom::End must be negative"));
                }
                self.eof - n as u64
            }
        };
        match self.spare_type {
            SpareType::Riff => {
                let page_off = (self.cur_offset / 0x200) * 0x200;
                self.fio.seek(SeekFrom::Start(page_off))?;
                self.spare_io.as_mut().unwrap().seek(SeekFrom::Start((self.cur_offset / 0x200) * 0x10))?;
            }
            SpareType::Standard => {}
            SpareType::QcomStd => {
                self.fio.seek(SeekFrom::Start((self.cur_offset / 0x200) * 0x210))?;
            }
            SpareType::Separate => {
                self.fio.seek(SeekFrom::Start((self.cur_offset / 0x200) * 0x200))?;
                self.spare_io.as_mut().unwrap().seek(SeekFrom::Start((self.cur_offset / 0x200) * 0x10))?;
            }
        }
        self.update_block().map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        Ok(self.cur_offset)
    }
}

impl Read for EccReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut written = 0;
        while written < buf.len() && !self.block.is_empty() {
            let start = (self.cur_offset % 0x200) as usize;
            let want = buf.len() - written;
            let avail = 0x200 - start;
            let take = avail.min(want);

            buf[written..written + take].copy_from_slice(&self.block[start..start + take]);
            written += take;
            self.cur_offset += take as u64;

            if start + take == 0x200 {
                self.update_block().map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            }
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenbit_pack_round_trips() {
        let gf = Gf1024::new();
        let symbols: Vec<u16> = vec![1, 2, 3, 4, 5, 6, 7, 8];
        let packed = tenbit_to_bytes(&symbols);
        let unpacked = bytes_to_10bit(&packed);
        assert_eq!(unpacked, symbols);
        let _ = gf;
    }
}
