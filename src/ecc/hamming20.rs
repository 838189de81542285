//! Qualcomm's 20-bit Hamming ECC (MSM6100/6250/6500 and, bitpacked, the
//! MSM6550/6275 family): one 3-byte parity block per 128-byte sub-page,
//! optionally packed into 10 on-disk bytes across a 512-byte page.

use crate::error::{Efs2Error, Result};
use crate::util::{BitReader, BitWriter};

#[rustfmt::skip]
const ECC_XOR_TABLE: [u8; 256] = [
    0,85,86,3,89,12,15,90,90,15,12,89,3,86,85,0,
    101,48,51,102,60,105,106,63,63,106,105,60,102,51,48,101,
    102,51,48,101,63,106,105,60,60,105,106,63,101,48,51,102,
    3,86,85,0,90,15,12,89,89,12,15,90,0,85,86,3,
    105,60,63,106,48,101,102,51,51,102,101,48,106,63,60,105,
    12,89,90,15,85,0,3,86,86,3,0,85,15,90,89,12,
    15,90,89,12,86,3,0,85,85,0,3,86,12,89,90,15,
    106,63,60,105,51,102,101,48,48,101,102,51,105,60,63,106,
    106,63,60,105,51,102,101,48,48,101,102,51,105,60,63,106,
    15,90,89,12,86,3,0,85,85,0,3,86,12,89,90,15,
    12,89,90,15,85,0,3,86,86,3,0,85,15,90,89,12,
    105,60,63,106,48,101,102,51,51,102,101,48,106,63,60,105,
    3,86,85,0,90,15,12,89,89,12,15,90,0,85,86,3,
    102,51,48,101,63,106,105,60,60,105,106,63,101,48,51,102,
    101,48,51,102,60,105,106,63,63,106,105,60,102,51,48,101,
    0,85,86,3,89,12,15,90,90,15,12,89,3,86,85,0,
];

/// Generates the 3-byte parity block for one 128-byte sub-page.
fn gen_ecc(data: &[u8]) -> [u8; 3] {
    let mut reg1: u32 = 0;
    let mut reg2: i32 = 0;
    let mut reg3: u32 = 0;

    for (i, &byte) in data.iter().enumerate().take(128) {
        let idx = ECC_XOR_TABLE[byte as usize] as u32;
        reg1 ^= idx & 0x3f;
        if idx & 0x40 != 0 {
            reg3 ^= i as u32;
            reg2 ^= !(i as i32) + 0x100;
        }
    }
    let reg2 = reg2 as u32;

    let mut tmp1 = (reg3 & 0x40) >> 1;
    tmp1 |= (reg2 & 0x40) >> 2;
    tmp1 |= (reg3 & 0x20) >> 2;
    tmp1 |= (reg2 & 0x20) >> 3;
    tmp1 |= (reg3 & 0x10) >> 3;
    tmp1 |= (reg2 & 0x10) >> 4;

    let mut tmp2 = (reg3 & 0x08) << 4;
    tmp2 |= (reg2 & 0x08) << 3;
    tmp2 |= (reg3 & 0x04) << 3;
    tmp2 |= (reg2 & 0x04) << 2;
    tmp2 |= (reg3 & 0x02) << 2;
    tmp2 |= (reg2 & 0x02) << 1;
    tmp2 |= (reg3 & 0x01) << 1;
    tmp2 |= reg2 & 0x01;

    [tmp1 as u8, tmp2 as u8, reg1 as u8]
}

fn get_bit(d: u8, s: u32) -> u8 {
    (d >> s) & 1
}

/// Checks one sub-page against its stored parity, correcting a single-bit
/// error in place. Returns `Ok` (data unchanged or repaired) or
/// `EccUncorrectable` on a multi-bit error.
fn check_ecc(data: &mut [u8], ecc: &[u8; 3], ecc_calc: &[u8; 3]) -> Result<()> {
    let ecc_xor = [ecc[0] ^ ecc_calc[0], ecc[1] ^ ecc_calc[1], ecc[2] ^ ecc_calc[2]];
    if ecc_xor == [0, 0, 0] {
        return Ok(());
    }

    let check_ecc = [
        ecc_xor[0] ^ (ecc_xor[0] >> 1),
        ecc_xor[1] ^ (ecc_xor[1] >> 1),
        ecc_xor[2] ^ (ecc_xor[2] >> 1),
    ];

    if (check_ecc[0] & 0x15) == 0x15 && (check_ecc[1] & 0x55) == 0x55 && (check_ecc[2] & 0x14) == 0x14 {
        let err_bitpos = (get_bit(ecc_xor[2], 4) << 2) | (get_bit(ecc_xor[2], 2) << 1) | get_bit(ecc_xor[2], 0);
        let err_bytepos = (get_bit(ecc_xor[0], 5) << 6)
            | (get_bit(ecc_xor[0], 3) << 5)
            | (get_bit(ecc_xor[0], 1) << 4)
            | (get_bit(ecc_xor[1], 7) << 3)
            | (get_bit(ecc_xor[1], 5) << 2)
            | (get_bit(ecc_xor[1], 3) << 1)
            | get_bit(ecc_xor[1], 1);

        let mask = 1u8 << (7 - err_bitpos);
        let b = &mut data[err_bytepos as usize];
        if *b & mask != 0 {
            *b &= !mask;
        } else {
            *b |= mask;
        }
        return Ok(());
    }

    let popcount = (ecc_xor[0] as u32 | (ecc_xor[1] as u32) << 8 | (ecc_xor[2] as u32) << 16).count_ones();
    if popcount != 1 {
        return Err(Efs2Error::EccUncorrectable { offset: 0 });
    }
    // Single bit set in the syndrome with no matching correctable pattern:
    // a parity-only error. Data is already correct.
    Ok(())
}

fn bitpack_ecc(ecc: &[u8]) -> Vec<u8> {
    debug_assert_eq!(ecc.len(), 12);
    let mut w = BitWriter::new();
    for chunk in ecc.chunks(3) {
        w.write_bits(chunk[0] as u32, 6);
        w.write_bits(chunk[1] as u32, 8);
        w.write_bits(chunk[2] as u32, 6);
    }
    w.finish()
}

fn bitunpack_ecc(ecc: &[u8]) -> Vec<u8> {
    debug_assert_eq!(ecc.len(), 10);
    let mut r = BitReader::new(ecc);
    let mut out = Vec::with_capacity(12);
    for _ in 0..4 {
        out.push(r.read_bits(6) as u8);
        out.push(r.read_bits(8) as u8);
        out.push(r.read_bits(6) as u8);
    }
    out
}

/// Hamming-20 codec over up to a 512-byte page, in 128-byte sub-page blocks.
pub struct Hamming20 {
    pub bitpack: bool,
}

impl Hamming20 {
    pub fn new(bitpack: bool) -> Self {
        Self { bitpack }
    }

    pub fn size(&self) -> usize {
        if self.bitpack {
            10
        } else {
            12
        }
    }

    pub fn encode(&self, data: &[u8]) -> Vec<u8> {
        assert!(data.len() <= 512 && data.len() % 0x80 == 0);
        let mut temp = Vec::with_capacity((data.len() / 0x80) * 3);
        for chunk in data.chunks(0x80) {
            temp.extend_from_slice(&gen_ecc(chunk));
        }
        if self.bitpack {
            bitpack_ecc(&temp)
        } else {
            temp
        }
    }

    pub fn decode(&self, data: &[u8], ecc: &[u8]) -> Result<Vec<u8>> {
        assert!(data.len() <= 512 && data.len() % 0x80 == 0);
        let ecc = if self.bitpack { bitunpack_ecc(ecc) } else { ecc.to_vec() };
        assert!(ecc.len() % 3 == 0 && ecc.len() / 3 == data.len() / 0x80);

        let mut out = data.to_vec();
        for (i, chunk) in out.clone().chunks(0x80).enumerate() {
            let stored: [u8; 3] = ecc[i * 3..i * 3 + 3].try_into().unwrap();
            let calc = gen_ecc(chunk);
            check_ecc(&mut out[i * 0x80..i * 0x80 + 0x80], &stored, &calc)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_no_error() {
        let codec = Hamming20::new(false);
        let data: Vec<u8> = (0..128u32).map(|x| (x * 37) as u8).collect();
        let ecc = codec.encode(&data);
        let decoded = codec.decode(&data, &ecc).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn corrects_single_bit_flip() {
        let codec = Hamming20::new(false);
        let data: Vec<u8> = (0..128u32).map(|x| (x * 13 + 5) as u8).collect();
        let ecc = codec.encode(&data);
        let mut corrupted = data.clone();
        corrupted[42] ^= 0x08;
        let decoded = codec.decode(&corrupted, &ecc).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn bitpack_round_trips() {
        let ecc: Vec<u8> = (0..12u32).map(|x| (x * 19 + 1) as u8).collect();
        let packed = bitpack_ecc(&ecc);
        assert_eq!(packed.len(), 10);
        let unpacked = bitunpack_ecc(&packed);
        assert_eq!(unpacked, ecc);
    }
}
