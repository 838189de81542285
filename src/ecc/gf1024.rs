//! GF(2^10) arithmetic and Reed-Solomon encode/decode, grounded on the
//! classic log/antilog-table Reed-Solomon construction (the same one the
//! `reedsolo` library implements), specialized to the field and generator
//! this format uses: primitive polynomial 0x409, primitive element 2,
//! 8 parity symbols, first consecutive root `fcr = 1`.

const C_EXP: u32 = 10;
const FIELD_SIZE: usize = 1 << C_EXP; // 1024
const FIELD_CHARAC: u16 = (FIELD_SIZE - 1) as u16; // 1023
const PRIM: u16 = 0x409;
const NSYM: usize = 8;

pub struct Gf1024 {
    exp: Vec<u16>,
    log: Vec<u16>,
}

impl Gf1024 {
    pub fn new() -> Self {
        let mut exp = vec![0u16; FIELD_SIZE * 2];
        let mut log = vec![0u16; FIELD_SIZE];
        let mut x: u16 = 1;
        for i in 0..FIELD_CHARAC {
            exp[i as usize] = x;
            log[x as usize] = i;
            x <<= 1;
            if x & (1 << C_EXP) != 0 {
                x ^= PRIM;
            }
        }
        for i in FIELD_CHARAC as usize..FIELD_SIZE * 2 {
            exp[i] = exp[i - FIELD_CHARAC as usize];
        }
        Self { exp, log }
    }

    fn mul(&self, a: u16, b: u16) -> u16 {
        if a == 0 || b == 0 {
            return 0;
        }
        self.exp[(self.log[a as usize] as usize + self.log[b as usize] as usize) % FIELD_CHARAC as usize]
    }

    fn div(&self, a: u16, b: u16) -> u16 {
        assert!(b != 0, "gf division by zero");
        if a == 0 {
            return 0;
        }
        let fc = FIELD_CHARAC as i32;
        let idx = ((self.log[a as usize] as i32 - self.log[b as usize] as i32).rem_euclid(fc)) as usize;
        self.exp[idx]
    }

    fn pow(&self, base: u16, power: i32) -> u16 {
        let fc = FIELD_CHARAC as i32;
        let idx = ((self.log[base as usize] as i32 * power).rem_euclid(fc)) as usize;
        self.exp[idx]
    }

    fn inverse(&self, a: u16) -> u16 {
        self.exp[(FIELD_CHARAC as usize - self.log[a as usize] as usize) % FIELD_CHARAC as usize]
    }

    /// Multiply two polynomials, coefficients ordered highest-degree first.
    fn poly_mul(&self, p: &[u16], q: &[u16]) -> Vec<u16> {
        let mut out = vec![0u16; p.len() + q.len() - 1];
        for (j, &qj) in q.iter().enumerate() {
            if qj == 0 {
                continue;
            }
            for (i, &pi) in p.iter().enumerate() {
                out[i + j] ^= self.mul(pi, qj);
            }
        }
        out
    }

    /// Evaluate a polynomial (highest-degree first) at `x` via Horner's rule.
    fn poly_eval(&self, p: &[u16], x: u16) -> u16 {
        let mut y = p[0];
        for &c in &p[1..] {
            y = self.mul(y, x) ^ c;
        }
        y
    }

    fn generator_poly(&self, nsym: usize, fcr: i32) -> Vec<u16> {
        let mut g = vec![1u16];
        for i in 0..nsym {
            g = self.poly_mul(&g, &[1, self.pow(2, fcr + i as i32)]);
        }
        g
    }

    /// Systematic RS encode: returns the `nsym` parity symbols for `msg`
    /// (highest-degree-first order, i.e. `msg[0]` is the most significant symbol).
    pub fn encode(&self, msg: &[u16]) -> Vec<u16> {
        let gen = self.generator_poly(NSYM, 1);
        let mut msg_out = msg.to_vec();
        msg_out.extend(std::iter::repeat(0u16).take(NSYM));
        for i in 0..msg.len() {
            let coef = msg_out[i];
            if coef != 0 {
                for j in 1..gen.len() {
                    msg_out[i + j] ^= self.mul(gen[j], coef);
                }
            }
        }
        msg_out[msg.len()..].to_vec()
    }

    fn syndromes(&self, msg: &[u16], nsym: usize, fcr: i32) -> Vec<u16> {
        (0..nsym).map(|i| self.poly_eval(msg, self.pow(2, fcr + i as i32))).collect()
    }

    /// Berlekamp-Massey: error locator polynomial from the syndrome sequence.
    fn berlekamp_massey(&self, synd: &[u16]) -> Vec<u16> {
        let mut err_loc = vec![1u16];
        let mut old_loc = vec![1u16];
        for i in 0..synd.len() {
            old_loc.push(0);
            let mut delta = synd[i];
            for j in 1..err_loc.len() {
                delta ^= self.mul(err_loc[err_loc.len() - 1 - j], synd[i - j]);
            }
            if delta != 0 {
                if old_loc.len() > err_loc.len() {
                    let new_loc = self.poly_scale(&old_loc, delta);
                    old_loc = self.poly_scale(&err_loc, self.inverse(delta));
                    err_loc = new_loc;
                }
                let scaled = self.poly_scale(&old_loc, delta);
                err_loc = self.poly_add(&err_loc, &scaled);
            }
        }
        while err_loc.first() == Some(&0) {
            err_loc.remove(0);
        }
        let errs = err_loc.len() - 1;
        if errs * 2 > synd.len() {
            // Not enough redundancy to correct: caller treats this as uncorrectable.
        }
        err_loc
    }

    fn poly_scale(&self, p: &[u16], x: u16) -> Vec<u16> {
        p.iter().map(|&c| self.mul(c, x)).collect()
    }

    fn poly_add(&self, p: &[u16], q: &[u16]) -> Vec<u16> {
        let len = p.len().max(q.len());
        let mut out = vec![0u16; len];
        for (i, &c) in p.iter().enumerate() {
            out[i + len - p.len()] ^= c;
        }
        for (i, &c) in q.iter().enumerate() {
            out[i + len - q.len()] ^= c;
        }
        out
    }

    /// Chien search: roots of the error locator polynomial, returned as
    /// message-index positions (0 = most significant symbol of `msg`).
    fn find_errors(&self, err_loc: &[u16], msg_len: usize) -> Option<Vec<usize>> {
        let errs = err_loc.len() - 1;
        let mut err_pos = Vec::new();
        for i in 0..msg_len {
            if self.poly_eval(err_loc, self.pow(2, i as i32)) == 0 {
                err_pos.push(msg_len - 1 - i);
            }
        }
        if err_pos.len() != errs {
            return None;
        }
        Some(err_pos)
    }

    /// Forney algorithm: error magnitudes at the located error positions.
    fn correct_errata(&self, msg: &mut [u16], synd: &[u16], err_pos: &[usize], fcr: i32) -> bool {
        let coef_pos: Vec<i32> = err_pos.iter().map(|&p| (msg.len() - 1 - p) as i32).collect();
        let err_loc = self.error_locator_from_positions(&coef_pos);
        let synd_rev: Vec<u16> = synd.iter().rev().cloned().collect();
        let err_eval = self.error_evaluator(&synd_rev, &err_loc, coef_pos.len());

        let mut x = Vec::new();
        for &p in &coef_pos {
            x.push(self.pow(2, p));
        }

        let mut e = vec![0u16; msg.len()];
        for (i, &xi) in x.iter().enumerate() {
            let xi_inv = self.inverse(xi);
            let mut err_loc_prime = 1u16;
            for (j, &xj) in x.iter().enumerate() {
                if j != i {
                    err_loc_prime = self.mul(err_loc_prime, 1 ^ self.mul(xj, xi_inv));
                }
            }
            if err_loc_prime == 0 {
                return false;
            }
            let y = self.mul(xi, self.poly_eval(&err_eval, xi_inv));
            let magnitude = self.div(y, err_loc_prime);
            e[err_pos[i]] = magnitude;
        }
        for (i, v) in e.iter().enumerate() {
            msg[i] ^= v;
        }
        true
    }

    fn error_locator_from_positions(&self, coef_pos: &[i32]) -> Vec<u16> {
        let mut e = vec![1u16];
        for &p in coef_pos {
            e = self.poly_mul(&e, &[self.pow(2, p), 1]);
        }
        e
    }

    fn error_evaluator(&self, synd: &[u16], err_loc: &[u16], nsym: usize) -> Vec<u16> {
        let prod = self.poly_mul(synd, err_loc);
        let start = prod.len() - nsym;
        prod[start..].to_vec()
    }

    /// Decode `msg` (data symbols followed by `nsym` parity symbols,
    /// highest-degree-first), correcting in place. Returns `None` when the
    /// error pattern exceeds the code's correction capacity.
    pub fn decode(&self, msg: &[u16]) -> Option<Vec<u16>> {
        let mut out = msg.to_vec();
        let synd = self.syndromes(&out, NSYM, 1);
        if synd.iter().all(|&s| s == 0) {
            return Some(out[..out.len() - NSYM].to_vec());
        }
        let mut synd_rev = synd.clone();
        synd_rev.reverse();
        let err_loc = self.berlekamp_massey(&synd_rev);
        let errs = err_loc.len() - 1;
        if errs == 0 || errs * 2 > NSYM {
            return None;
        }
        let err_pos = self.find_errors(&err_loc, out.len())?;
        if !self.correct_errata(&mut out, &synd, &err_pos, 1) {
            return None;
        }
        let verify = self.syndromes(&out, NSYM, 1);
        if !verify.iter().all(|&s| s == 0) {
            return None;
        }
        Some(out[..out.len() - NSYM].to_vec())
    }
}

impl Default for Gf1024 {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip_no_errors() {
        let gf = Gf1024::new();
        let msg: Vec<u16> = (0..1015u16).map(|x| x % 1000).collect();
        let parity = gf.encode(&msg);
        let mut full = msg.clone();
        full.extend(parity);
        let decoded = gf.decode(&full).expect("decode should succeed with no errors");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn corrects_single_symbol_error() {
        let gf = Gf1024::new();
        let msg: Vec<u16> = (0..1015u16).map(|x| (x * 7) % 1000).collect();
        let parity = gf.encode(&msg);
        let mut full = msg.clone();
        full.extend(parity);
        full[500] ^= 0x3ff;
        let decoded = gf.decode(&full).expect("single symbol error should be correctable");
        assert_eq!(decoded, msg);
    }
}
