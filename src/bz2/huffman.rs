//! Canonical Huffman decoding for bzip2 blocks, using the limit/base/perm
//! table construction from the reference implementation: codes are
//! assigned in order of ascending length, ties broken by symbol order.

use crate::bz2::bit_reader::{BitReader, Bytes};
use crate::error::{Error, Result};

/// The format caps code lengths at 20 bits.
pub const MAX_CODE_LEN: usize = 20;

pub struct HuffmanTable {
    min_len: u32,
    max_len: u32,
    limit: [i32; MAX_CODE_LEN + 2],
    base: [i32; MAX_CODE_LEN + 2],
    perm: Vec<u16>,
}

impl HuffmanTable {
    pub fn new(lengths: &[u8]) -> Result<HuffmanTable> {
        if lengths.is_empty() {
            return Err(Error::Structural("huffman table with no symbols".into()));
        }
        let mut min_len = MAX_CODE_LEN as u32;
        let mut max_len = 0u32;
        for &l in lengths {
            if l == 0 || l as usize > MAX_CODE_LEN {
                return Err(Error::Structural("Huffman length out of range".into()));
            }
            min_len = min_len.min(u32::from(l));
            max_len = max_len.max(u32::from(l));
        }

        let mut perm = Vec::with_capacity(lengths.len());
        for l in min_len..=max_len {
            for (sym, &len) in lengths.iter().enumerate() {
                if u32::from(len) == l {
                    perm.push(sym as u16);
                }
            }
        }

        let mut base = [0i32; MAX_CODE_LEN + 2];
        for &l in lengths {
            base[l as usize + 1] += 1;
        }
        for i in 1..base.len() {
            base[i] += base[i - 1];
        }

        let mut limit = [0i32; MAX_CODE_LEN + 2];
        let mut vec = 0i32;
        for l in min_len..=max_len {
            vec += base[l as usize + 1] - base[l as usize];
            limit[l as usize] = vec - 1;
            vec <<= 1;
        }
        for l in min_len + 1..=max_len {
            base[l as usize] = ((limit[l as usize - 1] + 1) << 1) - base[l as usize];
        }

        Ok(HuffmanTable {
            min_len,
            max_len,
            limit,
            base,
            perm,
        })
    }

    /// Decode one symbol, reading bits as needed.
    pub fn decode<B: Bytes>(&self, br: &mut BitReader<B>) -> Result<u16> {
        let mut len = self.min_len;
        let mut code = br.read_bits(len)? as i32;
        loop {
            if code <= self.limit[len as usize] {
                let idx = code - self.base[len as usize];
                if idx < 0 || idx as usize >= self.perm.len() {
                    return Err(Error::Structural("invalid Huffman code".into()));
                }
                return Ok(self.perm[idx as usize]);
            }
            len += 1;
            if len > self.max_len {
                return Err(Error::Structural("Huffman code over maximum length".into()));
            }
            code = (code << 1) | i32::from(br.read_bit()?);
        }
    }
}
