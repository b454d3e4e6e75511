//! Copy/insert binary diffing over opaque byte buffers.
//!
//! All instructions either copy bytes from `a` (the reference) or insert
//! literal bytes into the output. A cursor tracks the last position used
//! in `a`, and copies near the cursor get shorter encodings.
//!
//! Wire format: each instruction starts with a signed varint. Positive
//! means a literal of that many raw bytes follows; negative means copy
//! that many bytes from the reference, with a second signed varint giving
//! the cursor delta; zero ends the diff. Diffs are therefore
//! self-delimiting, and a truncated one is detectable.
//!
//! Matching uses a rolling hash with a fixed 2^17-entry table. Only
//! positions whose hash has all sparsity-mask bits set are indexed, which
//! keeps the table roughly half full whatever the reference size. It is
//! not as clever as xdelta-class engines and does not try multiple match
//! candidates per offset; on MediaWiki revision histories the long common
//! runs make that a fine trade.

use std::io::Read;

use crate::error::{Error, Result};
use crate::varint;

const HASH_SIZE: usize = 1 << 17;
const HASH_BITS: u32 = (HASH_SIZE - 1) as u32;

/// Matches shorter than this cost more in instruction overhead than they
/// save.
const MIN_MATCH: usize = 24;

const STEP_FACTOR: u32 = 16_777_619; // FNV's prime

const SUB_FACTOR: u32 = step_pow(MIN_MATCH);

const fn step_pow(p: usize) -> u32 {
    let mut v = STEP_FACTOR;
    let mut i = 1;
    while i < p {
        v = v.wrapping_mul(STEP_FACTOR);
        i += 1;
    }
    v
}

/// Mask selecting which rolling-hash values get indexed, sized so the
/// table ends up about half full for a reference of `len` bytes.
fn hash_mask(len: usize) -> u32 {
    let ratio = len as f32 / HASH_SIZE as f32;
    let mut r = (ratio * 2.0) as u64;
    let mut i = 0;
    while r > 0 {
        r >>= 1;
        i += 1;
    }
    if i == 0 {
        // small references index every position
        return 0;
    }
    ((1u32 << i) - 1) << (32 - i)
}

/// Reusable diff scratch state: the hash table plus the `base` offset
/// that lets it be reused across references without zeroing.
pub struct MatchState {
    table: Vec<u32>,
    base: u32,
    mask: u32,
    indexed: bool,
    cursor: usize,
}

impl Default for MatchState {
    fn default() -> Self {
        MatchState::new()
    }
}

impl MatchState {
    pub fn new() -> MatchState {
        MatchState {
            table: Vec::new(), // allocated on first use
            base: 0,
            mask: 0,
            indexed: false,
            cursor: 0,
        }
    }

    /// Write the diff turning `a` into `b` onto `out`, ending with the
    /// zero terminator.
    pub fn diff(&mut self, a: &[u8], b: &[u8], out: &mut Vec<u8>) {
        self.cursor = 0;
        if a == b {
            if !a.is_empty() {
                self.put_copy(out, 0, a.len());
            }
        } else {
            self.index_reference(a);
            self.emit_matches(a, b, out);
        }
        self.base = self.base.wrapping_add(a.len() as u32);
        out.push(0);
    }

    fn put_literal(&mut self, out: &mut Vec<u8>, data: &[u8]) {
        debug_assert!(!data.is_empty());
        varint::put_varint(out, data.len() as i64);
        out.extend_from_slice(data);
        // the cursor tracks literals too, so deltas stay small when copies
        // resume
        self.cursor += data.len();
    }

    fn put_copy(&mut self, out: &mut Vec<u8>, start: usize, end: usize) {
        debug_assert!(end > start);
        varint::put_varint(out, -((end - start) as i64));
        varint::put_varint(out, start as i64 - self.cursor as i64);
        self.cursor = end;
    }

    /// Fill the hash table with sparsity-filtered positions of `a`.
    fn index_reference(&mut self, a: &[u8]) {
        if a.len() < MIN_MATCH {
            self.indexed = false;
            return;
        }
        if self.table.is_empty() {
            self.table = vec![0; HASH_SIZE];
        } else if u32::MAX - (a.len() as u32) < self.base {
            // offsets would overflow the table entries; start over
            self.base = 0;
            self.table.fill(0);
        }
        let mask = hash_mask(a.len());
        let mut v: u32 = 0;
        for &c in &a[..MIN_MATCH] {
            v = v.wrapping_mul(STEP_FACTOR).wrapping_add(u32::from(c));
        }
        for i in MIN_MATCH..a.len() {
            v = v
                .wrapping_mul(STEP_FACTOR)
                .wrapping_add(u32::from(a[i]))
                .wrapping_sub(u32::from(a[i - MIN_MATCH]).wrapping_mul(SUB_FACTOR));
            if v & mask != mask {
                continue;
            }
            self.table[(v & HASH_BITS) as usize] = i as u32 + self.base;
        }
        self.mask = mask;
        self.indexed = true;
    }

    fn emit_matches(&mut self, a: &[u8], b: &[u8], out: &mut Vec<u8>) {
        let mut b_pos = 0;
        'segments: while b_pos < b.len() {
            let rest = &b[b_pos..];
            if rest.len() <= MIN_MATCH || !self.indexed {
                self.put_literal(out, rest);
                return;
            }

            let mut v: u32 = 0;
            for &c in &rest[..MIN_MATCH] {
                v = v.wrapping_mul(STEP_FACTOR).wrapping_add(u32::from(c));
            }
            for i in MIN_MATCH..rest.len() {
                v = v
                    .wrapping_mul(STEP_FACTOR)
                    .wrapping_add(u32::from(rest[i]))
                    .wrapping_sub(u32::from(rest[i - MIN_MATCH]).wrapping_mul(SUB_FACTOR));
                if v & self.mask != self.mask {
                    continue;
                }
                let stored = self.table[(v & HASH_BITS) as usize];
                if stored < self.base {
                    continue; // stale entry from an earlier reference
                }
                let a_cand = (stored - self.base) as usize;
                let Some((a_start, b_start, len)) = extend_match(a, rest, a_cand, i) else {
                    continue;
                };
                if len < MIN_MATCH {
                    continue;
                }
                if b_start > 0 {
                    self.put_literal(out, &rest[..b_start]);
                }
                self.put_copy(out, a_start, a_start + len);
                b_pos += b_start + len;
                continue 'segments;
            }

            self.put_literal(out, rest);
            return;
        }
    }
}

/// Grow a candidate match backward and forward as far as bytes agree.
/// `None` when the seed positions themselves don't match (hash collision
/// or stale entry).
fn extend_match(a: &[u8], b: &[u8], a0: usize, b0: usize) -> Option<(usize, usize, usize)> {
    if a0 >= a.len() || a[a0] != b[b0] {
        return None;
    }
    let mut back = 1;
    while back <= a0.min(b0) && a[a0 - back] == b[b0 - back] {
        back += 1;
    }
    let a_start = a0 + 1 - back;
    let b_start = b0 + 1 - back;
    let mut len = back;
    let max = (a.len() - a_start).min(b.len() - b_start);
    while len < max && a[a_start + len] == b[b_start + len] {
        len += 1;
    }
    Some((a_start, b_start, len))
}

/// Apply a diff read from `diff` against reference `a`, reconstructing
/// the target bytes. The cursor mirrors the writer's, including the
/// advance on literals; every copy is bounds-checked before any slice
/// access.
pub fn patch<R: Read>(a: &[u8], diff: &mut R) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(a.len());
    let mut cursor: i64 = 0;
    loop {
        let instr = varint::read_varint(diff, "diff instruction")?;
        if instr == 0 {
            return Ok(out); // valid end of diff
        }
        if instr > 0 {
            let len = instr as usize;
            let old_len = out.len();
            out.resize(old_len + len, 0);
            diff.read_exact(&mut out[old_len..]).map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    Error::Truncated("literal content (file truncated or not a diff?)")
                } else {
                    Error::Io(e)
                }
            })?;
            cursor += instr;
        } else {
            let len = instr.unsigned_abs() as usize;
            let delta = varint::read_varint(diff, "copy instruction")?;
            let from = cursor
                .checked_add(delta)
                .ok_or(Error::Truncated("copy cursor out of range"))?;
            if from < 0 {
                return Err(Error::Truncated("copy starts before start of source"));
            }
            if from as u64 > a.len() as u64 {
                return Err(Error::Truncated(
                    "copy starts after end of source (truncated source?)",
                ));
            }
            let from = from as usize;
            if from + len > a.len() {
                return Err(Error::Truncated(
                    "copy ends after end of source (truncated source?)",
                ));
            }
            out.extend_from_slice(&a[from..from + len]);
            cursor = (from + len) as i64;
        }
    }
}
