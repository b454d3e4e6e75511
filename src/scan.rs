//! Buffered forward scanning over a byte stream: find literal byte
//! patterns, peek at decimal integers, and keep everything since the last
//! discard addressable so the chunker can hand out whole segments.

use std::io::Read;

use crate::error::{Error, Result};

/// How many bytes a decimal 64-bit integer can occupy, plus one for a
/// terminator; `peek_int` buffers at least this much before parsing.
const PEEK_INT_WINDOW: usize = 21;

pub struct Scanner<R> {
    source: R,
    /// Bytes from logical offset `offs` onward. `backing[..start]` is
    /// garbage retained to avoid copying on every discard.
    backing: Vec<u8>,
    /// Window start within `backing`.
    start: usize,
    /// Bytes of the window already consumed by scanning.
    consumed: usize,
    /// Logical stream offset of the window start.
    offs: u64,
    eof: bool,
}

/// Result of a scan: the logical offset just past the scanned region, or
/// `NotFound` when the stream ended first (everything was consumed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanResult {
    Found(u64),
    NotFound,
}

impl ScanResult {
    pub fn offset(self) -> Option<u64> {
        match self {
            ScanResult::Found(o) => Some(o),
            ScanResult::NotFound => None,
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    let first = needle[0];
    let mut at = 0;
    while at + needle.len() <= haystack.len() {
        match haystack[at..=haystack.len() - needle.len()]
            .iter()
            .position(|&b| b == first)
        {
            Some(i) => {
                let cand = at + i;
                if &haystack[cand..cand + needle.len()] == needle {
                    return Some(cand);
                }
                at = cand + 1;
            }
            None => return None,
        }
    }
    None
}

impl<R: Read> Scanner<R> {
    pub fn new(source: R, capacity: usize) -> Result<Scanner<R>> {
        let mut s = Scanner {
            source,
            backing: Vec::with_capacity(capacity.max(PEEK_INT_WINDOW * 2)),
            start: 0,
            consumed: 0,
            offs: 0,
            eof: false,
        };
        s.fill()?;
        Ok(s)
    }

    /// Logical offset of the window start (everything since the last
    /// discard).
    pub fn offs(&self) -> u64 {
        self.offs
    }

    /// Logical offset of the first unconsumed byte.
    pub fn unread_offs(&self) -> u64 {
        self.offs + self.consumed as u64
    }

    /// The consumed part of the window: `[offs, unread_offs)`. Callers
    /// usually copy this out and then `discard`.
    pub fn content(&self) -> &[u8] {
        &self.backing[self.start..self.start + self.consumed]
    }

    fn unread(&self) -> &[u8] {
        &self.backing[self.start + self.consumed..]
    }

    /// Pull more data from the source. Returns the number of bytes read,
    /// or `None` at end of stream.
    fn fill(&mut self) -> Result<Option<usize>> {
        if self.eof {
            return Ok(None);
        }
        if self.backing.len() == self.backing.capacity() {
            if self.start > 0 {
                // reclaim the dead prefix before growing
                self.backing.drain(..self.start);
                self.start = 0;
            } else {
                self.backing.reserve(self.backing.capacity().max(1));
            }
        }
        let old_len = self.backing.len();
        self.backing.resize(self.backing.capacity(), 0);
        let n = match self.source.read(&mut self.backing[old_len..]) {
            Ok(n) => n,
            Err(e) => {
                self.backing.truncate(old_len);
                return Err(Error::Io(e));
            }
        };
        self.backing.truncate(old_len + n);
        if n == 0 {
            self.eof = true;
            return Ok(None);
        }
        Ok(Some(n))
    }

    fn consume(&mut self, n: usize) {
        self.consumed += n;
    }

    /// Drop the consumed part of the window. Compacts the backing buffer
    /// once more than half of it is dead.
    pub fn discard(&mut self) {
        self.offs += self.consumed as u64;
        self.start += self.consumed;
        self.consumed = 0;
        if self.start > self.backing.capacity() / 2 {
            self.backing.drain(..self.start);
            self.start = 0;
        }
    }

    /// Advance to the first occurrence of `pattern`; with `inclusive`,
    /// past it. With `discard`, drop scanned-over bytes as we go (for
    /// callers that don't want the window to grow). On EOF without a
    /// match, everything is consumed and `NotFound` is returned.
    pub fn scan_to(&mut self, pattern: &[u8], inclusive: bool, discard: bool) -> Result<ScanResult> {
        loop {
            if let Some(mut i) = find(self.unread(), pattern) {
                if inclusive {
                    i += pattern.len();
                }
                self.consume(i);
                return Ok(ScanResult::Found(self.unread_offs()));
            }
            // keep pattern.len()-1 bytes so a match straddling the fill
            // boundary is still seen
            let overlap = pattern.len() - 1;
            if self.unread().len() > overlap {
                let n = self.unread().len() - overlap;
                self.consume(n);
                if discard {
                    self.discard();
                }
            }
            if self.fill()?.is_none() {
                let n = self.unread().len();
                self.consume(n);
                if discard {
                    self.discard();
                }
                return Ok(ScanResult::NotFound);
            }
        }
    }

    /// Like `scan_to` but for several patterns at once: stops at whichever
    /// occurs earliest in the stream and reports its index.
    pub fn scan_to_any(
        &mut self,
        patterns: &[&[u8]],
        inclusive: bool,
        discard: bool,
    ) -> Result<Option<(u64, usize)>> {
        let overlap = patterns.iter().map(|p| p.len()).max().unwrap_or(1) - 1;
        loop {
            let mut best: Option<(usize, usize)> = None;
            for (which, pat) in patterns.iter().enumerate() {
                if let Some(i) = find(self.unread(), pat) {
                    if best.map_or(true, |(bi, _)| i < bi) {
                        best = Some((i, which));
                    }
                }
            }
            if let Some((mut i, which)) = best {
                if inclusive {
                    i += patterns[which].len();
                }
                self.consume(i);
                return Ok(Some((self.unread_offs(), which)));
            }
            if self.unread().len() > overlap {
                let n = self.unread().len() - overlap;
                self.consume(n);
                if discard {
                    self.discard();
                }
            }
            if self.fill()?.is_none() {
                let n = self.unread().len();
                self.consume(n);
                if discard {
                    self.discard();
                }
                return Ok(None);
            }
        }
    }

    /// Consume everything remaining in the stream into the window.
    pub fn consume_to_eof(&mut self) -> Result<()> {
        loop {
            let n = self.unread().len();
            self.consume(n);
            if self.fill()?.is_none() {
                return Ok(());
            }
        }
    }

    /// Parse a leading decimal integer without consuming it; `-1` when the
    /// next byte is not a digit. Cheap atoi: no sign, no overflow
    /// detection, stops after 21 digits.
    pub fn peek_int(&mut self) -> Result<i64> {
        while self.unread().len() < PEEK_INT_WINDOW {
            if self.fill()?.is_none() {
                break;
            }
        }
        let unread = self.unread();
        let mut parsed: i64 = 0;
        for (i, &c) in unread.iter().enumerate() {
            if !c.is_ascii_digit() || i == PEEK_INT_WINDOW {
                if i == 0 {
                    return Ok(-1);
                }
                return Ok(parsed);
            }
            parsed = parsed.wrapping_mul(10).wrapping_add(i64::from(c - b'0'));
        }
        if unread.is_empty() {
            return Ok(-1);
        }
        Ok(parsed) // integer at EOF is fine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn scanner(data: &[u8]) -> Scanner<Cursor<Vec<u8>>> {
        Scanner::new(Cursor::new(data.to_vec()), 16).unwrap()
    }

    #[test]
    fn scan_to_exclusive_and_inclusive() {
        let mut s = scanner(b"hello <page>world");
        let r = s.scan_to(b"<page>", false, false).unwrap();
        assert_eq!(r, ScanResult::Found(6));
        assert_eq!(s.content(), b"hello ");

        let mut s = scanner(b"hello <page>world");
        let r = s.scan_to(b"<page>", true, false).unwrap();
        assert_eq!(r, ScanResult::Found(12));
        assert_eq!(s.content(), b"hello <page>");
    }

    #[test]
    fn scan_match_straddles_fill_boundary() {
        // tiny capacity forces refills mid-pattern
        let data = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaa<needle>tail".to_vec();
        let mut s = Scanner::new(Cursor::new(data), 4).unwrap();
        let r = s.scan_to(b"<needle>", true, false).unwrap();
        assert_eq!(r, ScanResult::Found(38));
    }

    #[test]
    fn scan_not_found_consumes_everything() {
        let mut s = scanner(b"no tags here");
        let r = s.scan_to(b"<page>", true, false).unwrap();
        assert_eq!(r, ScanResult::NotFound);
        assert_eq!(s.content(), b"no tags here");
        assert_eq!(s.unread_offs(), 12);
    }

    #[test]
    fn scan_to_any_picks_earliest() {
        let mut s = scanner(b"xx</page>yy<revision>zz");
        let (off, which) = s
            .scan_to_any(&[b"<revision>", b"</page>"], true, false)
            .unwrap()
            .unwrap();
        assert_eq!(which, 1);
        assert_eq!(off, 9);

        let (_, which) = s
            .scan_to_any(&[b"<revision>", b"</page>"], true, false)
            .unwrap()
            .unwrap();
        assert_eq!(which, 0);
    }

    #[test]
    fn scan_to_any_nothing_found() {
        let mut s = scanner(b"plain text");
        assert!(s
            .scan_to_any(&[b"<revision>", b"</page>"], true, false)
            .unwrap()
            .is_none());
    }

    #[test]
    fn peek_int_basics() {
        let mut s = scanner(b"1234</id>");
        assert_eq!(s.peek_int().unwrap(), 1234);
        // nothing consumed
        assert_eq!(s.unread_offs(), 0);

        let mut s = scanner(b"abc");
        assert_eq!(s.peek_int().unwrap(), -1);

        let mut s = scanner(b"");
        assert_eq!(s.peek_int().unwrap(), -1);

        let mut s = scanner(b"42");
        assert_eq!(s.peek_int().unwrap(), 42);
    }

    #[test]
    fn discard_resets_content_and_offsets() {
        let mut s = scanner(b"aaa<x>bbb<x>ccc");
        s.scan_to(b"<x>", true, false).unwrap();
        s.discard();
        assert_eq!(s.content(), b"");
        assert_eq!(s.offs(), 6);
        s.scan_to(b"<x>", true, false).unwrap();
        assert_eq!(s.content(), b"bbb<x>");
        assert_eq!(s.unread_offs(), 12);
    }

    #[test]
    fn offsets_survive_many_refills() {
        let mut data = Vec::new();
        for i in 0..1000 {
            data.extend_from_slice(format!("row{i};").as_bytes());
        }
        data.extend_from_slice(b"<end>");
        let total = data.len() as u64;
        let mut s = Scanner::new(Cursor::new(data), 8).unwrap();
        let r = s.scan_to(b"<end>", true, true).unwrap();
        assert_eq!(r, ScanResult::Found(total));
    }
}
