//! Bit-granular reading for the bzip2 decoder, over either a forward
//! stream or a positioned (`ReadAt`) source. The positioned flavor can
//! seek to an arbitrary bit, which is what makes block-level random
//! access and parallel block decoding possible.

use std::io::{self, Read};
use std::sync::Arc;

use crate::stream::ReadAt;

/// 48-bit magic opening every block.
pub const BLOCK_MAGIC: u64 = 0x3141_5926_5359;
/// 48-bit magic closing the stream (followed by the combined CRC).
pub const FINAL_MAGIC: u64 = 0x1772_4538_5090;

fn unexpected_eof() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "bzip2 stream truncated")
}

/// Byte supplier for a bit reader.
pub trait Bytes {
    fn read_byte(&mut self) -> io::Result<Option<u8>>;
}

/// Forward byte source over any reader.
pub struct StreamBytes<R> {
    r: R,
    buf: Vec<u8>,
    pos: usize,
}

impl<R: Read> StreamBytes<R> {
    pub fn new(r: R) -> StreamBytes<R> {
        StreamBytes {
            r,
            buf: Vec::new(),
            pos: 0,
        }
    }
}

const BYTE_BUF: usize = 1 << 16;

impl<R: Read> Bytes for StreamBytes<R> {
    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        if self.pos == self.buf.len() {
            self.buf.resize(BYTE_BUF, 0);
            let n = self.r.read(&mut self.buf)?;
            self.buf.truncate(n);
            self.pos = 0;
            if n == 0 {
                return Ok(None);
            }
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(Some(b))
    }
}

/// Byte source that pulls from a `ReadAt` at an explicit position, so
/// many of these can read different parts of one file at once.
pub struct SeekableBytes {
    ra: Arc<dyn ReadAt + Send + Sync>,
    file_pos: u64,
    buf: Vec<u8>,
    pos: usize,
}

impl SeekableBytes {
    pub fn new(ra: Arc<dyn ReadAt + Send + Sync>, byte_pos: u64) -> SeekableBytes {
        SeekableBytes {
            ra,
            file_pos: byte_pos,
            buf: Vec::new(),
            pos: 0,
        }
    }

    fn seek(&mut self, byte_pos: u64) {
        self.file_pos = byte_pos;
        self.buf.clear();
        self.pos = 0;
    }
}

impl Bytes for SeekableBytes {
    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        if self.pos == self.buf.len() {
            self.buf.resize(BYTE_BUF, 0);
            let n = self.ra.read_at(&mut self.buf, self.file_pos)?;
            self.buf.truncate(n);
            self.file_pos += n as u64;
            self.pos = 0;
            if n == 0 {
                return Ok(None);
            }
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(Some(b))
    }
}

/// MSB-first bit reader tracking its absolute bit position.
pub struct BitReader<B> {
    src: B,
    n: u64,
    bits: u32,
    pos: u64,
}

impl<B: Bytes> BitReader<B> {
    pub fn new(src: B) -> BitReader<B> {
        BitReader {
            src,
            n: 0,
            bits: 0,
            pos: 0,
        }
    }

    /// Absolute bit position of the next unread bit.
    pub fn bit_pos(&self) -> u64 {
        self.pos
    }

    fn next_byte(&mut self) -> io::Result<u8> {
        self.src.read_byte()?.ok_or_else(unexpected_eof)
    }

    /// Read `count` bits (at most 57) into the low end of a u64.
    pub fn read_bits64(&mut self, count: u32) -> io::Result<u64> {
        debug_assert!(count <= 57);
        self.pos += u64::from(count);
        while count > self.bits {
            let b = self.next_byte()?;
            self.n = (self.n << 8) | u64::from(b);
            self.bits += 8;
        }
        let out = (self.n >> (self.bits - count)) & ((1u64 << count) - 1);
        self.bits -= count;
        Ok(out)
    }

    pub fn read_bits(&mut self, count: u32) -> io::Result<u32> {
        Ok(self.read_bits64(count)? as u32)
    }

    pub fn read_bit(&mut self) -> io::Result<bool> {
        Ok(self.read_bits64(1)? != 0)
    }

    /// Scan forward for the next block or end-of-stream magic, one byte at
    /// a time, then back up so the pattern is the next thing read. Returns
    /// true for the end-of-stream magic. Running out of input without
    /// seeing either magic is a truncation error, since even the final
    /// magic precedes the last bytes of a stream.
    pub fn scan_to_magic(&mut self) -> io::Result<bool> {
        debug_assert!(self.bits < 64);
        let mut n = if self.bits == 0 {
            0
        } else {
            self.n & ((1u64 << self.bits) - 1)
        };
        let mut bits = u64::from(self.bits);
        n <<= 8;
        self.pos += u64::from(self.bits);
        loop {
            self.pos += 8;
            bits += 8;
            let b = self.next_byte()?;
            n |= u64::from(b);
            if bits < 56 {
                n <<= 8;
                continue;
            }
            for i in 0..8u32 {
                // 48-bit window at bit offset 8 of the sliding accumulator
                let masked = n & 0x00FF_FFFF_FFFF_FF00;
                if masked == BLOCK_MAGIC << 8 || masked == FINAL_MAGIC << 8 {
                    // "unread" everything from the pattern start onward
                    n >>= i;
                    self.n = n;
                    self.bits = 56 - i;
                    self.pos -= u64::from(56 - i);
                    return Ok(masked == FINAL_MAGIC << 8);
                }
                n <<= 1;
            }
        }
    }
}

impl BitReader<SeekableBytes> {
    /// A bit reader positioned at an absolute bit offset of a `ReadAt`.
    pub fn at_bit(ra: Arc<dyn ReadAt + Send + Sync>, bit_pos: u64) -> io::Result<Self> {
        let mut br = BitReader::new(SeekableBytes::new(ra, bit_pos >> 3));
        br.read_bits64((bit_pos & 7) as u32)?;
        br.pos = bit_pos;
        Ok(br)
    }

    /// Reposition to an absolute bit offset.
    pub fn seek_to_bit(&mut self, bit_pos: u64) -> io::Result<()> {
        self.src.seek(bit_pos >> 3);
        self.n = 0;
        self.bits = 0;
        self.read_bits64((bit_pos & 7) as u32)?;
        self.pos = bit_pos;
        Ok(())
    }
}
