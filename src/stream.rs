//! Positioned reads. The delta-pack reader needs `ReadAt` on its
//! reference files; the chunker only needs `Read`. Having two separate
//! traits (instead of probing capabilities at runtime) lets each consumer
//! state exactly what it requires.

use std::fs::File;
use std::io::{self, Read};
use std::sync::Mutex;

/// Positioned reads that do not disturb any shared cursor. `&self` like
/// `std::os::unix::fs::FileExt`, so implementations can be shared between
/// threads; stateful ones serialize internally.
pub trait ReadAt {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            match self.read_at(buf, offset) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "failed to fill whole buffer from positioned read",
                    ));
                }
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
impl ReadAt for File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }
}

#[cfg(windows)]
impl ReadAt for File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(self, buf, offset)
    }
}

impl<T: ReadAt + ?Sized> ReadAt for &T {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        (**self).read_at(buf, offset)
    }
}

impl<T: ReadAt + ?Sized> ReadAt for std::sync::Arc<T> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        (**self).read_at(buf, offset)
    }
}

/// An input that can serve both the chunker (forward reads) and the
/// delta-pack reader (positioned reads).
pub trait Source: Read + ReadAt + Send {}

impl<T: Read + ReadAt + Send> Source for T {}

const DISCARD_CHUNK: usize = 1 << 20;

/// Forward-only `ReadAt` over a plain stream: positioned reads at or past
/// the current offset discard the gap and read; anything behind the
/// offset is an error. This is what compressed sources go through when no
/// block index exists; the pipeline only ever advances.
pub struct StreamReaderAt<R> {
    inner: Mutex<Forward<R>>,
}

struct Forward<R> {
    r: R,
    offset: u64,
    discard_buf: Vec<u8>,
}

impl<R: Read> StreamReaderAt<R> {
    pub fn new(r: R) -> StreamReaderAt<R> {
        StreamReaderAt {
            inner: Mutex::new(Forward {
                r,
                offset: 0,
                discard_buf: Vec::new(),
            }),
        }
    }
}

impl<R: Read> Forward<R> {
    fn skip_to(&mut self, target: u64) -> io::Result<()> {
        if target < self.offset {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "tried to skip backward from {} to {} in a stream",
                    self.offset, target
                ),
            ));
        }
        if self.discard_buf.is_empty() && target > self.offset {
            self.discard_buf.resize(DISCARD_CHUNK, 0);
        }
        while self.offset < target {
            let want = ((target - self.offset) as usize).min(DISCARD_CHUNK);
            let n = self.r.read(&mut self.discard_buf[..want])?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended while skipping forward",
                ));
            }
            self.offset += n as u64;
        }
        Ok(())
    }
}

impl<R: Read> Read for StreamReaderAt<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let fwd = self
            .inner
            .get_mut()
            .map_err(|_| io::Error::other("stream reader lock poisoned"))?;
        let n = fwd.r.read(buf)?;
        fwd.offset += n as u64;
        Ok(n)
    }
}

impl<R: Read> ReadAt for StreamReaderAt<R> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut fwd = self
            .inner
            .lock()
            .map_err(|_| io::Error::other("stream reader lock poisoned"))?;
        fwd.skip_to(offset)?;
        let mut total = 0;
        while total < buf.len() {
            let n = fwd.r.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            fwd.offset += n as u64;
            total += n;
        }
        Ok(total)
    }
}
