//! bzip2 decompression with two additions the delta-pack pipeline needs:
//! a block index enabling `ReadAt` against compressed reference files,
//! and a parallel forward reader that decodes blocks on worker threads
//! while preserving stream order.
//!
//! Compatible with standard `.bz2` files. Compression is not implemented;
//! writing goes through an external compressor (see the `zip` module).

pub mod bit_reader;
mod huffman;
mod mtf;

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::error::{Error, Result};
use crate::stream::ReadAt;
use bit_reader::{BitReader, Bytes, SeekableBytes, StreamBytes, BLOCK_MAGIC, FINAL_MAGIC};
use huffman::HuffmanTable;
use mtf::MoveToFront;

const FILE_MAGIC: u32 = 0x425a; // "BZ"

/// Repeat cap from the bzip2 source; prevents the RLE accumulator from
/// overflowing.
const MAX_REPEAT: u32 = 2 * 1024 * 1024;

fn structural(msg: impl Into<String>) -> Error {
    Error::Structural(msg.into())
}

/// Parse the 4-byte stream header, returning the block size in bytes.
fn read_stream_header<B: Bytes>(br: &mut BitReader<B>) -> Result<usize> {
    let magic = br.read_bits(16)?;
    if magic != FILE_MAGIC {
        return Err(structural("bad magic value"));
    }
    let t = br.read_bits(8)?;
    if t != u32::from(b'h') {
        return Err(structural("non-Huffman entropy encoding"));
    }
    let level = br.read_bits(8)?;
    if !(u32::from(b'1')..=u32::from(b'9')).contains(&level) {
        return Err(structural("invalid compression level"));
    }
    Ok(100 * 1024 * (level as usize - b'0' as usize))
}

/// Where a block begins in the compressed stream and what came before it
/// in the decompressed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockBoundary {
    pub in_bit_pos: u64,
    pub out_byte_pos: u64,
}

/// Serialize a block index: block count, logical block size, then one
/// `(in_bit_pos, out_byte_pos)` pair per block, all big-endian.
pub fn write_block_index<W: Write>(
    w: &mut W,
    block_size: u64,
    blocks: &[BlockBoundary],
) -> Result<()> {
    w.write_all(&(blocks.len() as u64).to_be_bytes())?;
    w.write_all(&block_size.to_be_bytes())?;
    for b in blocks {
        w.write_all(&(b.in_bit_pos as i64).to_be_bytes())?;
        w.write_all(&(b.out_byte_pos as i64).to_be_bytes())?;
    }
    Ok(())
}

pub fn read_block_index<R: Read>(r: &mut R) -> Result<(u64, Vec<BlockBoundary>)> {
    let mut word = [0u8; 8];
    let mut next_u64 = |r: &mut R, what: &'static str| -> Result<u64> {
        r.read_exact(&mut word).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Error::Truncated(what)
            } else {
                Error::Io(e)
            }
        })?;
        Ok(u64::from_be_bytes(word))
    };
    let count = next_u64(r, "block index count")?;
    if count > 1 << 40 {
        return Err(structural("implausible block index count"));
    }
    let block_size = next_u64(r, "block index block size")?;
    if !(100 * 1024..=900 * 1024).contains(&(block_size as usize)) {
        return Err(structural("implausible block size in index"));
    }
    let mut blocks = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let in_bit_pos = next_u64(r, "block index entry")?;
        let out_byte_pos = next_u64(r, "block index entry")?;
        blocks.push(BlockBoundary {
            in_bit_pos,
            out_byte_pos,
        });
    }
    Ok((block_size, blocks))
}

/// Per-block decode state: the Burrows-Wheeler buffer plus the run-length
/// state that trickles output out of it. Blocks are decoded whole, but
/// the RLE layer expands on demand so no oversized buffer is needed.
struct DecodeState {
    block_size: usize,
    tt: Vec<u32>,
    c: [u32; 256],
    pre_rle_used: usize,
    pre_rle_len: usize,
    t_pos: u32,
    last_byte: i32,
    byte_repeats: u32,
    repeats: u32,
}

impl DecodeState {
    fn new(block_size: usize) -> DecodeState {
        DecodeState {
            block_size,
            tt: vec![0; block_size],
            c: [0; 256],
            pre_rle_used: 0,
            pre_rle_len: 0,
            t_pos: 0,
            last_byte: -1,
            byte_repeats: 0,
            repeats: 0,
        }
    }

    /// Decode one block (magic already consumed) into the BWT buffer.
    fn read_block<B: Bytes>(&mut self, br: &mut BitReader<B>) -> Result<()> {
        br.read_bits64(32)?; // block CRC, unchecked
        if br.read_bit()? {
            return Err(structural("deprecated randomized files"));
        }
        let orig_ptr = br.read_bits(24)?;

        // Symbol set, stored as a two-level 16x16 bitmap.
        let symbol_range_bitmap = br.read_bits(16)?;
        let mut symbol_present = [false; 256];
        let mut num_symbols = 0usize;
        for sym_range in 0..16u32 {
            if symbol_range_bitmap & (1 << (15 - sym_range)) != 0 {
                let bits = br.read_bits(16)?;
                for symbol in 0..16u32 {
                    if bits & (1 << (15 - symbol)) != 0 {
                        symbol_present[(16 * sym_range + symbol) as usize] = true;
                        num_symbols += 1;
                    }
                }
            }
        }
        if num_symbols == 0 {
            return Err(structural("no symbols in block"));
        }

        let num_huffman_trees = br.read_bits(3)? as usize;
        if !(2..=6).contains(&num_huffman_trees) {
            return Err(structural("invalid number of Huffman trees"));
        }

        // The tree in use can switch every 50 symbols; the selector list
        // says which, move-to-front transformed and unary coded.
        let num_selectors = br.read_bits(15)? as usize;
        if num_selectors == 0 {
            return Err(structural("no tree selectors"));
        }
        let mut tree_indexes = vec![0u8; num_selectors];
        let mut mtf_tree_decoder = MoveToFront::with_range(num_huffman_trees);
        for idx in tree_indexes.iter_mut() {
            let mut c = 0usize;
            while br.read_bit()? {
                c += 1;
            }
            if c >= num_huffman_trees {
                return Err(structural("tree index too large"));
            }
            *idx = mtf_tree_decoder.decode(c);
        }

        let mut symbols = Vec::with_capacity(num_symbols);
        for (i, &present) in symbol_present.iter().enumerate() {
            if present {
                symbols.push(i as u8);
            }
        }
        let mut mtf = MoveToFront::new(&symbols);

        let num_symbols = num_symbols + 2; // RUNA and RUNB
        let mut huffman_trees = Vec::with_capacity(num_huffman_trees);
        let mut lengths = vec![0u8; num_symbols];
        for _ in 0..num_huffman_trees {
            // code lengths are delta coded from a 5-bit base
            let mut length = br.read_bits(5)? as i32;
            for len_out in lengths.iter_mut() {
                loop {
                    if !br.read_bit()? {
                        break;
                    }
                    if br.read_bit()? {
                        length -= 1;
                    } else {
                        length += 1;
                    }
                }
                if !(0..=20).contains(&length) {
                    return Err(structural("Huffman length out of range"));
                }
                *len_out = length as u8;
            }
            huffman_trees.push(HuffmanTable::new(&lengths)?);
        }

        let mut selector_index = 1usize;
        let mut current_tree = &huffman_trees[tree_indexes[0] as usize];
        let mut buf_index = 0usize;
        // The MTF output is run-length coded; RUNA/RUNB accumulate the
        // repeat count bijectively.
        let mut repeat = 0usize;
        let mut repeat_power = 0usize;
        self.c = [0; 256];

        let mut decoded = 0; // symbols decoded under the current tree
        loop {
            if decoded == 50 {
                if selector_index >= tree_indexes.len() {
                    return Err(structural("not enough tree selectors"));
                }
                current_tree = &huffman_trees[tree_indexes[selector_index] as usize];
                selector_index += 1;
                decoded = 0;
            }

            let v = current_tree.decode(br)? as usize;
            decoded += 1;

            if v < 2 {
                // RUNA or RUNB
                if repeat == 0 {
                    repeat_power = 1;
                }
                repeat += repeat_power << v;
                repeat_power <<= 1;
                if repeat > MAX_REPEAT as usize {
                    return Err(structural("repeat count too large"));
                }
                continue;
            }

            if repeat > 0 {
                if buf_index + repeat > self.block_size {
                    return Err(structural("run exceeds block size"));
                }
                let b = mtf.first();
                for _ in 0..repeat {
                    self.tt[buf_index] = u32::from(b);
                    buf_index += 1;
                }
                self.c[b as usize] += repeat as u32;
                repeat = 0;
            }

            if v == num_symbols - 1 {
                // EOF symbol: always last in the MTF list, never moved
                break;
            }

            // 0 is never referenced (the front is coded as a run), so the
            // index is v-1 rather than v-2
            let b = mtf.decode(v - 1);
            if buf_index >= self.block_size {
                return Err(structural("block exceeds declared size"));
            }
            self.tt[buf_index] = u32::from(b);
            self.c[b as usize] += 1;
            buf_index += 1;
        }

        if orig_ptr as usize >= buf_index {
            return Err(structural("origPtr out of bounds"));
        }

        self.pre_rle_len = buf_index;
        self.pre_rle_used = 0;
        self.t_pos = inverse_bwt(&mut self.tt[..buf_index], orig_ptr, &mut self.c);
        self.last_byte = -1;
        self.byte_repeats = 0;
        self.repeats = 0;
        Ok(())
    }

    /// Drain decoded bytes out of the RLE layer. Returns 0 once the block
    /// is exhausted.
    fn read_output(&mut self, buf: &mut [u8]) -> usize {
        let mut n = 0;
        while (self.repeats > 0 || self.pre_rle_used < self.pre_rle_len) && n < buf.len() {
            if self.repeats > 0 {
                buf[n] = self.last_byte as u8;
                n += 1;
                self.repeats -= 1;
                if self.repeats == 0 {
                    self.last_byte = -1;
                }
                continue;
            }

            self.t_pos = self.tt[self.t_pos as usize];
            let b = self.t_pos as u8;
            self.t_pos >>= 8;
            self.pre_rle_used += 1;

            // four equal bytes are followed by a repeat count byte
            if self.byte_repeats == 3 {
                self.repeats = u32::from(b);
                self.byte_repeats = 0;
                continue;
            }
            if self.last_byte == i32::from(b) {
                self.byte_repeats += 1;
            } else {
                self.byte_repeats = 0;
            }
            self.last_byte = i32::from(b);

            buf[n] = b;
            n += 1;
        }
        n
    }
}

/// Inverse Burrows-Wheeler transform, the single-array method from the
/// bzip2 source: the output stays shuffled in the low 8 bits of `tt` with
/// the successor index in the top 24. Returns the index of the first
/// byte.
fn inverse_bwt(tt: &mut [u32], orig_ptr: u32, c: &mut [u32; 256]) -> u32 {
    let mut sum = 0u32;
    for i in 0..256 {
        sum += c[i];
        c[i] = sum - c[i];
    }
    for i in 0..tt.len() {
        let b = (tt[i] & 0xff) as usize;
        tt[c[b] as usize] |= (i as u32) << 8;
        c[b] += 1;
    }
    tt[orig_ptr as usize] >> 8
}

/// Sequential decoder over any forward stream, optionally recording block
/// boundaries as it goes so an index can be written afterwards.
pub struct Bz2Reader<R> {
    br: BitReader<StreamBytes<R>>,
    state: Option<DecodeState>,
    block_size: usize,
    eof: bool,
    out_pos: u64,
    indexing: bool,
    blocks: Vec<BlockBoundary>,
}

impl<R: Read> Bz2Reader<R> {
    pub fn new(r: R) -> Bz2Reader<R> {
        Bz2Reader {
            br: BitReader::new(StreamBytes::new(r)),
            state: None,
            block_size: 0,
            eof: false,
            out_pos: 0,
            indexing: false,
            blocks: Vec::new(),
        }
    }

    /// Like `new`, but record block boundaries; after reading to EOF,
    /// fetch them with [`Self::block_index`].
    pub fn indexing(r: R) -> Bz2Reader<R> {
        let mut reader = Bz2Reader::new(r);
        reader.indexing = true;
        reader
    }

    /// The block index, available once the stream has been fully read.
    pub fn block_index(&self) -> Option<(u64, &[BlockBoundary])> {
        if self.eof {
            Some((self.block_size as u64, &self.blocks))
        } else {
            None
        }
    }

    fn fill(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if let Some(state) = self.state.as_mut() {
                let n = state.read_output(buf);
                if n > 0 {
                    self.out_pos += n as u64;
                    return Ok(n);
                }
            }
            if self.eof {
                return Ok(0);
            }
            if self.state.is_none() {
                self.block_size = read_stream_header(&mut self.br)?;
                self.state = Some(DecodeState::new(self.block_size));
            }
            let block_pos = self.br.bit_pos();
            let magic = self.br.read_bits64(48)?;
            if magic == FINAL_MAGIC {
                self.br.read_bits64(32)?; // combined CRC, unchecked
                self.eof = true;
                continue;
            }
            if magic != BLOCK_MAGIC {
                return Err(structural(format!("bad magic value found: {magic:012X}")));
            }
            if self.indexing {
                self.blocks.push(BlockBoundary {
                    in_bit_pos: block_pos,
                    out_byte_pos: self.out_pos,
                });
            }
            if let Some(state) = self.state.as_mut() {
                state.read_block(&mut self.br)?;
            }
        }
    }
}

impl<R: Read> Read for Bz2Reader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.fill(buf).map_err(io::Error::from)
    }
}

/// Random access into a bzip2 file via a previously written block index.
/// Each `read_at` decodes at least one whole block and nothing is cached
/// between calls; concurrent callers are serialized by the internal lock.
pub struct Bz2ReaderAt {
    ra: Arc<dyn ReadAt + Send + Sync>,
    blocks: Vec<BlockBoundary>,
    state: Mutex<DecodeState>,
    /// Forward cursor for the plain `Read` implementation.
    pos: u64,
}

impl Bz2ReaderAt {
    pub fn new<R: Read>(ra: Arc<dyn ReadAt + Send + Sync>, index: &mut R) -> Result<Bz2ReaderAt> {
        let (block_size, blocks) = read_block_index(index)?;
        if blocks.is_empty() {
            return Err(structural("empty block index"));
        }
        Ok(Bz2ReaderAt {
            ra,
            blocks,
            state: Mutex::new(DecodeState::new(block_size as usize)),
            pos: 0,
        })
    }

    fn read_at_inner(&self, buf: &mut [u8], off: u64) -> Result<usize> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::Format("bzip2 reader lock poisoned".into()))?;

        // the greatest block starting at or before off
        let idx = self.blocks.partition_point(|b| b.out_byte_pos <= off);
        if idx == 0 {
            return Err(structural("block index does not cover offset 0"));
        }
        let block = self.blocks[idx - 1];

        let mut br = BitReader::at_bit(self.ra.clone(), block.in_bit_pos)?;
        let magic = br.read_bits64(48)?;
        if magic != BLOCK_MAGIC {
            return Err(structural("index points at something that is not a block"));
        }
        state.read_block(&mut br)?;

        // discard the part of the block before off
        let mut remaining = off - block.out_byte_pos;
        let mut scratch = [0u8; 4096];
        while remaining > 0 {
            let want = (remaining.min(scratch.len() as u64)) as usize;
            let n = state.read_output(&mut scratch[..want]);
            if n == 0 {
                return Ok(0); // off is past the end of the stream
            }
            remaining -= n as u64;
        }

        let mut total = 0;
        while total < buf.len() {
            let n = state.read_output(&mut buf[total..]);
            if n > 0 {
                total += n;
                continue;
            }
            let magic = br.read_bits64(48)?;
            if magic == FINAL_MAGIC {
                break;
            }
            if magic != BLOCK_MAGIC {
                return Err(structural("bad magic between blocks"));
            }
            state.read_block(&mut br)?;
        }
        Ok(total)
    }
}

impl ReadAt for Bz2ReaderAt {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.read_at_inner(buf, offset).map_err(io::Error::from)
    }
}

impl Read for Bz2ReaderAt {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.read_at_inner(buf, self.pos).map_err(io::Error::from)?;
        self.pos += n as u64;
        Ok(n)
    }
}

struct Job {
    state: DecodeState,
    br: BitReader<SeekableBytes>,
    start_bit: u64,
    done: Option<Sender<Job>>,
    error: Option<Error>,
}

fn run_job(job: &mut Job) -> Result<()> {
    job.br.seek_to_bit(job.start_bit)?;
    let magic = job.br.read_bits64(48)?;
    if magic != BLOCK_MAGIC {
        return Err(structural(format!(
            "incorrect block magic at bit {}",
            job.start_bit
        )));
    }
    job.state.read_block(&mut job.br)
}

fn block_worker(rx: Receiver<Job>) {
    for mut job in rx.iter() {
        job.error = run_job(&mut job).err();
        if let Some(done) = job.done.take() {
            // the reader may already be gone; then the job just drops
            let _ = done.send(job);
        }
    }
}

/// Forward reader that scans for block magics at bit granularity and
/// hands each block to one of `num_cpus + 2` workers, consuming their
/// output strictly in dispatch order. Optionally writes a block index
/// once the whole stream has been scanned.
pub struct ParallelBz2Reader {
    req_tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    free: Vec<Job>,
    pending: VecDeque<Receiver<Job>>,
    scan: BitReader<SeekableBytes>,
    scan_done: bool,
    current: Option<Job>,
    out_pos: u64,
    block_size: usize,
    blocks: Vec<BlockBoundary>,
    index_out: Option<PathBuf>,
}

impl ParallelBz2Reader {
    pub fn new(
        ra: Arc<dyn ReadAt + Send + Sync>,
        index_out: Option<PathBuf>,
    ) -> Result<ParallelBz2Reader> {
        let mut header = BitReader::at_bit(ra.clone(), 0)?;
        let block_size = read_stream_header(&mut header)?;

        let worker_count = num_cpus::get() + 2;
        let (req_tx, req_rx) = bounded::<Job>(worker_count);
        let workers = (0..worker_count)
            .map(|_| {
                let rx = req_rx.clone();
                std::thread::spawn(move || block_worker(rx))
            })
            .collect();

        let mut free = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            free.push(Job {
                state: DecodeState::new(block_size),
                br: BitReader::at_bit(ra.clone(), 32)?,
                start_bit: 0,
                done: None,
                error: None,
            });
        }

        Ok(ParallelBz2Reader {
            req_tx: Some(req_tx),
            workers,
            free,
            pending: VecDeque::new(),
            scan: BitReader::at_bit(ra, 32)?,
            scan_done: false,
            current: None,
            out_pos: 0,
            block_size,
            blocks: Vec::new(),
            index_out,
        })
    }

    fn dispatch_free_jobs(&mut self) -> Result<()> {
        while !self.scan_done && !self.free.is_empty() {
            if self.scan.scan_to_magic()? {
                self.scan_done = true;
                break;
            }
            let start_bit = self.scan.bit_pos();
            self.scan.read_bits64(48)?; // step past this magic
            if let Some(mut job) = self.free.pop() {
                job.start_bit = start_bit;
                let (done_tx, done_rx) = bounded(1);
                job.done = Some(done_tx);
                let req = self
                    .req_tx
                    .as_ref()
                    .ok_or_else(|| Error::Format("bzip2 reader already shut down".into()))?;
                req.send(job)
                    .map_err(|_| Error::Format("bzip2 block workers exited".into()))?;
                self.pending.push_back(done_rx);
            }
        }
        Ok(())
    }

    fn finish_index(&mut self) {
        let Some(path) = self.index_out.take() else {
            return;
        };
        let result = std::fs::File::create(&path).map_err(Error::Io).and_then(|mut f| {
            write_block_index(&mut f, self.block_size as u64, &self.blocks)
        });
        match result {
            Ok(()) => tracing::debug!(path = %path.display(), blocks = self.blocks.len(), "wrote bzip2 block index"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "could not write bzip2 block index"),
        }
    }

    fn fill(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if let Some(job) = self.current.as_mut() {
                let n = job.state.read_output(buf);
                if n > 0 {
                    self.out_pos += n as u64;
                    return Ok(n);
                }
                if let Some(job) = self.current.take() {
                    self.free.push(job);
                }
            }

            self.dispatch_free_jobs()?;

            let Some(done_rx) = self.pending.pop_front() else {
                self.finish_index();
                return Ok(0);
            };
            let mut job = done_rx
                .recv()
                .map_err(|_| Error::Format("bzip2 block worker failed".into()))?;
            if let Some(e) = job.error.take() {
                return Err(e);
            }
            self.blocks.push(BlockBoundary {
                in_bit_pos: job.start_bit,
                out_byte_pos: self.out_pos,
            });
            self.current = Some(job);
        }
    }
}

impl Read for ParallelBz2Reader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.fill(buf).map_err(io::Error::from)
    }
}

impl Drop for ParallelBz2Reader {
    fn drop(&mut self) {
        self.req_tx.take(); // workers exit when the channel closes
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}
