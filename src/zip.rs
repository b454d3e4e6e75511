//! Opening and creating (de)compressed files by suffix.
//!
//! `open("a.xml")` finds `a.xml`, `a.xml.gz`, `a.xml.bz2`, … and returns a
//! source the rest of the pipeline can both stream and `read_at`. Gzip
//! and zstd decode natively; bzip2 uses the in-crate block decoder
//! (random access when an index file exists, parallel forward decode
//! otherwise); xz and lzo pipe through external tools. Writers prefer a
//! pipeable native compressor (`pigz` over `gzip`, `lbzip2` over `bzip2`)
//! and fall back to in-process gzip/zstd.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;

use crate::bz2::{Bz2ReaderAt, ParallelBz2Reader};
use crate::error::{Error, Result};
use crate::stream::{Source, StreamReaderAt};

/// Probe order when resolving a bare name, and strip order for
/// `unzipped_name`.
const SUFFIXES: [&str; 5] = [".lzo", ".gz", ".bz2", ".xz", ".zst"];

/// Extension of the block-index file written next to bzip2 sources.
const BZ2_INDEX_SUFFIX: &str = ".idx";

fn programs_for(format: &str) -> &'static [&'static str] {
    match format {
        "lzo" => &["lzop"],
        "gz" => &["pigz", "gzip"],
        "bz2" => &["lbzip2", "bzip2"],
        "xz" => &["xz"],
        _ => &[],
    }
}

pub fn canonical_format_name(compression: &str) -> &str {
    match compression {
        "bzip2" => "bz2",
        "gzip" => "gz",
        "zstd" => "zst",
        other => other,
    }
}

pub fn is_known(format: &str) -> bool {
    format == "zst" || !programs_for(format).is_empty()
}

/// Whether we can produce this format, natively or via an external tool.
pub fn can_write(format: &str) -> bool {
    match format {
        "gz" | "zst" => true,
        _ => find_program(programs_for(format)).is_some(),
    }
}

/// `name` without any known compression suffixes, however many are
/// stacked on.
pub fn unzipped_name(name: &str) -> String {
    let mut name = name.to_owned();
    loop {
        let mut stripped = false;
        for suffix in SUFFIXES {
            if let Some(rest) = name.strip_suffix(suffix) {
                name = rest.to_owned();
                stripped = true;
            }
        }
        if !stripped {
            return name;
        }
    }
}

fn find_program(choices: &[&str]) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for choice in choices {
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join(choice);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

/// Find `path` itself or a suffixed variant of it. Returns the file and
/// the format suffix it carries, if any.
fn resolve(path: &Path) -> Result<(PathBuf, Option<String>)> {
    let shown = path.display().to_string();
    let mut candidates = vec![path.to_path_buf()];
    for suffix in SUFFIXES {
        let mut with = path.as_os_str().to_owned();
        with.push(suffix);
        candidates.push(PathBuf::from(with));
    }
    for candidate in candidates {
        if candidate.is_file() {
            let name = candidate.to_string_lossy().into_owned();
            let format = SUFFIXES
                .iter()
                .find(|s| name.ends_with(*s))
                .map(|s| s[1..].to_owned());
            return Ok((candidate, format));
        }
    }
    Err(Error::Format(format!("cannot find source {shown}")))
}

/// Reader on an external decompressor's stdout. The child is reaped on
/// drop; a decode failure surfaces as truncated output downstream.
struct PipeReader {
    child: Child,
    out: ChildStdout,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.out.read(buf)
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn pipe_open(program: &Path, file: File) -> Result<PipeReader> {
    let mut child = Command::new(program)
        .arg("-dc")
        .stdin(Stdio::from(file))
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()?;
    let out = child
        .stdout
        .take()
        .ok_or_else(|| Error::Format("decompressor has no stdout".into()))?;
    Ok(PipeReader { child, out })
}

/// Open a possibly compressed file as a `Read` + `ReadAt` source.
pub fn open(path: &Path) -> Result<Box<dyn Source>> {
    let (found, format) = resolve(path)?;
    let file = File::open(&found)?;
    let Some(format) = format else {
        return Ok(Box::new(file));
    };
    match format.as_str() {
        "gz" => Ok(Box::new(StreamReaderAt::new(
            flate2::read::MultiGzDecoder::new(BufReader::new(file)),
        ))),
        "zst" => {
            let dec = zstd::stream::Decoder::new(file)?;
            Ok(Box::new(StreamReaderAt::new(dec)))
        }
        "bz2" => {
            let mut index_name = found.as_os_str().to_owned();
            index_name.push(BZ2_INDEX_SUFFIX);
            let index_path = PathBuf::from(index_name);
            let ra: Arc<dyn crate::stream::ReadAt + Send + Sync> = Arc::new(file);
            if index_path.is_file() {
                tracing::debug!(index = %index_path.display(), "using bzip2 block index");
                let mut index = File::open(&index_path)?;
                Ok(Box::new(Bz2ReaderAt::new(ra, &mut index)?))
            } else {
                // no index yet; decode forward in parallel and leave an
                // index behind for next time
                Ok(Box::new(StreamReaderAt::new(ParallelBz2Reader::new(
                    ra,
                    Some(index_path),
                )?)))
            }
        }
        other => {
            let program = find_program(programs_for(other)).ok_or_else(|| {
                Error::Format(format!("can't find (un)packer for .{other}"))
            })?;
            tracing::debug!(program = %program.display(), "piping through external decompressor");
            Ok(Box::new(StreamReaderAt::new(pipe_open(&program, file)?)))
        }
    }
}

/// A compressed output stream that must be finished to be valid.
pub trait ZipWriter: Write + Send {
    fn finish(self: Box<Self>) -> Result<()>;
}

impl ZipWriter for File {
    fn finish(mut self: Box<Self>) -> Result<()> {
        self.flush()?;
        Ok(())
    }
}

impl ZipWriter for flate2::write::GzEncoder<File> {
    fn finish(self: Box<Self>) -> Result<()> {
        (*self).finish()?;
        Ok(())
    }
}

impl ZipWriter for zstd::stream::Encoder<'static, File> {
    fn finish(self: Box<Self>) -> Result<()> {
        (*self).finish()?;
        Ok(())
    }
}

/// Writer feeding an external compressor's stdin; `finish` closes the
/// pipe and waits for the child.
struct PipeWriter {
    child: Child,
    stdin: Option<ChildStdin>,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.write(buf),
            None => Err(io::Error::other("compressor pipe already closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.flush(),
            None => Ok(()),
        }
    }
}

impl ZipWriter for PipeWriter {
    fn finish(mut self: Box<Self>) -> Result<()> {
        drop(self.stdin.take());
        let status = self.child.wait()?;
        if !status.success() {
            return Err(Error::Format(format!("compressor exited with {status}")));
        }
        Ok(())
    }
}

/// Wrap `out` in a compressor for `format` (`""` or `"none"` for no
/// compression). External tools are preferred because they pipe in a
/// separate process; gzip and zstd have native fallbacks.
pub fn writer(out: File, format: &str) -> Result<Box<dyn ZipWriter>> {
    if format.is_empty() || format == "none" {
        return Ok(Box::new(out));
    }
    if let Some(program) = find_program(programs_for(format)) {
        tracing::debug!(program = %program.display(), "piping through external compressor");
        let mut child = Command::new(&program)
            .arg("-c")
            .stdin(Stdio::piped())
            .stdout(Stdio::from(out))
            .stderr(Stdio::inherit())
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Format("compressor has no stdin".into()))?;
        return Ok(Box::new(PipeWriter {
            child,
            stdin: Some(stdin),
        }));
    }
    match format {
        "gz" => Ok(Box::new(flate2::write::GzEncoder::new(
            out,
            flate2::Compression::default(),
        ))),
        "zst" => Ok(Box::new(zstd::stream::Encoder::new(out, 0)?)),
        other => Err(Error::Format(format!("cannot write format {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unzipped_name_strips_stacked_suffixes() {
        assert_eq!(unzipped_name("dump.xml"), "dump.xml");
        assert_eq!(unzipped_name("dump.xml.bz2"), "dump.xml");
        assert_eq!(unzipped_name("dump.xml.gz"), "dump.xml");
        assert_eq!(unzipped_name("pack.dltp.gz"), "pack.dltp");
        assert_eq!(unzipped_name("a.xml.gz.bz2"), "a.xml");
    }

    #[test]
    fn canonical_names() {
        assert_eq!(canonical_format_name("bzip2"), "bz2");
        assert_eq!(canonical_format_name("gzip"), "gz");
        assert_eq!(canonical_format_name("zstd"), "zst");
        assert_eq!(canonical_format_name("bz2"), "bz2");
    }

    #[test]
    fn known_formats() {
        for f in ["gz", "bz2", "xz", "lzo", "zst"] {
            assert!(is_known(f), "{f}");
        }
        assert!(!is_known("rar"));
        assert!(can_write("gz"));
        assert!(can_write("zst"));
    }

    #[test]
    fn open_plain_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.xml");
        std::fs::write(&path, b"<mediawiki/>").unwrap();
        let mut src = open(&path).unwrap();
        let mut out = Vec::new();
        src.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"<mediawiki/>");
    }

    #[test]
    fn open_resolves_gz_suffix_and_decodes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.xml.gz");
        let f = File::create(&path).unwrap();
        let mut enc = flate2::write::GzEncoder::new(f, flate2::Compression::default());
        enc.write_all(b"compressed content here").unwrap();
        enc.finish().unwrap();

        // ask for the bare name; the .gz variant is found
        let mut src = open(&dir.path().join("doc.xml")).unwrap();
        let mut out = Vec::new();
        src.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"compressed content here");
    }

    #[test]
    fn open_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(open(&dir.path().join("nope.xml")).is_err());
    }

    #[test]
    fn native_gzip_writer_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.gz");
        let w = writer(File::create(&path).unwrap(), "gz").unwrap();
        let mut w = w;
        w.write_all(b"some output data").unwrap();
        w.finish().unwrap();

        let mut dec =
            flate2::read::MultiGzDecoder::new(File::open(&path).unwrap());
        let mut out = Vec::new();
        dec.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"some output data");
    }

    #[test]
    fn open_bz2_without_index_decodes_and_writes_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("multi.txt.bz2");
        std::fs::write(&path, include_bytes!("../tests/data/multiblock.txt.bz2")).unwrap();

        let mut src = open(&dir.path().join("multi.txt")).unwrap();
        let mut out = Vec::new();
        src.read_to_end(&mut out).unwrap();
        assert_eq!(out, &include_bytes!("../tests/data/multiblock.txt")[..]);

        // a second open should pick up the index and support read_at
        let idx = dir.path().join("multi.txt.bz2.idx");
        assert!(idx.is_file(), "index written on first pass");
        let src = open(&dir.path().join("multi.txt")).unwrap();
        let mut buf = [0u8; 20];
        src.read_exact_at(&mut buf, 100_000).unwrap();
        assert_eq!(
            &buf[..],
            &include_bytes!("../tests/data/multiblock.txt")[100_000..100_020]
        );
    }
}
