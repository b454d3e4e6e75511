//! The delta-pack container: a text preamble naming the output and its
//! reference files, then one record per segment (source locator,
//! reference checksum, diff, output checksum), ended by an EOF marker.
//!
//! Writing pipelines the diff work: a ring of task slots is handed to
//! worker threads through a bounded channel, and the main loop drains
//! slots strictly in submission order, so the output bytes are identical
//! whatever the worker count.

use std::fs::File;
use std::io::{BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::chunk::SegmentReader;
use crate::diff::{patch, MatchState};
use crate::error::{Error, Result};
use crate::fnv::fnv1a;
use crate::sourceref::SourceRef;
use crate::stream::Source;
use crate::zip;

pub const FORMAT_NAME: &str = "DeltaPacker";
pub const FORMAT_URL: &str = "no format URL yet";
const SOURCE_URL: &str = "no source URL";

/// References longer than this are not worth diffing against (and the
/// decoder refuses to materialize them).
pub const MAX_SOURCE_LENGTH: u64 = 100_000_000;

/// Queue length for in-flight diff tasks; a queue, not a thread count.
const TASK_SLOTS: usize = 100;

const SAFE_FILENAME: &str = "^[-a-zA-Z0-9_.]*$";

/// Name of the evidence file written when a checksum fails.
pub const ERROR_REPORT_NAME: &str = "dltp-error-report.txt";

/// Options shared by the writer's chunkers. Only the new dump gets the
/// byte-transforming ones; references must stay byte-addressable so their
/// locators mean something at decode time.
#[derive(Debug, Clone, Copy, Default)]
pub struct PackOptions {
    pub last_rev_only: bool,
    pub limit_to_ns: Option<i64>,
    pub cut_meta: bool,
}

/// One slot of the diff pipeline. The slot owns its buffers for life and
/// travels: main loop → task channel → worker → its own done channel →
/// main loop.
struct DiffTask {
    state: MatchState,
    source: SourceRef,
    a: Vec<u8>,
    b: Vec<u8>,
    out: Vec<u8>,
    done: Sender<DiffTask>,
}

impl DiffTask {
    /// Assemble the full record for this segment into `out`.
    fn run(mut self) {
        self.source.put(&mut self.out);
        self.out.extend_from_slice(&fnv1a(&self.a).to_be_bytes());
        self.state.diff(&self.a, &self.b, &mut self.out);
        self.out.extend_from_slice(&fnv1a(&self.b).to_be_bytes());
        let done = self.done.clone();
        // the writer may be gone if close() bailed early; nothing to do
        let _ = done.send(self);
    }
}

fn diff_worker(tasks: Receiver<DiffTask>) {
    for task in tasks.iter() {
        task.run();
    }
}

pub struct DpWriter<W: Write> {
    out: W,
    target: SegmentReader<Box<dyn Source>>,
    references: Vec<SegmentReader<Box<dyn Source>>>,
    ring: Vec<Receiver<DiffTask>>,
    task_tx: Option<Sender<DiffTask>>,
    workers: Vec<JoinHandle<()>>,
    submitted: u64,
}

impl<W: Write> DpWriter<W> {
    /// `sources[0]` is the new dump; the rest are references, preferred in
    /// order. Names are reduced to their compression-stripped basenames
    /// in the preamble.
    pub fn new(
        mut out: W,
        sources: Vec<(Box<dyn Source>, String)>,
        options: PackOptions,
    ) -> Result<DpWriter<W>> {
        if sources.len() < 2 {
            return Err(Error::Format(
                "need at least an input file and a source file".into(),
            ));
        }

        let mut names = Vec::with_capacity(sources.len());
        let mut target = None;
        let mut references = Vec::new();
        for (number, (src, name)) in sources.into_iter().enumerate() {
            names.push(preamble_name(&name));
            if number == 0 {
                target = Some(SegmentReader::new(
                    src,
                    0,
                    options.last_rev_only,
                    options.limit_to_ns,
                    options.cut_meta,
                )?);
            } else {
                references.push(SegmentReader::new(
                    src,
                    number as i64,
                    false,
                    options.limit_to_ns,
                    false,
                )?);
            }
        }
        let Some(target) = target else {
            return Err(Error::Format("no input file".into()));
        };

        out.write_all(format!("{FORMAT_NAME}\n{FORMAT_URL}\n{SOURCE_URL}\n\n").as_bytes())?;
        for name in &names {
            out.write_all(name.as_bytes())?;
            out.write_all(b"\n")?;
        }
        out.write_all(b"\n")?;
        out.flush()?;

        let worker_count = num_cpus::get().max(1);
        let (task_tx, task_rx) = bounded::<DiffTask>(TASK_SLOTS);
        let workers = (0..worker_count)
            .map(|_| {
                let rx = task_rx.clone();
                std::thread::spawn(move || diff_worker(rx))
            })
            .collect();

        let mut ring = Vec::with_capacity(TASK_SLOTS);
        for _ in 0..TASK_SLOTS {
            let (done_tx, done_rx) = bounded(1);
            let task = DiffTask {
                state: MatchState::new(),
                source: SourceRef::NOT_FOUND,
                a: Vec::new(),
                b: Vec::new(),
                out: Vec::new(),
                done: done_tx.clone(),
            };
            done_tx
                .send(task)
                .map_err(|_| Error::Format("could not prime diff task ring".into()))?;
            ring.push(done_rx);
        }

        Ok(DpWriter {
            out,
            target,
            references,
            ring,
            task_tx: Some(task_tx),
            workers,
            submitted: 0,
        })
    }

    /// Read the next segment of the new dump, pick a reference for it,
    /// and queue the diff. Returns false once the input is exhausted (the
    /// final segment is still queued).
    pub fn write_segment(&mut self) -> Result<bool> {
        let next = self.target.read_next()?;

        let mut source = SourceRef::NOT_FOUND;
        let mut matched: Option<usize> = None;
        for i in 0..self.references.len() {
            if let Some(found) = self.references[i].read_to(next.key)? {
                if !self.references[i].segment().is_empty() {
                    source = found;
                    matched = Some(i);
                    break;
                }
            }
        }
        // a zero-length reference encodes as no reference at all
        if source.length == 0 {
            source = SourceRef::NOT_FOUND;
            matched = None;
        }
        if source.length > MAX_SOURCE_LENGTH {
            tracing::debug!(
                key = next.key,
                length = source.length,
                "reference too large, diffing against nothing"
            );
            source = SourceRef::NOT_FOUND;
            matched = None;
        }

        let slot = &self.ring[(self.submitted % TASK_SLOTS as u64) as usize];
        let mut task = slot
            .recv()
            .map_err(|_| Error::Format("diff worker terminated unexpectedly".into()))?;

        // the slot's previous record is final now; emit it before reuse
        self.out.write_all(&task.out)?;
        task.out.clear();

        task.source = source;
        task.a.clear();
        if let Some(i) = matched {
            task.a.extend_from_slice(self.references[i].segment());
        }
        task.b.clear();
        task.b.extend_from_slice(self.target.segment());

        let tx = self
            .task_tx
            .as_ref()
            .ok_or_else(|| Error::Format("writer already closed".into()))?;
        tx.send(task)
            .map_err(|_| Error::Format("diff worker terminated unexpectedly".into()))?;
        self.submitted += 1;

        Ok(!next.at_end)
    }

    /// Drain all outstanding tasks in submission order, write the EOF
    /// marker, and hand back the underlying writer.
    pub fn close(mut self) -> Result<W> {
        for i in 0..TASK_SLOTS as u64 {
            let slot = &self.ring[((self.submitted + i) % TASK_SLOTS as u64) as usize];
            let task = slot
                .recv()
                .map_err(|_| Error::Format("diff worker terminated unexpectedly".into()))?;
            self.out.write_all(&task.out)?;
        }
        self.task_tx.take();
        for handle in self.workers.drain(..) {
            handle
                .join()
                .map_err(|_| Error::Format("diff worker panicked".into()))?;
        }
        SourceRef::EOF_MARKER.write_to(&mut self.out)?;
        self.out.flush()?;
        Ok(self.out)
    }
}

fn preamble_name(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_owned());
    zip::unzipped_name(&base)
}

fn read_line<R: BufRead>(r: &mut R) -> Result<String> {
    let mut line = String::new();
    let n = r.read_line(&mut line).map_err(|e| {
        if e.kind() == std::io::ErrorKind::InvalidData {
            Error::Format("preamble is not UTF-8".into())
        } else {
            Error::Io(e)
        }
    })?;
    if n == 0 {
        return Err(Error::Format("premature end of file in preamble".into()));
    }
    if line.ends_with('\n') {
        line.pop();
    }
    Ok(line)
}

pub struct DpReader<R: BufRead> {
    input: R,
    out: BufWriter<Box<dyn Write>>,
    sources: Vec<Option<Box<dyn Source>>>,
    working_dir: PathBuf,
    change_dump: bool,
    /// Bytes of the previous segment, for change-dump comparison.
    last_seg: Vec<u8>,
    last_written: bool,
    segments_read: u64,
    ref_buf: Vec<u8>,
}

impl<R: BufRead> std::fmt::Debug for DpReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DpReader")
            .field("working_dir", &self.working_dir)
            .field("change_dump", &self.change_dump)
            .field("segments_read", &self.segments_read)
            .finish_non_exhaustive()
    }
}

impl<R: BufRead> DpReader<R> {
    /// Validate the preamble, create the output file (or use stdout when
    /// `streaming`), and open every source named in the pack.
    pub fn new(
        mut input: R,
        working_dir: &Path,
        streaming: bool,
        change_dump: bool,
    ) -> Result<DpReader<R>> {
        let format_name = read_line(&mut input)?;
        if format_name != FORMAT_NAME {
            return Err(Error::Format(format!(
                "Didn't see the expected format name (wanted {FORMAT_NAME:?}, got {format_name:?})"
            )));
        }

        let format_url = read_line(&mut input)?;
        if format_url != FORMAT_URL {
            if format_url.starts_with("http") {
                return Err(Error::Format(format!(
                    "this file needs a newer version of this tool; see {format_url}"
                )));
            }
            return Err(Error::Format(
                "format URL doesn't look compatible with this version".into(),
            ));
        }

        let source_url = read_line(&mut input)?;
        if source_url.is_empty() {
            return Err(Error::Format("expected a non-blank source URL line".into()));
        }

        let blank = read_line(&mut input)?;
        if !blank.is_empty() {
            return Err(Error::Format(
                "expected a blank line after the source URL".into(),
            ));
        }

        let safe_name = regex::Regex::new(SAFE_FILENAME)
            .map_err(|e| Error::Format(format!("bad filename pattern: {e}")))?;
        let mut names = Vec::new();
        loop {
            let name = read_line(&mut input)?;
            if name.is_empty() {
                break;
            }
            if !safe_name.is_match(&name) {
                return Err(Error::Format(format!("unsafe filename: {name}")));
            }
            names.push(name);
        }
        if names.len() < 2 {
            return Err(Error::Format(
                "need at least one source besides the output".into(),
            ));
        }

        let output_name = &names[0];
        let out: Box<dyn Write> = if streaming {
            Box::new(std::io::stdout())
        } else {
            Box::new(File::create(working_dir.join(output_name))?)
        };

        let mut sources: Vec<Option<Box<dyn Source>>> = Vec::with_capacity(names.len());
        for (number, name) in names.iter().enumerate() {
            if streaming && number == 0 {
                // the output only exists as a stream; it can't be read
                sources.push(None);
                continue;
            }
            let src = zip::open(&working_dir.join(name)).map_err(|e| {
                Error::Format(format!("could not open source {name}: {e}"))
            })?;
            sources.push(Some(src));
        }

        Ok(DpReader {
            input,
            out: BufWriter::new(out),
            sources,
            working_dir: working_dir.to_path_buf(),
            change_dump,
            last_seg: Vec::new(),
            last_written: true,
            segments_read: 0,
            ref_buf: Vec::new(),
        })
    }

    /// Expand one record into the output. Returns false at the EOF
    /// marker.
    pub fn read_segment(&mut self) -> Result<bool> {
        let source = SourceRef::read_from(&mut self.input)?;
        if source == SourceRef::EOF_MARKER {
            // in change-dump mode the final segment is always written,
            // even if it equaled its predecessor
            if self.change_dump && !self.last_written {
                let last = std::mem::take(&mut self.last_seg);
                self.out.write_all(&last)?;
                self.last_seg = last;
                self.last_written = true;
            }
            return Ok(false);
        }
        if source == SourceRef::PREVIOUS_SEGMENT {
            return Err(Error::Format("segment chaining not implemented".into()));
        }
        if source.length > MAX_SOURCE_LENGTH {
            return Err(Error::SizeExceeded(source.length, MAX_SOURCE_LENGTH));
        }

        self.ref_buf.clear();
        self.ref_buf.resize(source.length as usize, 0);
        if source != SourceRef::NOT_FOUND {
            let number = source.source_number;
            if number < 0 || number as usize >= self.sources.len() {
                return Err(Error::Format(format!(
                    "record names source {number}, but the pack only lists {}",
                    self.sources.len()
                )));
            }
            let reader = self.sources[number as usize].as_ref().ok_or_else(|| {
                Error::Format(format!("source {number} is not readable in streaming mode"))
            })?;
            reader.read_exact_at(&mut self.ref_buf, source.start)?;
        }

        let stored_ref_sum = self.read_checksum("reference checksum")?;
        let actual_ref_sum = fnv1a(&self.ref_buf);
        if actual_ref_sum != stored_ref_sum {
            let report = self.write_error_report(&self.ref_buf, b"(not patched)", source);
            return Err(Error::ChecksumMismatch(format!(
                "the reference on disk is not the one this pack was encoded against \
                 (stored {stored_ref_sum:08x}, found {actual_ref_sum:08x}); {report}"
            )));
        }

        let text = patch(&self.ref_buf, &mut self.input)?;

        let stored_out_sum = self.read_checksum("output checksum")?;
        let actual_out_sum = fnv1a(&text);
        if actual_out_sum != stored_out_sum {
            let report = self.write_error_report(&self.ref_buf, &text, source);
            return Err(Error::ChecksumMismatch(format!(
                "patched output doesn't match its checksum even though the reference does; \
                 likely a bug in this tool (stored {stored_out_sum:08x}, \
                 computed {actual_out_sum:08x}); {report}"
            )));
        }

        let is_preamble = self.segments_read == 0;
        self.segments_read += 1;
        if self.change_dump {
            if is_preamble || text != self.last_seg {
                self.out.write_all(&text)?;
                self.last_written = true;
            } else {
                self.last_written = false;
            }
            self.last_seg = text;
        } else {
            self.out.write_all(&text)?;
        }
        Ok(true)
    }

    fn read_checksum(&mut self, what: &'static str) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.input.read_exact(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::Truncated(what)
            } else {
                Error::Io(e)
            }
        })?;
        Ok(u32::from_be_bytes(buf))
    }

    /// Leave the evidence on disk for a postmortem. Best effort; the
    /// fatal error that follows matters more.
    fn write_error_report(&self, reference: &[u8], patched: &[u8], source: SourceRef) -> String {
        let path = self.working_dir.join(ERROR_REPORT_NAME);
        let result = File::create(&path).and_then(|mut f| {
            writeln!(
                f,
                "source: number={} start={} length={}\n",
                source.source_number, source.start, source.length
            )?;
            writeln!(f, "--- reference bytes ---")?;
            f.write_all(reference)?;
            writeln!(f, "\n--- patched bytes ---")?;
            f.write_all(patched)?;
            writeln!(f)
        });
        match result {
            Ok(()) => format!("details in {}", path.display()),
            Err(e) => format!("could not write {}: {e}", path.display()),
        }
    }

    pub fn close(mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn page(id: i64, text: &str) -> String {
        format!(
            "  <page>\n    <title>P{id}</title>\n    <ns>0</ns>\n    <id>{id}</id>\n    <revision>\n      <id>{}</id>\n      <text>{text}</text>\n    </revision>\n  </page>\n",
            id * 10
        )
    }

    fn dump(pages: &[String]) -> String {
        let mut d = String::from("<mediawiki>\n  <siteinfo>\n    <dbname>t</dbname>\n  </siteinfo>\n");
        for p in pages {
            d.push_str(p);
        }
        d.push_str("</mediawiki>\n");
        d
    }

    fn mem_source(data: &str) -> Box<dyn Source> {
        Box::new(crate::stream::StreamReaderAt::new(Cursor::new(
            data.as_bytes().to_vec(),
        )))
    }

    fn pack(new: &str, refs: &[(&str, &str)], options: PackOptions) -> Vec<u8> {
        let mut sources = vec![(mem_source(new), "new.xml".to_owned())];
        for (name, content) in refs {
            sources.push((mem_source(content), (*name).to_owned()));
        }
        let mut w = DpWriter::new(Vec::new(), sources, options).unwrap();
        while w.write_segment().unwrap() {}
        w.close().unwrap()
    }

    fn unpack(pack_bytes: &[u8], dir: &Path, change_dump: bool) -> Vec<u8> {
        let mut r = DpReader::new(
            Cursor::new(pack_bytes.to_vec()),
            dir,
            false,
            change_dump,
        )
        .unwrap();
        while r.read_segment().unwrap() {}
        r.close().unwrap();
        std::fs::read(dir.join("new.xml")).unwrap()
    }

    fn write_ref_files(dir: &Path, refs: &[(&str, &str)]) {
        for (name, content) in refs {
            std::fs::write(dir.join(name), content).unwrap();
        }
    }

    #[test]
    fn roundtrip_single_reference() {
        let old = dump(&[page(5, "five v1"), page(9, "nine v1")]);
        let new = dump(&[page(5, "five v2, slightly longer"), page(9, "nine v1")]);
        let packed = pack(&new, &[("old.xml", &old)], PackOptions::default());

        let dir = tempfile::tempdir().unwrap();
        write_ref_files(dir.path(), &[("old.xml", &old)]);
        let got = unpack(&packed, dir.path(), false);
        assert_eq!(String::from_utf8(got).unwrap(), new);
    }

    #[test]
    fn roundtrip_page_missing_from_reference() {
        // reference only has page 9; page 5 must be a full literal
        let old = dump(&[page(9, "nine")]);
        let new = dump(&[page(5, "five is new"), page(9, "nine")]);
        let packed = pack(&new, &[("old.xml", &old)], PackOptions::default());

        let dir = tempfile::tempdir().unwrap();
        write_ref_files(dir.path(), &[("old.xml", &old)]);
        let got = unpack(&packed, dir.path(), false);
        assert_eq!(String::from_utf8(got).unwrap(), new);
    }

    #[test]
    fn first_matching_reference_wins() {
        let old1 = dump(&[page(5, "from old1")]);
        let old2 = dump(&[page(5, "from old2"), page(9, "nine, only in old2")]);
        let new = dump(&[page(5, "from old1 edited"), page(9, "nine, only in old2")]);
        let packed = pack(
            &new,
            &[("old1.xml", &old1), ("old2.xml", &old2)],
            PackOptions::default(),
        );

        let dir = tempfile::tempdir().unwrap();
        write_ref_files(dir.path(), &[("old1.xml", &old1), ("old2.xml", &old2)]);
        let got = unpack(&packed, dir.path(), false);
        assert_eq!(String::from_utf8(got).unwrap(), new);
    }

    #[test]
    fn identical_dumps_make_a_tiny_pack() {
        let content = dump(&[page(5, &"stable content ".repeat(200))]);
        let packed = pack(&content, &[("old.xml", &content)], PackOptions::default());
        // preamble + a couple of copy instructions per segment
        assert!(
            packed.len() < 200,
            "pack of identical dump is {} bytes",
            packed.len()
        );

        let dir = tempfile::tempdir().unwrap();
        write_ref_files(dir.path(), &[("old.xml", &content)]);
        std::fs::write(dir.path().join("new.xml"), b"").unwrap();
        let got = unpack(&packed, dir.path(), false);
        assert_eq!(String::from_utf8(got).unwrap(), content);
    }

    #[test]
    fn preamble_validation() {
        let dir = tempfile::tempdir().unwrap();
        let bad = b"NotDeltaPacker\nno format URL yet\nno source URL\n\nout\nref\n\n";
        let err = DpReader::new(Cursor::new(bad.to_vec()), dir.path(), false, false).unwrap_err();
        assert!(matches!(err, Error::Format(m) if m.contains("format name")));

        let newer = b"DeltaPacker\nhttp://example.org/v9\nno source URL\n\nout\nref\n\n";
        let err = DpReader::new(Cursor::new(newer.to_vec()), dir.path(), false, false).unwrap_err();
        assert!(matches!(err, Error::Format(m) if m.contains("http://example.org/v9")));

        let unsafe_name = b"DeltaPacker\nno format URL yet\nno source URL\n\n../evil\nref\n\n";
        let err =
            DpReader::new(Cursor::new(unsafe_name.to_vec()), dir.path(), false, false).unwrap_err();
        assert!(matches!(err, Error::Format(m) if m.contains("unsafe filename")));

        // missing blank line after the source URL
        let no_blank = b"DeltaPacker\nno format URL yet\nno source URL\nout\nref\n\n";
        let err =
            DpReader::new(Cursor::new(no_blank.to_vec()), dir.path(), false, false).unwrap_err();
        assert!(matches!(err, Error::Format(_)));

        // the name list must end with a blank line before the data starts
        let cut = b"DeltaPacker\nno format URL yet\nno source URL\n\nout\n";
        let err = DpReader::new(Cursor::new(cut.to_vec()), dir.path(), false, false).unwrap_err();
        assert!(matches!(err, Error::Format(m) if m.contains("premature end of file")));
    }

    #[test]
    fn corrupted_checksum_fails_and_reports() {
        let old = dump(&[page(5, "five")]);
        let new = dump(&[page(5, "five edited")]);
        let mut packed = pack(&new, &[("old.xml", &old)], PackOptions::default());

        // flip a bit near the end, in the final record's output checksum
        let n = packed.len();
        packed[n - 5] ^= 0x40;

        let dir = tempfile::tempdir().unwrap();
        write_ref_files(dir.path(), &[("old.xml", &old)]);
        let mut r = DpReader::new(Cursor::new(packed), dir.path(), false, false).unwrap();
        let mut failed = false;
        loop {
            match r.read_segment() {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    assert!(
                        matches!(e, Error::ChecksumMismatch(_)),
                        "unexpected error: {e}"
                    );
                    failed = true;
                    break;
                }
            }
        }
        assert!(failed, "corruption went unnoticed");
        assert!(dir.path().join(ERROR_REPORT_NAME).is_file());
    }

    #[test]
    fn modified_reference_fails_reference_checksum() {
        let old = dump(&[page(5, "the original reference text goes here")]);
        let new = dump(&[page(5, "the original reference text goes here, edited")]);
        let packed = pack(&new, &[("old.xml", &old)], PackOptions::default());

        let dir = tempfile::tempdir().unwrap();
        // damage the reference on disk after encoding
        let tampered = old.replace("original", "oridinal");
        write_ref_files(dir.path(), &[("old.xml", &tampered)]);
        let mut r = DpReader::new(Cursor::new(packed), dir.path(), false, false).unwrap();
        let mut saw_mismatch = false;
        loop {
            match r.read_segment() {
                Ok(true) => {}
                Ok(false) => break,
                Err(Error::ChecksumMismatch(m)) => {
                    assert!(m.contains("reference on disk"), "message: {m}");
                    saw_mismatch = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(saw_mismatch);
    }

    #[test]
    fn previous_segment_locator_rejected() {
        let old = dump(&[page(5, "x")]);
        let preamble = b"DeltaPacker\nno format URL yet\nno source URL\n\nnew.xml\nold.xml\n\n";
        let mut bytes = preamble.to_vec();
        SourceRef::PREVIOUS_SEGMENT.write_to(&mut bytes).unwrap();

        let dir = tempfile::tempdir().unwrap();
        write_ref_files(dir.path(), &[("old.xml", &old)]);
        std::fs::write(dir.path().join("new.xml"), b"").unwrap();
        let mut r = DpReader::new(Cursor::new(bytes), dir.path(), false, false).unwrap();
        let err = r.read_segment().unwrap_err();
        assert!(matches!(err, Error::Format(m) if m.contains("not implemented")));
    }

    #[test]
    fn oversized_source_length_rejected() {
        let old = dump(&[page(5, "x")]);
        let preamble = b"DeltaPacker\nno format URL yet\nno source URL\n\nnew.xml\nold.xml\n\n";
        let mut bytes = preamble.to_vec();
        SourceRef::new(1, 0, MAX_SOURCE_LENGTH + 1)
            .write_to(&mut bytes)
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        write_ref_files(dir.path(), &[("old.xml", &old)]);
        std::fs::write(dir.path().join("new.xml"), b"").unwrap();
        let mut r = DpReader::new(Cursor::new(bytes), dir.path(), false, false).unwrap();
        let err = r.read_segment().unwrap_err();
        assert!(matches!(err, Error::SizeExceeded(_, _)));
    }

    /// Hand-build a pack whose segments are all plain literals, so the
    /// change-dump comparisons are easy to stage.
    fn literal_pack(segments: &[&[u8]]) -> Vec<u8> {
        let mut bytes =
            b"DeltaPacker\nno format URL yet\nno source URL\n\nnew.xml\nold.xml\n\n".to_vec();
        for seg in segments {
            SourceRef::NOT_FOUND.put(&mut bytes);
            bytes.extend_from_slice(&fnv1a(b"").to_be_bytes());
            crate::varint::put_varint(&mut bytes, seg.len() as i64);
            bytes.extend_from_slice(seg);
            bytes.push(0);
            bytes.extend_from_slice(&fnv1a(seg).to_be_bytes());
        }
        SourceRef::EOF_MARKER.put(&mut bytes);
        bytes
    }

    #[test]
    fn change_dump_suppresses_consecutive_repeats() {
        let packed = literal_pack(&[b"HEAD|", b"page one|", b"page one|", b"page one|", b"TAIL|"]);
        let dir = tempfile::tempdir().unwrap();
        write_ref_files(dir.path(), &[("old.xml", "unused")]);
        let got = unpack(&packed, dir.path(), true);
        assert_eq!(got, b"HEAD|page one|TAIL|");
    }

    #[test]
    fn change_dump_always_writes_the_final_segment() {
        let packed = literal_pack(&[b"HEAD|", b"same|", b"same|"]);
        let dir = tempfile::tempdir().unwrap();
        write_ref_files(dir.path(), &[("old.xml", "unused")]);
        let got = unpack(&packed, dir.path(), true);
        // the repeat is suppressed when seen, but being last, it is
        // written after all at the EOF marker
        assert_eq!(got, b"HEAD|same|same|");
    }

    #[test]
    fn change_dump_passes_distinct_segments_through() {
        let old = dump(&[page(5, "five")]);
        let new = dump(&[page(5, "five"), page(9, "nine")]);
        let packed = pack(&new, &[("old.xml", &old)], PackOptions::default());

        let dir = tempfile::tempdir().unwrap();
        write_ref_files(dir.path(), &[("old.xml", &old)]);
        let got = unpack(&packed, dir.path(), true);
        assert_eq!(String::from_utf8(got).unwrap(), new);
    }

    #[test]
    fn parallelism_does_not_change_output() {
        // many segments so the task ring wraps and ordering matters
        let mut old_pages = Vec::new();
        let mut new_pages = Vec::new();
        for id in 1..300 {
            old_pages.push(page(id, &format!("content of page {id} version one")));
            new_pages.push(page(
                id,
                &format!("content of page {id} version {}", if id % 3 == 0 { "two" } else { "one" }),
            ));
        }
        let old = dump(&old_pages);
        let new = dump(&new_pages);

        let packed1 = pack(&new, &[("old.xml", &old)], PackOptions::default());
        let packed2 = pack(&new, &[("old.xml", &old)], PackOptions::default());
        assert_eq!(packed1, packed2, "pack output must be deterministic");

        let dir = tempfile::tempdir().unwrap();
        write_ref_files(dir.path(), &[("old.xml", &old)]);
        let got = unpack(&packed1, dir.path(), false);
        assert_eq!(String::from_utf8(got).unwrap(), new);
    }

    #[test]
    fn lastrev_pack_roundtrips() {
        // the new dump carries full history; the pack reconstructs the
        // trimmed version
        let old = dump(&[page(5, "five")]);
        let new = dump(&[page(5, "five"), page(9, "nine")]);
        // build the trimmed expectation by running the chunker directly
        let mut trimmed = Vec::new();
        let mut tr = crate::chunk::SegmentReader::new(
            Cursor::new(new.as_bytes().to_vec()),
            0,
            true,
            None,
            false,
        )
        .unwrap();
        loop {
            let n = tr.read_next().unwrap();
            trimmed.extend_from_slice(tr.segment());
            if n.at_end {
                break;
            }
        }

        let packed = pack(
            &new,
            &[("old.xml", &old)],
            PackOptions {
                last_rev_only: true,
                ..Default::default()
            },
        );
        let dir = tempfile::tempdir().unwrap();
        write_ref_files(dir.path(), &[("old.xml", &old)]);
        let got = unpack(&packed, dir.path(), false);
        assert_eq!(got, trimmed);
    }
}
