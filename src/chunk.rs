//! Splitting a MediaWiki XML dump into per-page segments keyed by page
//! `<id>`, with optional trimming: keep only the last revision, restrict
//! to one namespace, or cut comment/contributor metadata.
//!
//! This is byte-level scanning on purpose. Dumps run to tens of GB and
//! their schema is stable, so we look for literal tags instead of paying
//! for a real XML parser. Segments tile the input exactly: each one
//! carries everything from the end of the previous page through its own
//! `</page>`, so concatenating all segments reproduces the dump.

use std::io::Read;

use crate::error::Result;
use crate::scan::Scanner;
use crate::sourceref::SourceRef;

pub type SegmentKey = i64;

/// Key of the pre-`<page>` preamble segment.
pub const START_KEY: SegmentKey = 0;
/// Sentinel: no further page boundary; the next read consumes to EOF.
pub const PAST_END_KEY: SegmentKey = i64::MAX;
/// Sentinel ordered before every real key.
pub const BEFORE_START: SegmentKey = -PAST_END_KEY;

const PAGE_TAG: &[u8] = b"<page>";
const CLOSE_PAGE_TAG: &[u8] = b"</page>";
const NS_TAG: &[u8] = b"<ns>";
const ID_TAG: &[u8] = b"<id>";
const REV_TAG: &[u8] = b"<revision>";

// cut_meta targets carry the dump's literal indentation; these only make
// sense against real MediaWiki export formatting
const COMMENT_TAG: &[u8] = b"      <comment>";
const COMMENT_CLOSE_TAG: &[u8] = b"</comment>\n";
const CONTRIBUTOR_TAG: &[u8] = b"      <contributor>";
const CONTRIBUTOR_CLOSE_TAG: &[u8] = b"      </contributor>\n";
const MINOR_TAG: &[u8] = b"      <minor />\n";
const TEXT_START: &[u8] = b"<text";

const SEGMENT_BUF_CAP: usize = 1_000_000;

/// What a successful `read_next` produced. The bytes themselves are read
/// through [`SegmentReader::segment`] so callers can interleave reads on
/// several readers without fighting the borrow of any one of them.
#[derive(Debug, Clone, Copy)]
pub struct NextSegment {
    pub key: SegmentKey,
    pub source: SourceRef,
    /// The input is exhausted; this segment is the trailing remainder.
    pub at_end: bool,
}

pub struct SegmentReader<R> {
    scanner: Scanner<R>,
    seg: Vec<u8>,
    /// View start into `seg`; `cut_meta` shifts it forward.
    seg_start: usize,
    current_key: SegmentKey,
    next_key: SegmentKey,
    source_number: i64,
    last_rev_only: bool,
    limit_to_ns: Option<i64>,
    cut_meta: bool,
}

impl<R: Read> SegmentReader<R> {
    pub fn new(
        source: R,
        source_number: i64,
        last_rev_only: bool,
        limit_to_ns: Option<i64>,
        cut_meta: bool,
    ) -> Result<SegmentReader<R>> {
        Ok(SegmentReader {
            scanner: Scanner::new(source, SEGMENT_BUF_CAP)?,
            seg: Vec::with_capacity(SEGMENT_BUF_CAP),
            seg_start: 0,
            current_key: BEFORE_START,
            next_key: START_KEY,
            source_number,
            last_rev_only,
            limit_to_ns,
            cut_meta,
        })
    }

    /// The bytes of the segment most recently produced by `read_next`.
    pub fn segment(&self) -> &[u8] {
        &self.seg[self.seg_start..]
    }

    pub fn current_key(&self) -> SegmentKey {
        self.current_key
    }

    /// Produce the next segment in source order: the preamble first, then
    /// one segment per `<page>…</page>`, then the trailing remainder.
    pub fn read_next(&mut self) -> Result<NextSegment> {
        let start_offs = self.scanner.offs();
        self.seg.clear();
        self.seg_start = 0;

        let mut found_end = true;
        if self.next_key == PAST_END_KEY {
            // no boundary left; whatever remains becomes the last segment
            self.scanner.consume_to_eof()?;
            found_end = false;
        } else if self.next_key == START_KEY {
            // start of file: stop just before the first <page>
            found_end = self
                .scanner
                .scan_to(PAGE_TAG, false, false)?
                .offset()
                .is_some();
        } else if self.last_rev_only {
            // we've only read up to <id> so far; find either <revision>
            // or </page>
            match self.scanner.scan_to_any(&[REV_TAG, CLOSE_PAGE_TAG], true, false)? {
                None => {
                    // file truncated in page metadata; recoverable
                    tracing::warn!("input ended inside page metadata");
                    found_end = false;
                }
                Some((_, mut which)) => {
                    // keep the metadata (through the first <revision> tag),
                    // then drop whole revisions until </page> is next
                    self.seg.extend_from_slice(self.scanner.content());
                    self.scanner.discard();
                    while which == 0 {
                        match self.scanner.scan_to_any(&[REV_TAG, CLOSE_PAGE_TAG], true, false)? {
                            Some((_, w)) => {
                                which = w;
                                if which == 0 {
                                    self.scanner.discard();
                                }
                            }
                            None => {
                                found_end = false;
                                break;
                            }
                        }
                    }
                }
            }
        } else {
            found_end = self
                .scanner
                .scan_to(CLOSE_PAGE_TAG, true, false)?
                .offset()
                .is_some();
        }

        self.current_key = self.next_key;
        let at_end = !found_end;
        if at_end {
            self.next_key = PAST_END_KEY;
        }

        self.seg.extend_from_slice(self.scanner.content());
        if self.cut_meta {
            self.seg_start = cut_meta(&mut self.seg);
        }
        self.scanner.discard();

        let source = if self.last_rev_only {
            // the emitted bytes no longer correspond to any contiguous
            // range of the input file
            SourceRef::NOT_FOUND
        } else {
            SourceRef::new(self.source_number, start_offs, self.segment().len() as u64)
        };

        if at_end {
            return Ok(NextSegment {
                key: self.current_key,
                source,
                at_end,
            });
        }

        // position next_key: find the next page's <ns> (skipping pages in
        // other namespaces if filtering), then its <id>
        if let Some(want_ns) = self.limit_to_ns {
            loop {
                if self.scanner.scan_to(NS_TAG, true, false)?.offset().is_none() {
                    self.next_key = PAST_END_KEY;
                    return Ok(NextSegment {
                        key: self.current_key,
                        source,
                        at_end,
                    });
                }
                if self.scanner.peek_int()? == want_ns {
                    break;
                }
                // cleanly drop this page and keep looking
                self.scanner.scan_to(CLOSE_PAGE_TAG, true, false)?;
                self.scanner.discard();
            }
        }

        let id_found = self.scanner.scan_to(ID_TAG, true, false)?.offset().is_some();
        self.next_key = self.scanner.peek_int()?;
        if !id_found {
            self.next_key = PAST_END_KEY;
        }

        Ok(NextSegment {
            key: self.current_key,
            source,
            at_end,
        })
    }

    /// Advance until `current_key >= key`. `Some(source)` means the page
    /// with exactly that key was found and [`Self::segment`] holds it;
    /// `None` means it does not exist in this input (skipped, deleted, or
    /// past the end).
    pub fn read_to(&mut self, key: SegmentKey) -> Result<Option<SourceRef>> {
        let mut source = SourceRef::NOT_FOUND;
        while self.current_key < key {
            let next = self.read_next()?;
            source = next.source;
            if next.at_end {
                break;
            }
        }
        if self.current_key == key {
            Ok(Some(source))
        } else {
            Ok(None)
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
}

/// Excise one `start…end` span from `buf[view_start..limit]` by shifting
/// the head forward. There is much less content before the cut targets
/// than after them, so moving the front is the cheap direction.
fn cut_between(
    buf: &mut [u8],
    view_start: usize,
    limit: usize,
    start_pat: &[u8],
    end_pat: &[u8],
) -> usize {
    let region = &buf[view_start..limit];
    if let Some(start_idx) = find(region, start_pat) {
        if let Some(end_idx) = find(region, end_pat) {
            if end_idx >= start_idx {
                let cut = end_idx + end_pat.len() - start_idx;
                buf.copy_within(view_start..view_start + start_idx, view_start + cut);
                return view_start + cut;
            }
        }
    }
    view_start
}

/// Remove `<comment>`, `<contributor>`, and `<minor />` spans from the
/// pre-`<text` part of a segment. Returns the new view start; the backing
/// bytes before it are retained for reuse.
fn cut_meta(seg: &mut [u8]) -> usize {
    let Some(meta_end) = find(seg, TEXT_START) else {
        return 0;
    };
    let mut start = 0;
    start = cut_between(seg, start, meta_end, COMMENT_TAG, COMMENT_CLOSE_TAG);
    start = cut_between(seg, start, meta_end, CONTRIBUTOR_TAG, CONTRIBUTOR_CLOSE_TAG);
    start = cut_between(seg, start, meta_end, MINOR_TAG, MINOR_TAG);
    start
}
