// SPDX-License-Identifier: MPL-2.0
//! # dltp
//!
//! Pack and unpack MediaWiki XML dumps as *delta packs*: given a new dump
//! and one or more older reference dumps, emit a compact stream of
//! per-page binary diffs against whichever reference contains each page,
//! and later reconstruct the new dump byte-for-byte from the delta plus
//! those references. Successive MediaWiki snapshots overlap enormously,
//! which is the entire trick.
//!
//! ## Pipeline
//!
//! Encoding: the [`chunk`] module splits the new dump into per-page
//! segments keyed by `<id>` (byte-level scanning via [`scan`], not an
//! XML parser; dumps are tens of GB and the schema is stable). For each
//! segment, the matching page is located in the references, and a
//! [`diff`] task is handed to a worker pool; [`dpfile::DpWriter`] drains
//! results strictly in submission order, so output is identical for any
//! worker count.
//!
//! Decoding: [`dpfile::DpReader`] validates the preamble, opens the named
//! references, and per record fetches the referenced slice (`ReadAt`,
//! possibly into a compressed file via the [`bz2`] block index), applies
//! the diff, and verifies checksums on both sides.
//!
//! ## Example
//!
//! ```no_run
//! use dltp::dpfile::{DpWriter, DpReader, PackOptions};
//!
//! fn main() -> dltp::Result<()> {
//!     let out = std::fs::File::create("enwiki-new.dltp")?;
//!     let sources = vec![
//!         (dltp::zip::open("enwiki-new.xml".as_ref())?, "enwiki-new.xml".to_owned()),
//!         (dltp::zip::open("enwiki-old.xml".as_ref())?, "enwiki-old.xml".to_owned()),
//!     ];
//!     let mut writer = DpWriter::new(out, sources, PackOptions::default())?;
//!     while writer.write_segment()? {}
//!     writer.close()?;
//!
//!     let pack = std::io::BufReader::new(std::fs::File::open("enwiki-new.dltp")?);
//!     let mut reader = DpReader::new(pack, ".".as_ref(), false, false)?;
//!     while reader.read_segment()? {}
//!     reader.close()
//! }
//! ```
//!
//! ## Format stability
//!
//! The delta-pack format is explicitly unstable across versions: a
//! mismatched format-URL line in the preamble is a hard error, and if it
//! looks like a URL it is reported as a pointer to the newer tool.

pub mod bz2;
pub mod chunk;
pub mod diff;
pub mod dpfile;
mod error;
pub mod fnv;
pub mod merge;
pub mod scan;
pub mod sourceref;
pub mod stream;
pub mod varint;
pub mod zip;

pub use error::{Error, Result};
