//! Source references: `(source number, start, length)` locators naming a
//! byte range inside one of the pack's reference files. Written as a
//! signed varint followed by two unsigned varints. Negative source
//! numbers are reserved for the special values below.

use std::io::{Read, Write};

use crate::error::Result;
use crate::varint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceRef {
    pub source_number: i64,
    pub start: u64,
    pub length: u64,
}

impl SourceRef {
    /// No reference was available; the diff is against the empty buffer.
    pub const NOT_FOUND: SourceRef = SourceRef {
        source_number: -1,
        start: 0,
        length: 0,
    };

    /// Reserved for diffing against the preceding segment of the output
    /// itself. Defined by the format but never emitted by the encoder;
    /// decoders reject it.
    pub const PREVIOUS_SEGMENT: SourceRef = SourceRef {
        source_number: -2,
        start: 0,
        length: 0,
    };

    /// Terminates the record stream. Cannot collide with a real locator
    /// because zero-length references are rewritten to [`Self::NOT_FOUND`]
    /// before being emitted.
    pub const EOF_MARKER: SourceRef = SourceRef {
        source_number: 0,
        start: 0,
        length: 0,
    };

    pub fn new(source_number: i64, start: u64, length: u64) -> SourceRef {
        SourceRef {
            source_number,
            start,
            length,
        }
    }

    /// Append the varint encoding to a buffer (used by diff workers,
    /// which assemble records in memory).
    pub fn put(&self, out: &mut Vec<u8>) {
        varint::put_varint(out, self.source_number);
        varint::put_uvarint(out, self.start);
        varint::put_uvarint(out, self.length);
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        varint::write_varint(w, self.source_number)?;
        varint::write_uvarint(w, self.start)?;
        varint::write_uvarint(w, self.length)
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<SourceRef> {
        let source_number = varint::read_varint(r, "source number")?;
        let start = varint::read_uvarint(r, "source offset")?;
        let length = varint::read_uvarint(r, "source length")?;
        Ok(SourceRef {
            source_number,
            start,
            length,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn roundtrip() {
        for sr in [
            SourceRef::new(3, 123_456, 789),
            SourceRef::NOT_FOUND,
            SourceRef::PREVIOUS_SEGMENT,
            SourceRef::EOF_MARKER,
            SourceRef::new(0, u64::MAX, u64::MAX),
        ] {
            let mut buf = Vec::new();
            sr.put(&mut buf);
            let got = SourceRef::read_from(&mut Cursor::new(buf)).unwrap();
            assert_eq!(got, sr);
        }
    }

    #[test]
    fn eof_marker_is_three_zero_bytes() {
        let mut buf = Vec::new();
        SourceRef::EOF_MARKER.put(&mut buf);
        assert_eq!(buf, [0, 0, 0]);
    }

    #[test]
    fn truncated_ref_is_an_error() {
        let mut buf = Vec::new();
        SourceRef::new(1, 500, 10).put(&mut buf);
        buf.pop();
        buf.pop();
        assert!(SourceRef::read_from(&mut Cursor::new(buf)).is_err());
    }
}
