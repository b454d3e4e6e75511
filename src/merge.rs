//! Interleave several dumps into one, newest first: every page key is
//! emitted once, taken from the earliest-listed input that has it.

use std::io::{Read, Write};

use crate::chunk::{SegmentKey, SegmentReader, BEFORE_START, PAST_END_KEY};
use crate::error::Result;

pub fn merge<R: Read, W: Write>(readers: &mut [SegmentReader<R>], out: &mut W) -> Result<()> {
    let mut keys: Vec<SegmentKey> = vec![BEFORE_START; readers.len()];
    let mut last_key = BEFORE_START;
    loop {
        // advance every input past the key we just emitted
        for (reader, key) in readers.iter_mut().zip(keys.iter_mut()) {
            while *key <= last_key {
                *key = reader.read_next()?.key;
            }
        }
        last_key = keys.iter().copied().min().unwrap_or(PAST_END_KEY);
        // the earliest-listed input holding the lowest key wins
        for (reader, key) in readers.iter().zip(keys.iter()) {
            if *key == last_key {
                out.write_all(reader.segment())?;
                break;
            }
        }
        if last_key == PAST_END_KEY {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn page(id: i64, text: &str) -> String {
        format!(
            "  <page>\n    <title>P{id}</title>\n    <ns>0</ns>\n    <id>{id}</id>\n    <revision>\n      <text>{text}</text>\n    </revision>\n  </page>\n"
        )
    }

    fn dump(pages: &[String]) -> String {
        let mut d = String::from("<head>\n");
        for p in pages {
            d.push_str(p);
        }
        d.push_str("</tail>\n");
        d
    }

    fn reader(xml: &str) -> SegmentReader<Cursor<Vec<u8>>> {
        SegmentReader::new(Cursor::new(xml.as_bytes().to_vec()), 0, false, None, false).unwrap()
    }

    #[test]
    fn overlapping_inputs_prefer_the_first() {
        let newer = dump(&[page(5, "five new"), page(9, "nine new")]);
        let older = dump(&[page(5, "five old"), page(7, "seven old")]);
        let mut readers = vec![reader(&newer), reader(&older)];
        let mut out = Vec::new();
        merge(&mut readers, &mut out).unwrap();
        let merged = String::from_utf8(out).unwrap();

        assert!(merged.contains("five new"));
        assert!(!merged.contains("five old"));
        assert!(merged.contains("seven old"));
        assert!(merged.contains("nine new"));
        // each page exactly once
        assert_eq!(merged.matches("<id>5</id>").count(), 1);
        assert_eq!(merged.matches("<id>7</id>").count(), 1);
        assert_eq!(merged.matches("<id>9</id>").count(), 1);
    }

    #[test]
    fn single_input_passes_through() {
        let d = dump(&[page(2, "two"), page(4, "four")]);
        let mut readers = vec![reader(&d)];
        let mut out = Vec::new();
        merge(&mut readers, &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), d);
    }
}
