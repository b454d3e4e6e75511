use std::io;

/// Errors raised anywhere in the pack/unpack pipeline.
///
/// The crate is fail-fast: none of these are recovered below `main`. A
/// corrupted reference or a truncated diff cannot be continued past safely,
/// so every layer propagates upward and the binary decides fatality.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Input ended where more bytes were required (mid-varint, mid-diff,
    /// mid-reference).
    #[error("unexpected end of input: {0}")]
    Truncated(&'static str),

    /// The input exists but does not look like what it claims to be:
    /// bad preamble lines, unsafe filenames, unknown source numbers,
    /// unknown compression formats.
    #[error("{0}")]
    Format(String),

    /// A segment names a reference slice longer than the decoder is
    /// willing to materialize.
    #[error("segment uses a {0}-byte source (limit {1})")]
    SizeExceeded(u64, u64),

    /// A stored checksum disagrees with the recomputed one. The message
    /// says which side is suspect; `dltp-error-report.txt` holds the
    /// evidence.
    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),

    /// Malformed bzip2 data: bad magic, invalid Huffman lengths,
    /// out-of-range pointers, oversized RLE repeats.
    #[error("bzip2 data invalid: {0}")]
    Structural(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for io::Error {
    fn from(e: Error) -> io::Error {
        match e {
            Error::Io(e) => e,
            Error::Truncated(what) => io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("unexpected end of input: {what}"),
            ),
            other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
        }
    }
}
