//! Request accumulation and parsing.
//!
//! A request is a single line: the path to fetch, followed by `\r\n` or `\n`.
//! Bytes may arrive in arbitrarily small pieces, so the terminator is searched
//! for across everything accumulated so far on every read.

use bytes::{Bytes, BytesMut};
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

/// Room reserved after the longest path for a two-byte terminator.
pub const TERMINATOR_ROOM: usize = 2;

/// Outcome of scanning the accumulated request bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseResult {
    /// No terminator yet and there is still room for more bytes.
    Incomplete,
    /// Terminator found; the path occupies the first `path_len` bytes.
    Complete { path_len: usize },
    /// The path cannot fit within the allowed length.
    TooLong,
}

/// Fixed-capacity accumulator for the request line.
#[derive(Debug)]
pub struct RequestBuf {
    data: BytesMut,
    filled: usize,
    max_path_len: usize,
}

impl RequestBuf {
    pub fn new(max_path_len: usize) -> Self {
        Self {
            data: BytesMut::zeroed(max_path_len + TERMINATOR_ROOM),
            filled: 0,
            max_path_len,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn is_full(&self) -> bool {
        self.filled == self.capacity()
    }

    /// Unfilled tail of the buffer, for the next socket read.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.filled..]
    }

    /// Record `n` bytes read into `spare_mut()`.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(self.filled + n <= self.capacity());
        self.filled = (self.filled + n).min(self.capacity());
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    pub fn parse(&self) -> ParseResult {
        match find_terminator(self.as_bytes()) {
            Some(pos) if pos > self.max_path_len => ParseResult::TooLong,
            Some(pos) => ParseResult::Complete { path_len: pos },
            None if self.is_full() => ParseResult::TooLong,
            None => ParseResult::Incomplete,
        }
    }

    /// Consume the buffer, keeping only the first `path_len` bytes.
    pub fn into_path(mut self, path_len: usize) -> Bytes {
        self.data.truncate(path_len.min(self.filled));
        self.data.freeze()
    }
}

/// Position of the line terminator: the first `\r\n`, otherwise the first `\n`.
pub fn find_terminator(buffer: &[u8]) -> Option<usize> {
    find_crlf(buffer).or_else(|| buffer.iter().position(|&b| b == b'\n'))
}

/// Find \r\n in buffer, returning the position of \r.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    (0..buffer.len().saturating_sub(1)).find(|&i| buffer[i] == b'\r' && buffer[i + 1] == b'\n')
}

/// Interpret raw request bytes as a filesystem path.
pub fn path_from_bytes(raw: &[u8]) -> PathBuf {
    PathBuf::from(OsStr::from_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(buf: &mut RequestBuf, bytes: &[u8]) {
        buf.spare_mut()[..bytes.len()].copy_from_slice(bytes);
        buf.commit(bytes.len());
    }

    #[test]
    fn test_find_terminator() {
        assert_eq!(find_terminator(b"file.txt\r\n"), Some(8));
        assert_eq!(find_terminator(b"file.txt\n"), Some(8));
        assert_eq!(find_terminator(b"file.txt\r"), None);
        assert_eq!(find_terminator(b""), None);
        // A later CRLF wins over an earlier bare LF.
        assert_eq!(find_terminator(b"a\nb\r\n"), Some(3));
    }

    #[test]
    fn test_split_terminator() {
        let mut buf = RequestBuf::new(256);
        for piece in [&b"rep"[..], b"ort.txt", b"\r"] {
            fill(&mut buf, piece);
            assert_eq!(buf.parse(), ParseResult::Incomplete);
        }
        fill(&mut buf, b"\n");
        assert_eq!(buf.parse(), ParseResult::Complete { path_len: 10 });
        assert_eq!(&buf.into_path(10)[..], b"report.txt");
    }

    #[test]
    fn test_exact_max_length() {
        let mut buf = RequestBuf::new(8);
        assert_eq!(buf.capacity(), 10);
        fill(&mut buf, b"abcdefgh\r\n");
        assert!(buf.is_full());
        assert_eq!(buf.parse(), ParseResult::Complete { path_len: 8 });
    }

    #[test]
    fn test_one_byte_too_long() {
        let mut buf = RequestBuf::new(8);
        fill(&mut buf, b"abcdefghi\n");
        assert_eq!(buf.parse(), ParseResult::TooLong);

        let mut buf = RequestBuf::new(8);
        fill(&mut buf, b"abcdefghi\r");
        assert_eq!(buf.parse(), ParseResult::TooLong);
    }

    #[test]
    fn test_empty_path() {
        let mut buf = RequestBuf::new(8);
        fill(&mut buf, b"\r\n");
        assert_eq!(buf.parse(), ParseResult::Complete { path_len: 0 });
    }

    #[test]
    fn test_path_from_bytes() {
        assert_eq!(path_from_bytes(b"dir/file.bin"), PathBuf::from("dir/file.bin"));
    }
}
