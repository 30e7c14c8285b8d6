//! Newline-delimited text codec for `tokio_util` framing.
//!
//! Lines end in `\n`; a preceding `\r` is stripped. Lines longer than
//! the configured maximum are rejected instead of buffered forever. Bytes
//! that are not UTF-8 decode to U+FFFD so the line still reaches the
//! protocol parsers, which answer it in-band.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::RemoteError;

/// Default upper bound for one line, terminator excluded.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct LineCodec {
    max_length: usize,
    /// Bytes already scanned for a terminator.
    next_index: usize,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    fn finish_line(&self, mut raw: BytesMut) -> String {
        if raw.last() == Some(&b'\n') {
            raw.truncate(raw.len() - 1);
        }
        if raw.last() == Some(&b'\r') {
            raw.truncate(raw.len() - 1);
        }
        String::from_utf8_lossy(&raw).into_owned()
    }

    fn too_long(&self, size: usize) -> RemoteError {
        RemoteError::LineTooLong {
            size,
            max: self.max_length,
        }
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = RemoteError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let found = src[self.next_index..].iter().position(|b| *b == b'\n');
        match found {
            Some(offset) => {
                let end = self.next_index + offset;
                self.next_index = 0;
                let content = content_length(&src[..end]);
                if content > self.max_length {
                    return Err(self.too_long(content));
                }
                let raw = src.split_to(end + 1);
                Ok(Some(self.finish_line(raw)))
            }
            None => {
                // A trailing `\r` may still turn out to be half a terminator.
                let content = content_length(&src[..]);
                if content > self.max_length {
                    return Err(self.too_long(content));
                }
                self.next_index = src.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if src.is_empty() {
            return Ok(None);
        }
        // Unterminated trailing line.
        self.next_index = 0;
        let raw = src.split_to(src.len());
        Ok(Some(self.finish_line(raw)))
    }
}

/// Length of `line` without a trailing `\r`.
fn content_length(line: &[u8]) -> usize {
    match line.last() {
        Some(b'\r') => line.len() - 1,
        _ => line.len(),
    }
}

impl Encoder<String> for LineCodec {
    type Error = RemoteError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.contains('\n') {
            return Err(RemoteError::Malformed(
                "outbound line contains a newline".into(),
            ));
        }
        dst.reserve(item.len() + 1);
        dst.put_slice(item.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_lines_and_strips_carriage_return() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"PAIR\r\nCONN\npartial"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("PAIR"));
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("CONN"));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b" line\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap().as_deref(),
            Some("partial line")
        );
    }

    #[test]
    fn empty_line_is_a_line() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some(""));
    }

    #[test]
    fn rejects_overlong_line() {
        let mut codec = LineCodec::with_max_length(4);
        let mut buf = BytesMut::from(&b"abcdefgh"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(RemoteError::LineTooLong { max: 4, .. })
        ));
    }

    #[test]
    fn max_length_line_with_crlf_is_accepted() {
        let mut codec = LineCodec::with_max_length(4);
        let mut buf = BytesMut::from(&b"abcd\r\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("abcd"));
    }

    #[test]
    fn eof_yields_trailing_partial_line() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"123456"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(
            codec.decode_eof(&mut buf).unwrap().as_deref(),
            Some("123456")
        );
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn one_past_max_length_is_rejected() {
        let mut codec = LineCodec::with_max_length(8);
        let mut buf = BytesMut::from(&b"123456789\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(RemoteError::LineTooLong { size: 9, max: 8 })
        ));

        // Unterminated, too: nine content bytes can never fit.
        let mut codec = LineCodec::with_max_length(8);
        let mut buf = BytesMut::from(&b"123456789"[..]);
        assert!(codec.decode(&mut buf).is_err());

        // A dangling `\r` is not content yet.
        let mut codec = LineCodec::with_max_length(8);
        let mut buf = BytesMut::from(&b"12345678\r"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap().as_deref(),
            Some("12345678")
        );
    }

    #[test]
    fn invalid_utf8_is_replaced_not_fatal() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&[0xff, 0xfe, b'\n', b'O', b'K', b'\n'][..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap().as_deref(),
            Some("\u{fffd}\u{fffd}")
        );
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("OK"));
    }

    #[test]
    fn encode_appends_terminator() {
        let mut codec = LineCodec::new();
        let mut dst = BytesMut::new();
        codec.encode("READY".to_string(), &mut dst).unwrap();
        assert_eq!(&dst[..], b"READY\n");
        assert!(codec.encode("a\nb".to_string(), &mut dst).is_err());
    }
}
