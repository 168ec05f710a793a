//! Framing codec for JSON-RPC over a byte stream.
//!
//! Two encodings are in use by MCP servers in the wild:
//! - Length-prefixed: `Content-Length: <n>\r\n\r\n<n bytes of JSON>`
//! - Newline-delimited: one JSON document per line
//!
//! [`Framing::Auto`] decodes either, deciding per frame by probing for a
//! `content-length:` header. A newline-framed payload that literally starts
//! with that text is misread as a header; this ambiguity is accepted.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default maximum size of a single decoded payload (4 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Default maximum number of buffered, not-yet-decoded bytes (8 MiB).
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 8 * 1024 * 1024;

/// How many leading bytes the auto mode inspects for a header.
const AUTO_PROBE_BYTES: usize = 32;

const HEADER_PREFIX: &[u8] = b"content-length:";
const HEADER_SEPARATOR: &[u8] = b"\r\n\r\n";

// ─── Framing ─────────────────────────────────────────────────────────────────

/// Wire framing for a stdio connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    /// Detect per incoming frame; negotiate outgoing framing at connect time.
    #[default]
    Auto,
    #[serde(alias = "content-length", alias = "length_prefixed")]
    LengthPrefixed,
    #[serde(alias = "ndjson", alias = "jsonl", alias = "line")]
    Newline,
}

impl Framing {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::LengthPrefixed => "length-prefixed",
            Self::Newline => "newline",
        }
    }
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Size limits enforced by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameLimits {
    pub max_frame_bytes: usize,
    pub max_buffer_bytes: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
        }
    }
}

/// Fatal decoding errors. Each one is a protocol violation by the peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("invalid frame header: {reason}")]
    InvalidHeader { reason: String },

    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("buffered {size} bytes exceeds limit of {limit} bytes")]
    BufferOverflow { size: usize, limit: usize },

    #[error("frame payload is not valid UTF-8")]
    InvalidUtf8,
}

// ─── Encoding ────────────────────────────────────────────────────────────────

/// Frame an already-serialized JSON payload.
///
/// `Auto` encodes as length-prefixed, the first negotiation candidate.
pub fn encode(payload: &str, framing: Framing) -> Vec<u8> {
    match framing {
        Framing::Newline => {
            let mut out = Vec::with_capacity(payload.len() + 1);
            out.extend_from_slice(payload.as_bytes());
            out.push(b'\n');
            out
        }
        Framing::LengthPrefixed | Framing::Auto => {
            let header = format!("Content-Length: {}\r\n\r\n", payload.len());
            let mut out = Vec::with_capacity(header.len() + payload.len());
            out.extend_from_slice(header.as_bytes());
            out.extend_from_slice(payload.as_bytes());
            out
        }
    }
}

/// Serialize and frame a message.
pub fn encode_message<T: Serialize>(
    message: &T,
    framing: Framing,
) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_string(message)?;
    Ok(encode(&json, framing))
}

// ─── Decoding ────────────────────────────────────────────────────────────────

/// Incremental decoder. Feed it chunks as they arrive; pull whole payloads.
#[derive(Debug)]
pub struct FrameDecoder {
    framing: Framing,
    limits: FrameLimits,
    buf: Vec<u8>,
}

/// Outcome of a single extraction attempt.
enum Step {
    Frame(String),
    /// A separator was consumed; try again.
    Skip,
    NeedMore,
}

impl FrameDecoder {
    pub fn new(framing: Framing, limits: FrameLimits) -> Self {
        Self {
            framing,
            limits,
            buf: Vec::new(),
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Bytes currently held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Append a chunk without extracting anything.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<(), FramingError> {
        let size = self.buf.len() + chunk.len();
        if size > self.limits.max_buffer_bytes {
            self.buf.clear();
            return Err(FramingError::BufferOverflow {
                size,
                limit: self.limits.max_buffer_bytes,
            });
        }
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    /// Extract the next complete payload, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<String>, FramingError> {
        loop {
            let step = match self.framing {
                Framing::LengthPrefixed => self.extract_length_prefixed()?,
                Framing::Newline => self.extract_line()?,
                Framing::Auto => self.extract_auto()?,
            };
            match step {
                Step::Frame(payload) => return Ok(Some(payload)),
                Step::Skip => continue,
                Step::NeedMore => return Ok(None),
            }
        }
    }

    /// Append `chunk` and greedily extract every complete payload.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, FramingError> {
        self.feed(chunk)?;
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn extract_auto(&mut self) -> Result<Step, FramingError> {
        let leading = self
            .buf
            .iter()
            .take_while(|b| **b == b'\r' || **b == b'\n')
            .count();
        if leading > 0 {
            self.buf.drain(..leading);
        }
        if self.buf.is_empty() {
            return Ok(Step::NeedMore);
        }

        let probe_len = self.buf.len().min(AUTO_PROBE_BYTES);
        let probe = self.buf[..probe_len].to_ascii_lowercase();

        if probe.starts_with(HEADER_PREFIX) {
            return self.extract_length_prefixed();
        }
        // Too short to tell a header from a JSON line yet.
        if probe.len() < HEADER_PREFIX.len() && HEADER_PREFIX.starts_with(&probe) {
            return Ok(Step::NeedMore);
        }
        self.extract_line()
    }

    fn extract_length_prefixed(&mut self) -> Result<Step, FramingError> {
        let Some(sep) = find(&self.buf, HEADER_SEPARATOR) else {
            if self.buf.len() > self.limits.max_frame_bytes {
                let size = self.buf.len();
                self.buf.clear();
                return Err(FramingError::FrameTooLarge {
                    size,
                    limit: self.limits.max_frame_bytes,
                });
            }
            return Ok(Step::NeedMore);
        };
        let body_start = sep + HEADER_SEPARATOR.len();

        let length = match parse_content_length(&self.buf[..sep]) {
            Ok(length) => length,
            Err(e) => {
                // Drop the unusable header block so the next frame can decode.
                self.buf.drain(..body_start);
                return Err(e);
            }
        };

        if length > self.limits.max_frame_bytes {
            self.buf.clear();
            return Err(FramingError::FrameTooLarge {
                size: length,
                limit: self.limits.max_frame_bytes,
            });
        }

        if self.buf.len() < body_start + length {
            return Ok(Step::NeedMore);
        }

        let body: Vec<u8> = self.buf.drain(..body_start + length).skip(body_start).collect();
        let payload = String::from_utf8(body).map_err(|_| FramingError::InvalidUtf8)?;
        Ok(Step::Frame(payload))
    }

    fn extract_line(&mut self) -> Result<Step, FramingError> {
        let Some(nl) = self.buf.iter().position(|b| *b == b'\n') else {
            if self.buf.len() > self.limits.max_frame_bytes {
                let size = self.buf.len();
                self.buf.clear();
                return Err(FramingError::FrameTooLarge {
                    size,
                    limit: self.limits.max_frame_bytes,
                });
            }
            return Ok(Step::NeedMore);
        };

        let line: Vec<u8> = self.buf.drain(..=nl).collect();
        let line = String::from_utf8(line).map_err(|_| FramingError::InvalidUtf8)?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(Step::Skip);
        }
        if trimmed.len() > self.limits.max_frame_bytes {
            return Err(FramingError::FrameTooLarge {
                size: trimmed.len(),
                limit: self.limits.max_frame_bytes,
            });
        }
        Ok(Step::Frame(trimmed.to_string()))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Parse the `Content-Length` value out of a header block.
fn parse_content_length(header: &[u8]) -> Result<usize, FramingError> {
    let text = std::str::from_utf8(header).map_err(|_| FramingError::InvalidHeader {
        reason: "header is not valid UTF-8".into(),
    })?;

    for line in text.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            return value
                .trim()
                .parse::<usize>()
                .map_err(|_| FramingError::InvalidHeader {
                    reason: format!("malformed content-length '{}'", value.trim()),
                });
        }
    }

    Err(FramingError::InvalidHeader {
        reason: "missing content-length".into(),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const MSG: &str = r#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#;

    fn decoder(framing: Framing) -> FrameDecoder {
        FrameDecoder::new(framing, FrameLimits::default())
    }

    #[test]
    fn test_encode_length_prefixed() {
        let bytes = encode("{}", Framing::LengthPrefixed);
        assert_eq!(bytes, b"Content-Length: 2\r\n\r\n{}");
    }

    #[test]
    fn test_encode_counts_bytes_not_chars() {
        let payload = r#"{"text":"héllo"}"#;
        let bytes = encode(payload, Framing::LengthPrefixed);
        let header = format!("Content-Length: {}\r\n\r\n", payload.len());
        assert!(bytes.starts_with(header.as_bytes()));
        assert_eq!(payload.len(), payload.chars().count() + 1);
    }

    #[test]
    fn test_encode_newline() {
        assert_eq!(encode("{}", Framing::Newline), b"{}\n");
    }

    #[test]
    fn test_round_trip_both_framings() {
        let value: serde_json::Value = serde_json::from_str(MSG).unwrap();
        for framing in [Framing::LengthPrefixed, Framing::Newline] {
            let bytes = encode_message(&value, framing).unwrap();
            let frames = decoder(framing).push(&bytes).unwrap();
            assert_eq!(frames.len(), 1, "{framing}");
            let decoded: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
            assert_eq!(decoded, value, "{framing}");
        }
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut bytes = encode(MSG, Framing::LengthPrefixed);
        bytes.extend(encode("{\"id\":2}", Framing::LengthPrefixed));
        let frames = decoder(Framing::LengthPrefixed).push(&bytes).unwrap();
        assert_eq!(frames, vec![MSG.to_string(), "{\"id\":2}".to_string()]);
    }

    #[test]
    fn test_split_at_every_offset() {
        for framing in [Framing::LengthPrefixed, Framing::Newline] {
            let bytes = encode(MSG, framing);
            for split in 0..=bytes.len() {
                let mut dec = decoder(Framing::Auto);
                let mut frames = dec.push(&bytes[..split]).unwrap();
                frames.extend(dec.push(&bytes[split..]).unwrap());
                assert_eq!(frames, vec![MSG.to_string()], "{framing} split at {split}");
                assert_eq!(dec.buffered(), 0);
            }
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let bytes = encode(MSG, Framing::LengthPrefixed);
        let mut dec = decoder(Framing::LengthPrefixed);
        let mut frames = Vec::new();
        for b in &bytes {
            frames.extend(dec.push(std::slice::from_ref(b)).unwrap());
        }
        assert_eq!(frames, vec![MSG.to_string()]);
    }

    #[test]
    fn test_header_is_case_insensitive_and_tolerates_extra_headers() {
        let bytes = format!(
            "content-type: application/json\r\nCONTENT-LENGTH:  {}\r\n\r\n{MSG}",
            MSG.len()
        );
        let frames = decoder(Framing::LengthPrefixed)
            .push(bytes.as_bytes())
            .unwrap();
        assert_eq!(frames, vec![MSG.to_string()]);
    }

    #[test]
    fn test_missing_content_length_is_invalid_header() {
        let mut dec = decoder(Framing::LengthPrefixed);
        let err = dec.push(b"Content-Type: json\r\n\r\n{}").unwrap_err();
        assert!(matches!(err, FramingError::InvalidHeader { .. }));
    }

    #[test]
    fn test_malformed_content_length_is_invalid_header() {
        let mut dec = decoder(Framing::LengthPrefixed);
        let err = dec.push(b"Content-Length: abc\r\n\r\n{}").unwrap_err();
        assert!(matches!(err, FramingError::InvalidHeader { .. }));
    }

    #[test]
    fn test_newline_skips_blank_lines_and_trims() {
        let frames = decoder(Framing::Newline)
            .push(b"\n\r\n  {\"a\":1}  \r\n\n{\"b\":2}\n")
            .unwrap();
        assert_eq!(frames, vec!["{\"a\":1}".to_string(), "{\"b\":2}".to_string()]);
    }

    #[test]
    fn test_partial_line_stays_buffered() {
        let mut dec = decoder(Framing::Newline);
        assert!(dec.push(b"{\"a\":").unwrap().is_empty());
        assert_eq!(dec.buffered(), 5);
        assert_eq!(dec.push(b"1}\n").unwrap(), vec!["{\"a\":1}".to_string()]);
    }

    #[test]
    fn test_auto_handles_both_modes_across_connections() {
        // One decoder per connection attempt, one mode per connection.
        let mut first = decoder(Framing::Auto);
        let mut stream = encode(MSG, Framing::LengthPrefixed);
        stream.extend(encode("{\"id\":2}", Framing::LengthPrefixed));
        assert_eq!(first.push(&stream).unwrap().len(), 2);

        let mut second = decoder(Framing::Auto);
        let mut stream = encode(MSG, Framing::Newline);
        stream.extend(encode("{\"id\":2}", Framing::Newline));
        assert_eq!(
            second.push(&stream).unwrap(),
            vec![MSG.to_string(), "{\"id\":2}".to_string()]
        );
    }

    #[test]
    fn test_auto_drops_separators_between_length_frames() {
        let mut stream = encode(MSG, Framing::LengthPrefixed);
        stream.extend_from_slice(b"\r\n");
        stream.extend(encode(MSG, Framing::LengthPrefixed));
        let frames = decoder(Framing::Auto).push(&stream).unwrap();
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn test_auto_waits_on_ambiguous_prefix() {
        let mut dec = decoder(Framing::Auto);
        assert!(dec.push(b"Content-Le").unwrap().is_empty());
        let rest = format!("ngth: {}\r\n\r\n{MSG}", MSG.len());
        assert_eq!(dec.push(rest.as_bytes()).unwrap(), vec![MSG.to_string()]);
    }

    #[test]
    fn test_auto_ambiguity_is_preserved() {
        // A newline payload that starts with the header text is read as a header.
        let mut dec = decoder(Framing::Auto);
        let emitted = dec.push(b"content-length: maybe json\n").map(|f| f.len());
        assert_eq!(emitted, Ok(0), "waits for a header separator instead of emitting a line");
    }

    #[test]
    fn test_oversized_declared_length_is_rejected_and_cleared() {
        let limits = FrameLimits {
            max_frame_bytes: 16,
            max_buffer_bytes: 1024,
        };
        let mut dec = FrameDecoder::new(Framing::LengthPrefixed, limits);
        let err = dec.push(b"Content-Length: 17\r\n\r\n").unwrap_err();
        assert_eq!(err, FramingError::FrameTooLarge { size: 17, limit: 16 });
        assert_eq!(dec.buffered(), 0);
    }

    #[test]
    fn test_oversized_line_is_rejected_and_cleared() {
        let limits = FrameLimits {
            max_frame_bytes: 8,
            max_buffer_bytes: 1024,
        };
        let mut dec = FrameDecoder::new(Framing::Newline, limits);
        let err = dec.push(b"0123456789").unwrap_err();
        assert!(matches!(err, FramingError::FrameTooLarge { .. }));
        assert_eq!(dec.buffered(), 0);
    }

    #[test]
    fn test_buffer_overflow_is_rejected_and_cleared() {
        let limits = FrameLimits {
            max_frame_bytes: 64,
            max_buffer_bytes: 32,
        };
        let mut dec = FrameDecoder::new(Framing::LengthPrefixed, limits);
        dec.push(b"Content-Length: 60\r\n\r\n").unwrap();
        let err = dec.push(&[b'x'; 20]).unwrap_err();
        assert!(matches!(err, FramingError::BufferOverflow { limit: 32, .. }));
        assert_eq!(dec.buffered(), 0);
    }

    #[test]
    fn test_decoder_recovers_after_invalid_header() {
        let mut dec = decoder(Framing::LengthPrefixed);
        assert!(dec.push(b"X-Bogus: 1\r\n\r\n").is_err());
        let frames = dec.push(&encode(MSG, Framing::LengthPrefixed)).unwrap();
        assert_eq!(frames, vec![MSG.to_string()]);
    }

    #[test]
    fn test_framing_serde_names() {
        let f: Framing = serde_json::from_str("\"length-prefixed\"").unwrap();
        assert_eq!(f, Framing::LengthPrefixed);
        let f: Framing = serde_json::from_str("\"content-length\"").unwrap();
        assert_eq!(f, Framing::LengthPrefixed);
        let f: Framing = serde_json::from_str("\"ndjson\"").unwrap();
        assert_eq!(f, Framing::Newline);
        assert_eq!(Framing::default(), Framing::Auto);
    }
}
