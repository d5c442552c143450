//! Newline-delimited JSON codec for the agent's stdio streams.
//!
//! Framing is delegated to [`LinesCodec`] with a per-line ceiling. A line
//! that cannot be turned into a JSON object is logged and dropped; the
//! decoder moves on to the next line instead of failing the stream. Only
//! I/O errors on the underlying reader end a [`FramedRead`] built on this
//! codec.
//!
//! [`FramedRead`]: tokio_util::codec::FramedRead

use bytes::BytesMut;
use serde::Serialize;
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};
use tracing::{trace, warn};

use crate::error::{Error, Result};

/// Maximum accepted inbound line: 16 MiB.
///
/// Agents embed whole file contents and images in single messages, so the
/// ceiling is generous.
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Codec turning ND-JSON lines into [`Value`] objects and back.
#[derive(Debug)]
pub struct AcpCodec {
    lines: LinesCodec,
}

impl AcpCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_BYTES)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_length),
        }
    }

    fn next_message(
        &mut self,
        src: &mut BytesMut,
        eof: bool,
    ) -> Result<Option<Value>> {
        loop {
            let line = if eof {
                self.lines.decode_eof(src)
            } else {
                self.lines.decode(src)
            };

            match line {
                Ok(Some(line)) => {
                    if let Some(value) = parse_line(&line) {
                        return Ok(Some(value));
                    }
                }
                Ok(None) => return Ok(None),
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    warn!("Dropping inbound line longer than the codec limit");
                }
                // LinesCodec reports invalid UTF-8 as InvalidData after consuming the line
                Err(LinesCodecError::Io(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
                    warn!("Dropping inbound line with invalid UTF-8: {}", e);
                }
                Err(LinesCodecError::Io(e)) => return Err(Error::Io(e)),
            }
        }
    }
}

impl Default for AcpCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse one framed line. Returns None for lines that should be skipped.
///
/// Some agents print log text before a JSON payload on the same line, so a
/// failed parse is retried from the first `{`.
pub fn parse_line(line: &str) -> Option<Value> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    trace!("<- {}", trimmed);

    let parsed = match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => Some(value),
        Err(first_err) => match trimmed.find('{') {
            Some(start) if start > 0 => serde_json::from_str::<Value>(&trimmed[start..]).ok(),
            _ => {
                warn!("Dropping malformed inbound line: {}", first_err);
                return None;
            }
        },
    };

    match parsed {
        Some(value) if value.is_object() => Some(value),
        Some(_) => {
            warn!("Dropping non-object inbound line: {}", truncate_for_log(trimmed));
            None
        }
        None => {
            warn!("Dropping malformed inbound line: {}", truncate_for_log(trimmed));
            None
        }
    }
}

fn truncate_for_log(line: &str) -> &str {
    const MAX: usize = 200;
    if line.len() <= MAX {
        return line;
    }
    let mut end = MAX;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    &line[..end]
}

impl Decoder for AcpCodec {
    type Item = Value;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>> {
        self.next_message(src, false)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Value>> {
        self.next_message(src, true)
    }
}

impl<T: Serialize> Encoder<T> for AcpCodec {
    type Error = Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<()> {
        // Compact serde_json output never contains a raw newline
        let line = serde_json::to_string(&item)?;
        trace!("-> {}", line);
        dst.reserve(line.len() + 1);
        dst.extend_from_slice(line.as_bytes());
        dst.extend_from_slice(b"\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;
    use tokio_util::codec::FramedRead;

    #[test]
    fn test_decode_two_messages_in_one_chunk() {
        let mut codec = AcpCodec::new();
        let mut buf = BytesMut::from(&b"{\"id\":1}\n{\"id\":2}\n"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(json!({"id": 1})));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(json!({"id": 2})));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_malformed_line_is_dropped() {
        let mut codec = AcpCodec::new();
        let mut buf = BytesMut::from(&b"{not json\n\n42\n{\"id\":3}\n"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(json!({"id": 3})));
    }

    #[test]
    fn test_log_prefix_is_stripped() {
        assert_eq!(
            parse_line("[agent] ready {\"jsonrpc\":\"2.0\",\"method\":\"x\"}"),
            Some(json!({"jsonrpc": "2.0", "method": "x"}))
        );
        assert_eq!(parse_line("   "), None);
    }

    #[test]
    fn test_overlong_line_is_skipped() {
        let mut codec = AcpCodec::with_max_length(16);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"{\"padding\":\"aaaaaaaaaaaaaaaaaaaaaaaa\"}\n");
        buf.extend_from_slice(b"{\"id\":4}\n");

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(json!({"id": 4})));
    }

    #[test]
    fn test_invalid_utf8_line_is_skipped() {
        let mut codec = AcpCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0xff, 0xfe, b'\n']);
        buf.extend_from_slice(b"{\"id\":5}\n");

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(json!({"id": 5})));
    }

    #[test]
    fn test_encode_appends_newline() {
        let mut codec = AcpCodec::new();
        let mut dst = BytesMut::new();
        codec
            .encode(json!({"jsonrpc": "2.0", "method": "session/cancel"}), &mut dst)
            .unwrap();

        assert!(dst.ends_with(b"\n"));
        assert_eq!(dst.iter().filter(|b| **b == b'\n').count(), 1);
    }

    #[tokio::test]
    async fn test_partial_reads_are_reassembled() {
        let reader = tokio_test::io::Builder::new()
            .read(b"{\"jsonrpc\":\"2.0\",")
            .read(b"\"id\":1,\"result\":{}}\n{\"id\"")
            .read(b":2}\n")
            .read(b"{\"id\":3}")
            .build();

        let messages: Vec<Value> = FramedRead::new(reader, AcpCodec::new())
            .map(|item| item.unwrap())
            .collect()
            .await;

        assert_eq!(
            messages,
            vec![
                json!({"jsonrpc": "2.0", "id": 1, "result": {}}),
                json!({"id": 2}),
                json!({"id": 3}),
            ]
        );
    }
}
