//! JSON-RPC framing codec for LSP communication.
//!
//! LSP uses `Content-Length: N\r\n\r\n{json}` framing over stdin/stdout.
//! [`FrameDecoder`] reassembles messages from an arbitrarily chunked byte
//! stream and [`FrameWriter`] writes framed messages to an async writer.
//!
//! The decoder never fails: a header block without a usable
//! `Content-Length` is discarded up to its terminator, and a body that is not
//! valid JSON costs exactly that one message.

use std::borrow::Cow;
use std::io;

use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Maximum frame size (64 MiB). Larger declared lengths are treated as a
/// corrupt header.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

const CONTENT_LENGTH: &str = "content-length";

/// Incremental decoder for `Content-Length` framed JSON messages.
///
/// Feeding the same bytes in one chunk or one byte at a time yields the same
/// messages in the same order.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes and return every message completed by them.
    pub fn append(&mut self, bytes: &[u8]) -> Vec<serde_json::Value> {
        self.buf.extend_from_slice(bytes);

        let mut messages = Vec::new();
        while let Some(header_end) = find_terminator(&self.buf) {
            let body_start = header_end + HEADER_TERMINATOR.len();

            let Some(content_length) = parse_content_length(&self.buf[..header_end]) else {
                tracing::debug!(
                    dropped = body_start,
                    "Dropping LSP header block without a valid Content-Length"
                );
                self.buf.drain(..body_start);
                continue;
            };

            let body_end = body_start + content_length;
            if self.buf.len() < body_end {
                break;
            }

            match serde_json::from_slice(&self.buf[body_start..body_end]) {
                Ok(value) => messages.push(value),
                Err(e) => {
                    tracing::debug!(error = %e, len = content_length, "Skipping unparsable LSP message body");
                }
            }
            self.buf.drain(..body_end);
        }
        messages
    }

    /// Bytes received but not yet consumed by a complete message.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
}

/// Extract `Content-Length` from a header block (terminator excluded).
///
/// The field name is matched case-insensitively and other headers are
/// ignored. When garbage left over from a dropped frame precedes the real
/// header, the last occurrence wins.
fn parse_content_length(header: &[u8]) -> Option<usize> {
    let lower = match String::from_utf8_lossy(header) {
        Cow::Borrowed(s) => s.to_ascii_lowercase(),
        Cow::Owned(s) => s.to_ascii_lowercase(),
    };
    let start = lower.rfind(CONTENT_LENGTH)? + CONTENT_LENGTH.len();
    let value = lower[start..].trim_start().strip_prefix(':')?;
    let value = value.split(['\r', '\n']).next()?.trim();
    let len: usize = value.parse().ok()?;
    (len <= MAX_FRAME_BYTES).then_some(len)
}

/// Serialize a message and prepend its `Content-Length` header.
pub fn encode_frame<T: Serialize + ?Sized>(msg: &T) -> serde_json::Result<Vec<u8>> {
    let body = serde_json::to_vec(msg)?;
    let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Writes pre-encoded frames to an async writer.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write one frame produced by [`encode_frame`] and flush.
    pub async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.writer.write_all(frame).await?;
        self.writer.flush().await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}
