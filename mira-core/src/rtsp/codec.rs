use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use super::message::{CONTENT_LENGTH, Request, Response, parse_headers};
use crate::error::MiraError;

/// Largest header block accepted before the buffer is discarded.
pub const MAX_HEAD_SIZE: usize = 16 * 1024;
/// Largest body accepted; anything bigger closes the connection.
pub const MAX_BODY_SIZE: usize = 4 * 1024 * 1024;

const TERMINATOR: &[u8] = b"\r\n\r\n";

/// One decoded control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Request(Request),
    /// A message that could not be parsed. It has been consumed; the
    /// connection stays usable.
    Malformed(&'static str),
}

/// Framing for the control connection, for use with `Framed`.
#[derive(Debug, Clone)]
pub struct RtspCodec {
    max_head: usize,
    max_body: usize,
}

impl Default for RtspCodec {
    fn default() -> Self {
        Self::new(MAX_HEAD_SIZE, MAX_BODY_SIZE)
    }
}

impl RtspCodec {
    pub fn new(max_head: usize, max_body: usize) -> Self {
        Self { max_head, max_body }
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(TERMINATOR.len()).position(|w| w == TERMINATOR)
}

fn content_length(head: &str) -> Result<usize, &'static str> {
    match parse_headers(head.split("\r\n").skip(1)).get(CONTENT_LENGTH) {
        Some(v) => v.parse().map_err(|_| "invalid Content-Length"),
        None => Ok(0),
    }
}

impl Decoder for RtspCodec {
    type Item = Inbound;
    type Error = MiraError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Stray line breaks between messages.
        let leading = src.iter().take_while(|&&b| b == b'\r' || b == b'\n').count();
        src.advance(leading);

        let Some(head_end) = find_terminator(src) else {
            if src.len() > self.max_head {
                src.clear();
                return Ok(Some(Inbound::Malformed("header block too large")));
            }
            return Ok(None);
        };
        let head_len = head_end + TERMINATOR.len();

        let body_len = match std::str::from_utf8(&src[..head_end]) {
            Ok(head) => content_length(head),
            Err(_) => Err("header block is not UTF-8"),
        };
        let body_len = match body_len {
            Ok(n) => n,
            Err(why) => {
                src.advance(head_len);
                return Ok(Some(Inbound::Malformed(why)));
            }
        };
        if body_len > self.max_body {
            return Err(MiraError::ValueTooLarge {
                size: body_len,
                max: self.max_body,
            });
        }

        if src.len() < head_len + body_len {
            src.reserve(head_len + body_len - src.len());
            return Ok(None);
        }

        // A terminated head can still exceed the limit when it arrives in
        // one read; skip the whole message.
        if head_end > self.max_head {
            src.advance(head_len + body_len);
            return Ok(Some(Inbound::Malformed("header block too large")));
        }

        let head = src.split_to(head_len);
        let body = src.split_to(body_len).freeze();
        let head = String::from_utf8_lossy(&head[..head_end]);

        match Request::parse(&head, body) {
            Ok(request) => Ok(Some(Inbound::Request(request))),
            Err(MiraError::Malformed(why)) => Ok(Some(Inbound::Malformed(why))),
            Err(e) => Err(e),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None => {
                if !src.is_empty() {
                    debug!(len = src.len(), "discarding unterminated message at EOF");
                    src.clear();
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Response> for RtspCodec {
    type Error = MiraError;

    fn encode(&mut self, item: Response, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.write_to(dst);
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
