// src/core/protocol/resp_frame.rs

//! Implements the RESP frame structure spoken between broker and client, and
//! the corresponding `Encoder` and `Decoder` for network communication.

use crate::core::TransportError;
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// The CRLF (Carriage Return, Line Feed) sequence used to terminate lines in RESP.
const CRLF: &[u8] = b"\r\n";
const CRLF_LEN: usize = 2;

// Broker requests and pushes are small; anything larger is a broken or hostile peer.
const MAX_FRAME_ELEMENTS: usize = 64;
const MAX_BULK_STRING_SIZE: usize = 64 * 1024;
const MAX_RECURSION_DEPTH: usize = 8;

/// A single frame in the RESP protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum RespFrame {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(Bytes),
    Null,
    Array(Vec<RespFrame>),
}

impl RespFrame {
    /// Builds a bulk string frame from anything string-like.
    pub fn bulk(s: impl AsRef<str>) -> Self {
        RespFrame::BulkString(Bytes::copy_from_slice(s.as_ref().as_bytes()))
    }

    pub fn ok() -> Self {
        RespFrame::SimpleString("OK".to_string())
    }

    /// Reads the frame as UTF-8 text if it is a bulk or simple string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespFrame::BulkString(b) => std::str::from_utf8(b).ok(),
            RespFrame::SimpleString(s) => Some(s),
            _ => None,
        }
    }
}

/// A `tokio_util::codec` implementation for encoding and decoding `RespFrame`s.
#[derive(Debug, Default, Clone, Copy)]
pub struct RespFrameCodec;

impl Encoder<RespFrame> for RespFrameCodec {
    type Error = TransportError;

    fn encode(&mut self, item: RespFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            RespFrame::SimpleString(s) => {
                dst.extend_from_slice(b"+");
                dst.extend_from_slice(s.as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Error(s) => {
                dst.extend_from_slice(b"-");
                dst.extend_from_slice(s.as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Integer(i) => {
                dst.extend_from_slice(b":");
                dst.extend_from_slice(i.to_string().as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::BulkString(b) => {
                dst.extend_from_slice(b"$");
                dst.extend_from_slice(b.len().to_string().as_bytes());
                dst.extend_from_slice(CRLF);
                dst.extend_from_slice(&b);
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Null => {
                dst.extend_from_slice(b"$-1\r\n");
            }
            RespFrame::Array(arr) => {
                dst.extend_from_slice(b"*");
                dst.extend_from_slice(arr.len().to_string().as_bytes());
                dst.extend_from_slice(CRLF);
                for frame in arr {
                    self.encode(frame, dst)?;
                }
            }
        }
        Ok(())
    }
}

impl Decoder for RespFrameCodec {
    type Item = RespFrame;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut bytes = &src[..];
        match decode_recursive(&mut bytes, 0) {
            Ok(frame) => {
                let len = src.len() - bytes.len();
                src.advance(len);
                Ok(Some(frame))
            }
            // Not enough bytes buffered yet; wait for the next read.
            Err(TransportError::IncompleteData) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn syntax(msg: &str) -> TransportError {
    TransportError::Protocol(msg.to_string())
}

/// Decodes one frame, advancing `bytes` past it.
fn decode_recursive(bytes: &mut &[u8], depth: usize) -> Result<RespFrame, TransportError> {
    if depth > MAX_RECURSION_DEPTH {
        return Err(syntax("RESP nesting depth limit exceeded"));
    }

    let Some(&prefix) = bytes.first() else {
        return Err(TransportError::IncompleteData);
    };
    *bytes = &bytes[1..];

    match prefix {
        b'+' => Ok(RespFrame::SimpleString(
            String::from_utf8_lossy(parse_line(bytes)?).to_string(),
        )),
        b'-' => Ok(RespFrame::Error(
            String::from_utf8_lossy(parse_line(bytes)?).to_string(),
        )),
        b':' => Ok(RespFrame::Integer(parse_number(bytes)?)),
        b'$' => parse_bulk_string(bytes),
        b'*' => parse_array(bytes, depth),
        other => Err(TransportError::Protocol(format!(
            "unexpected RESP type byte 0x{other:02x}"
        ))),
    }
}

/// Returns the bytes up to the next CRLF and advances past it.
fn parse_line<'a>(bytes: &mut &'a [u8]) -> Result<&'a [u8], TransportError> {
    let Some(pos) = find_crlf(bytes) else {
        return Err(TransportError::IncompleteData);
    };
    let line = &bytes[..pos];
    *bytes = &bytes[pos + CRLF_LEN..];
    Ok(line)
}

fn parse_number(bytes: &mut &[u8]) -> Result<i64, TransportError> {
    let line = parse_line(bytes)?;
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| syntax("invalid RESP integer"))
}

fn parse_bulk_string(bytes: &mut &[u8]) -> Result<RespFrame, TransportError> {
    let len = parse_number(bytes)?;
    if len == -1 {
        return Ok(RespFrame::Null);
    }
    let len = usize::try_from(len).map_err(|_| syntax("negative bulk string length"))?;
    if len > MAX_BULK_STRING_SIZE {
        return Err(syntax("bulk string exceeds size limit"));
    }
    if bytes.len() < len + CRLF_LEN {
        return Err(TransportError::IncompleteData);
    }
    if &bytes[len..len + CRLF_LEN] != CRLF {
        return Err(syntax("bulk string is not CRLF terminated"));
    }

    let data = Bytes::copy_from_slice(&bytes[..len]);
    *bytes = &bytes[len + CRLF_LEN..];
    Ok(RespFrame::BulkString(data))
}

fn parse_array(bytes: &mut &[u8], depth: usize) -> Result<RespFrame, TransportError> {
    let len = parse_number(bytes)?;
    let len = usize::try_from(len).map_err(|_| syntax("negative array length"))?;
    if len > MAX_FRAME_ELEMENTS {
        return Err(syntax("array exceeds element limit"));
    }

    let mut frames = Vec::with_capacity(len);
    for _ in 0..len {
        frames.push(decode_recursive(bytes, depth + 1)?);
    }
    Ok(RespFrame::Array(frames))
}

fn find_crlf(src: &[u8]) -> Option<usize> {
    src.windows(CRLF_LEN).position(|window| window == CRLF)
}
