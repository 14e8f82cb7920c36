//! Forwarded-request body framing.
//!
//! Bodies are never buffered whole: the router only classifies how the body
//! is delimited, and the forward engine streams the bytes as they arrive.
//! `BodyProgress` tracks where the body ends; for chunked bodies it also
//! strips the transfer framing, which the hyper path needs because the
//! client there re-applies its own chunking.

use crate::error::ProxyError;
use crate::router::HeaderBlock;
use bytes::{Bytes, BytesMut};

/// How a forwarded request body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
}

impl BodyFraming {
    /// Classify from the request headers. A `Content-Length` that does not
    /// parse is a client error.
    pub fn from_headers(headers: &HeaderBlock) -> Result<Self, ProxyError> {
        if let Some(te) = headers.get("transfer-encoding") {
            if te.to_lowercase().contains("chunked") {
                return Ok(BodyFraming::Chunked);
            }
        }
        match headers.get("content-length") {
            Some(v) => {
                let length = v
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| ProxyError::BadRequest("Invalid Content-Length".to_string()))?;
                Ok(if length == 0 {
                    BodyFraming::Empty
                } else {
                    BodyFraming::Length(length)
                })
            }
            None => Ok(BodyFraming::Empty),
        }
    }

    pub fn has_body(&self) -> bool {
        !matches!(self, BodyFraming::Empty)
    }
}

/// Tracks a body across arbitrary read boundaries. `push` takes the raw
/// bytes as read from the client and returns the unframed data they carry
/// plus whether the body is now complete.
#[derive(Debug)]
pub enum BodyProgress {
    Done,
    Length { remaining: u64 },
    Chunked(ChunkDecoder),
}

impl BodyProgress {
    pub fn new(framing: BodyFraming) -> Self {
        match framing {
            BodyFraming::Empty => BodyProgress::Done,
            BodyFraming::Length(n) => BodyProgress::Length { remaining: n },
            BodyFraming::Chunked => BodyProgress::Chunked(ChunkDecoder::new()),
        }
    }

    pub fn push(&mut self, input: &[u8]) -> Result<(Bytes, bool), ProxyError> {
        match self {
            BodyProgress::Done => Ok((Bytes::new(), true)),
            BodyProgress::Length { remaining } => {
                let take = (*remaining).min(input.len() as u64) as usize;
                let data = Bytes::copy_from_slice(&input[..take]);
                *remaining -= take as u64;
                Ok((data, *remaining == 0))
            }
            BodyProgress::Chunked(decoder) => decoder.push(input),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Extension,
    SizeLf,
    Data,
    DataCr,
    DataLf,
    TrailerStart,
    TrailerSkip,
    TrailerLf,
    Done,
}

/// Incremental decoder for chunked transfer framing: size lines, chunk
/// data, the terminal zero chunk and any trailer lines. Surplus input after
/// the terminator is left unconsumed.
#[derive(Debug)]
pub struct ChunkDecoder {
    state: ChunkState,
    size: u64,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkState::Size,
            size: 0,
        }
    }

    pub fn push(&mut self, input: &[u8]) -> Result<(Bytes, bool), ProxyError> {
        let bad = |what: &str| ProxyError::BadRequest(format!("Malformed chunked body: {}", what));

        let mut out = BytesMut::new();
        let mut i = 0;
        while i < input.len() {
            let b = input[i];
            match self.state {
                ChunkState::Size => match b {
                    b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' => {
                        self.size = self
                            .size
                            .checked_mul(16)
                            .and_then(|s| s.checked_add(hex_value(b) as u64))
                            .ok_or_else(|| bad("chunk size overflow"))?;
                        i += 1;
                    }
                    b';' => {
                        self.state = ChunkState::Extension;
                        i += 1;
                    }
                    b'\r' => {
                        self.state = ChunkState::SizeLf;
                        i += 1;
                    }
                    _ => return Err(bad("invalid chunk size")),
                },
                ChunkState::Extension => {
                    if b == b'\r' {
                        self.state = ChunkState::SizeLf;
                    }
                    i += 1;
                }
                ChunkState::SizeLf => {
                    if b != b'\n' {
                        return Err(bad("expected LF after chunk size"));
                    }
                    self.state = if self.size == 0 {
                        ChunkState::TrailerStart
                    } else {
                        ChunkState::Data
                    };
                    i += 1;
                }
                ChunkState::Data => {
                    let take = self.size.min((input.len() - i) as u64) as usize;
                    out.extend_from_slice(&input[i..i + take]);
                    self.size -= take as u64;
                    i += take;
                    if self.size == 0 {
                        self.state = ChunkState::DataCr;
                    }
                }
                ChunkState::DataCr => {
                    if b != b'\r' {
                        return Err(bad("expected CR after chunk data"));
                    }
                    self.state = ChunkState::DataLf;
                    i += 1;
                }
                ChunkState::DataLf => {
                    if b != b'\n' {
                        return Err(bad("expected LF after chunk data"));
                    }
                    self.state = ChunkState::Size;
                    i += 1;
                }
                ChunkState::TrailerStart => {
                    self.state = if b == b'\r' {
                        ChunkState::TrailerLf
                    } else {
                        ChunkState::TrailerSkip
                    };
                    i += 1;
                }
                ChunkState::TrailerSkip => {
                    if b == b'\n' {
                        self.state = ChunkState::TrailerStart;
                    }
                    i += 1;
                }
                ChunkState::TrailerLf => {
                    if b != b'\n' {
                        return Err(bad("expected LF ending trailers"));
                    }
                    self.state = ChunkState::Done;
                    i += 1;
                }
                ChunkState::Done => break,
            }
        }

        Ok((out.freeze(), self.state == ChunkState::Done))
    }
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn hex_value(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'a'..=b'f' => b - b'a' + 10,
        _ => b - b'A' + 10,
    }
}
