//! Incremental reconstruction of an HTTP response head from an unframed
//! byte stream.
//!
//! The SOCKS5-relayed forward path reads raw bytes with no message framing,
//! so the status line and header block can arrive split at any byte
//! boundary across any number of reads. The reassembler accumulates chunks
//! until the header terminator appears, parses the head exactly once, and
//! hands any surplus bytes back as the first body fragment. Body bytes are
//! never reinterpreted: chunked framing, if present, passes through
//! untouched.

use crate::error::ProxyError;
use bytes::{Bytes, BytesMut};

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// The parsed response head plus whatever trailed the terminator in the
/// same read.
#[derive(Debug)]
pub struct ResponseHead {
    /// Minor HTTP/1 version, 0 or 1.
    pub version_minor: u8,
    pub status: u16,
    pub reason: String,
    /// Ordered headers, keys lower-cased, values trimmed. A repeated key
    /// overwrites the earlier value in place.
    pub headers: Vec<(String, String)>,
    /// Body bytes that arrived bundled with the head.
    pub body_prefix: Bytes,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum State {
    AwaitingHeaders,
    StreamingBody,
}

/// Push-based state machine over arbitrary-sized reads. One instance per
/// relayed request; discarded when the upstream stream ends or errors.
#[derive(Debug)]
pub struct ResponseReassembler {
    buf: BytesMut,
    max_head_size: usize,
    state: State,
}

impl ResponseReassembler {
    pub fn new(max_head_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_head_size,
            state: State::AwaitingHeaders,
        }
    }

    pub fn headers_complete(&self) -> bool {
        self.state == State::StreamingBody
    }

    /// Append one chunk. Returns the parsed head exactly once, on the push
    /// that completes the header block; `None` while more reads are needed.
    /// After the head has been emitted the caller owns the byte stream and
    /// must not push further chunks.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<ResponseHead>, ProxyError> {
        if self.state == State::StreamingBody {
            return Ok(None);
        }

        self.buf.extend_from_slice(chunk);

        let Some(pos) = find_terminator(&self.buf) else {
            if self.buf.len() > self.max_head_size {
                return Err(ProxyError::BadUpstreamResponse(
                    "Header block exceeds maximum size".to_string(),
                ));
            }
            return Ok(None);
        };
        if pos > self.max_head_size {
            return Err(ProxyError::BadUpstreamResponse(
                "Header block exceeds maximum size".to_string(),
            ));
        }

        let head_bytes = self.buf.split_to(pos);
        let _ = self.buf.split_to(HEAD_TERMINATOR.len());
        let body_prefix = self.buf.split().freeze();
        self.state = State::StreamingBody;

        let head = parse_head(&head_bytes)?;
        Ok(Some(ResponseHead {
            body_prefix,
            ..head
        }))
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
}

fn parse_head(head: &[u8]) -> Result<ResponseHead, ProxyError> {
    let text = std::str::from_utf8(head)
        .map_err(|_| ProxyError::BadUpstreamResponse("Header block is not UTF-8".to_string()))?;

    let mut lines = text.split("\r\n");
    let status_line = lines.next().unwrap_or("");
    let (version_minor, status, reason) = parse_status_line(status_line)?;

    let mut headers: Vec<(String, String)> = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        // Lines without a colon carry nothing we can map; skip them.
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim().to_lowercase();
        let value = value.trim().to_string();
        if let Some(existing) = headers.iter_mut().find(|(k, _)| *k == name) {
            existing.1 = value;
        } else {
            headers.push((name, value));
        }
    }

    Ok(ResponseHead {
        version_minor,
        status,
        reason,
        headers,
        body_prefix: Bytes::new(),
    })
}

fn parse_status_line(line: &str) -> Result<(u8, u16, String), ProxyError> {
    let malformed = || ProxyError::BadUpstreamResponse(format!("Malformed status line: {:?}", line));

    let rest = line.strip_prefix("HTTP/1.").ok_or_else(malformed)?;
    let version_minor = match rest.as_bytes().first() {
        Some(&b'0') => 0,
        Some(&b'1') => 1,
        _ => return Err(malformed()),
    };
    let rest = rest[1..].strip_prefix(' ').ok_or_else(malformed)?;

    let (code, reason) = match rest.split_once(' ') {
        Some((code, reason)) => (code, reason),
        None => (rest, ""),
    };
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    let status: u16 = code.parse().map_err(|_| malformed())?;

    Ok((version_minor, status, reason.to_string()))
}
