//! Per-connection request routing.
//!
//! Reads one request head off the client stream, classifies it as a tunnel
//! establishment (CONNECT) or a plain forwarded request, dispatches to the
//! matching engine, and translates engine failures into the documented wire
//! responses.

use crate::auth::ProfileRegistry;
use crate::body::BodyFraming;
use crate::error::ProxyError;
use crate::{forward, tunnel};
use bytes::{Bytes, BytesMut};
use http_body_util::combinators::BoxBody;
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use log::debug;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use url::Url;

pub type HttpClient = Client<HttpsConnector<HttpConnector>, BoxBody<Bytes, std::io::Error>>;

/// Read-only state shared by every connection.
pub struct ProxyContext {
    pub registry: ProfileRegistry,
    pub client: HttpClient,
    pub connect_timeout: Duration,
    pub head_timeout: Duration,
    /// Cap on the total lifetime of an established relay. None leaves the
    /// relay open until either side closes.
    pub relay_timeout: Option<Duration>,
    pub max_header_size: usize,
    pub proxy_agent: String,
    pub realm: String,
}

/// Ordered request headers with case-insensitive lookup.
#[derive(Debug, Clone, Default)]
pub struct HeaderBlock {
    entries: Vec<(String, String)>,
}

impl HeaderBlock {
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            entry.1 = value;
        } else {
            self.entries.push((name.to_string(), value));
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// An opaque-tunnel establishment request.
#[derive(Debug)]
pub struct TunnelRequest {
    pub target_host: String,
    pub target_port: u16,
    pub proxy_auth: Option<String>,
    /// Client bytes that arrived bundled with the request head; forwarded
    /// to the upstream before any further client bytes.
    pub leftover: Bytes,
}

/// A plain forwarded request with an absolute target URL. The body is not
/// read here: `framing` says how it is delimited and `leftover` carries the
/// body bytes that arrived bundled with the head; the rest is streamed off
/// the client socket by the forward engine.
#[derive(Debug)]
pub struct ForwardRequest {
    pub method: String,
    pub target_url: Url,
    pub headers: HeaderBlock,
    pub proxy_auth: Option<String>,
    pub framing: BodyFraming,
    pub leftover: Bytes,
}

#[derive(Debug)]
pub enum ConnectionRequest {
    Tunnel(TunnelRequest),
    Forward(ForwardRequest),
}

#[derive(Debug)]
pub(crate) struct RequestHead {
    pub method: String,
    pub target: String,
    pub headers: HeaderBlock,
}

/// Drive one client connection to completion. Generic over the stream so
/// the TLS listener and plain-stream tests share the same path.
pub async fn serve_proxy_connection<S>(mut stream: S, ctx: &ProxyContext)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let head = match timeout(ctx.head_timeout, read_head(&mut stream, ctx.max_header_size)).await {
        Ok(Ok(head)) => head,
        Ok(Err(e)) => {
            debug!("Failed to read request head: {}", e);
            let _ = write_failure(&mut stream, &e, ctx).await;
            return;
        }
        Err(_) => {
            debug!("Timed out reading request head");
            return;
        }
    };

    let (head, leftover) = head;
    let request = match classify(head, leftover) {
        Ok(request) => request,
        Err(e) => {
            debug!("Rejected request: {}", e);
            let _ = write_failure(&mut stream, &e, ctx).await;
            return;
        }
    };

    let result = match request {
        ConnectionRequest::Tunnel(req) => tunnel::handle(&mut stream, req, ctx).await,
        ConnectionRequest::Forward(req) => forward::handle(&mut stream, req, ctx).await,
    };

    if let Err(e) = result {
        let _ = write_failure(&mut stream, &e, ctx).await;
    }
}

/// Build a `ConnectionRequest` out of a parsed head.
fn classify(head: RequestHead, leftover: Bytes) -> Result<ConnectionRequest, ProxyError> {
    let proxy_auth = head.headers.get("proxy-authorization").map(str::to_string);

    if head.method.eq_ignore_ascii_case("CONNECT") {
        let (target_host, target_port) = parse_authority(&head.target, 443)?;
        return Ok(ConnectionRequest::Tunnel(TunnelRequest {
            target_host,
            target_port,
            proxy_auth,
            leftover,
        }));
    }

    let target_url = Url::parse(&head.target)
        .map_err(|_| ProxyError::BadTargetUrl(head.target.clone()))?;
    if target_url.host_str().is_none() {
        return Err(ProxyError::BadTargetUrl(head.target.clone()));
    }

    let framing = BodyFraming::from_headers(&head.headers)?;

    Ok(ConnectionRequest::Forward(ForwardRequest {
        method: head.method,
        target_url,
        headers: head.headers,
        proxy_auth,
        framing,
        leftover,
    }))
}

/// Incrementally read bytes until the header terminator, then parse the
/// request line and header block. Surplus bytes are returned untouched.
pub(crate) async fn read_head<S>(
    stream: &mut S,
    max_header_size: usize,
) -> Result<(RequestHead, Bytes), ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);
    let pos = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if buf.len() > max_header_size {
            return Err(ProxyError::BadRequest(
                "Request head exceeds maximum size".to_string(),
            ));
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProxyError::BadRequest(
                "Connection closed before request head".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head_bytes = buf.split_to(pos);
    let _ = buf.split_to(4);
    let leftover = buf.freeze();

    let text = std::str::from_utf8(&head_bytes)
        .map_err(|_| ProxyError::BadRequest("Request head is not UTF-8".to_string()))?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.split_whitespace();
    let (method, target) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) if v.starts_with("HTTP/") => (m, t),
        _ => {
            return Err(ProxyError::BadRequest(format!(
                "Malformed request line: {:?}",
                request_line
            )));
        }
    };

    let mut headers = HeaderBlock::default();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push(name.trim(), value.trim());
        }
    }

    Ok((
        RequestHead {
            method: method.to_string(),
            target: target.to_string(),
            headers,
        },
        leftover,
    ))
}

/// Split a `host:port` authority, handling bracketed IPv6 literals.
pub(crate) fn parse_authority(target: &str, default_port: u16) -> Result<(String, u16), ProxyError> {
    let bad = || ProxyError::BadTargetUrl(target.to_string());

    if let Some(rest) = target.strip_prefix('[') {
        let (host, rest) = rest.split_once(']').ok_or_else(bad)?;
        let port = match rest.strip_prefix(':') {
            Some(p) => p.parse().map_err(|_| bad())?,
            None if rest.is_empty() => default_port,
            None => return Err(bad()),
        };
        return Ok((host.to_string(), port));
    }

    match target.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port.parse().map_err(|_| bad())?;
            Ok((host.to_string(), port))
        }
        None if !target.is_empty() => Ok((target.to_string(), default_port)),
        _ => Err(bad()),
    }
}

/// Write the wire response for a failed request: 407 with the Basic
/// challenge, 403/502/400/500 with informational bodies, all
/// `Connection: close`.
pub(crate) async fn write_failure<S>(
    stream: &mut S,
    err: &ProxyError,
    ctx: &ProxyContext,
) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let (status_line, body): (&str, &str) = match err.status_code() {
        407 => ("407 Proxy Authentication Required", ""),
        403 => ("403 Forbidden", "Forbidden: Domain not in whitelist"),
        400 => ("400 Bad Request", "Invalid request URL"),
        502 => ("502 Bad Gateway", "Bad Gateway"),
        _ => ("500 Internal Server Error", "Proxy request failed"),
    };

    let mut response = format!("HTTP/1.1 {}\r\n", status_line);
    if err.status_code() == 407 {
        response.push_str(&format!(
            "Proxy-Authenticate: Basic realm=\"{}\"\r\n",
            ctx.realm
        ));
    }
    response.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    ));

    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_head_split_across_reads() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            server.write_all(b"CONNECT example.co").await.unwrap();
            server
                .write_all(b"m:443 HTTP/1.1\r\nProxy-Authorization: Basic abc\r\n\r\nEXTRA")
                .await
                .unwrap();
        });

        let (head, leftover) = read_head(&mut client, 16 * 1024).await.unwrap();
        assert_eq!(head.method, "CONNECT");
        assert_eq!(head.target, "example.com:443");
        assert_eq!(head.headers.get("proxy-authorization"), Some("Basic abc"));
        assert_eq!(&leftover[..], b"EXTRA");
    }

    #[tokio::test]
    async fn test_read_head_rejects_garbage() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            server.write_all(b"garbage\r\n\r\n").await.unwrap();
        });
        assert!(matches!(
            read_head(&mut client, 16 * 1024).await,
            Err(ProxyError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_read_head_eof() {
        let (mut client, server) = tokio::io::duplex(4096);
        drop(server);
        assert!(read_head(&mut client, 16 * 1024).await.is_err());
    }

    #[test]
    fn test_parse_authority() {
        assert_eq!(
            parse_authority("example.com:8443", 443).unwrap(),
            ("example.com".to_string(), 8443)
        );
        assert_eq!(
            parse_authority("example.com", 443).unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            parse_authority("[::1]:443", 443).unwrap(),
            ("::1".to_string(), 443)
        );
        assert!(parse_authority(":443", 443).is_err());
        assert!(parse_authority("example.com:notaport", 443).is_err());
    }

    fn head_with(method: &str, target: &str, headers: &[(&str, &str)]) -> RequestHead {
        let mut block = HeaderBlock::default();
        for (name, value) in headers {
            block.push(*name, *value);
        }
        RequestHead {
            method: method.to_string(),
            target: target.to_string(),
            headers: block,
        }
    }

    #[test]
    fn test_classify_accepts_chunked_forward_bodies() {
        let head = head_with(
            "POST",
            "http://example.com/upload",
            &[("Transfer-Encoding", "chunked")],
        );
        match classify(head, Bytes::new()).unwrap() {
            ConnectionRequest::Forward(req) => {
                assert_eq!(req.framing, BodyFraming::Chunked);
            }
            other => panic!("expected a forward request, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_keeps_body_bytes_as_leftover() {
        let head = head_with("POST", "http://example.com/", &[("Content-Length", "5")]);
        match classify(head, Bytes::from_static(b"hel")).unwrap() {
            ConnectionRequest::Forward(req) => {
                assert_eq!(req.framing, BodyFraming::Length(5));
                assert_eq!(&req.leftover[..], b"hel");
            }
            other => panic!("expected a forward request, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_rejects_bad_content_length() {
        let head = head_with("POST", "http://example.com/", &[("Content-Length", "abc")]);
        assert!(matches!(
            classify(head, Bytes::new()),
            Err(ProxyError::BadRequest(_))
        ));
    }

    #[test]
    fn test_header_block_case_insensitive() {
        let mut headers = HeaderBlock::default();
        headers.push("Content-Length", "5");
        headers.push("Proxy-Connection", "keep-alive");
        assert_eq!(headers.get("content-length"), Some("5"));
        headers.remove("PROXY-CONNECTION");
        assert_eq!(headers.get("proxy-connection"), None);
        headers.set("Host", "example.com");
        headers.set("host", "other.example.com");
        assert_eq!(headers.get("Host"), Some("other.example.com"));
        assert_eq!(headers.iter().count(), 2);
    }
}
