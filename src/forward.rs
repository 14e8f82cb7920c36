//! Plain (non-CONNECT) request forwarding.
//!
//! Direct profiles go through the shared hyper client, which owns connection
//! setup and TLS to the destination. SOCKS5 profiles cannot use that client,
//! so the request is serialized by hand onto the relayed stream and the
//! response head is rebuilt with the reassembler while the body bytes pass
//! through untouched.
//!
//! Request bodies are streamed, not buffered: the engine pumps body bytes
//! off the client socket while the upstream exchange is in flight. On the
//! hyper path the chunked framing is stripped first (hyper re-applies its
//! own); on the relay path the bytes go through verbatim.

use crate::body::{BodyFraming, BodyProgress};
use crate::error::{ConnectReason, ProxyError};
use crate::reassembler::ResponseReassembler;
use crate::router::{ForwardRequest, ProxyContext};
use crate::upstream::Transport;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use log::{debug, info};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::sleep;

/// Request headers that must not travel to the destination.
const STRIPPED_REQUEST_HEADERS: &[&str] = &["proxy-authorization", "proxy-connection", "host"];

/// Run a forwarded request to completion.
///
/// As with tunnels, errors are returned only before the response status line
/// is written; afterwards failures just close the connection.
pub async fn handle<S>(
    client: &mut S,
    req: ForwardRequest,
    ctx: &ProxyContext,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let profile = ctx.registry.authenticate(req.proxy_auth.as_deref())?;

    let host = req
        .target_url
        .host_str()
        .ok_or_else(|| ProxyError::BadTargetUrl(req.target_url.to_string()))?
        .to_string();
    if !profile.policy.is_allowed(&host) {
        return Err(ProxyError::Forbidden(host));
    }

    info!(
        "{} {} as '{}' ({:?})",
        req.method,
        req.target_url,
        profile.credentials.username,
        profile.upstream.transport()
    );

    match profile.upstream.transport() {
        Transport::Direct => forward_direct(client, req, ctx).await,
        Transport::Socks5Relay => {
            // No TLS client rides on the raw relay stream, so only plain
            // http targets can be forwarded this way.
            if req.target_url.scheme() != "http" {
                return Err(ProxyError::BadTargetUrl(format!(
                    "Only http targets can be relayed: {}",
                    req.target_url
                )));
            }
            let port = req.target_url.port().unwrap_or(80);
            let upstream = profile.upstream.connect(&host, port, ctx.connect_timeout).await?;
            forward_relayed(client, req, ctx, upstream.stream, &host, port).await
        }
    }
}

fn empty_body() -> BoxBody<Bytes, std::io::Error> {
    BoxBody::new(Full::new(Bytes::new()).map_err(|never| match never {}))
}

/// Forward through the shared hyper client and re-serialize its decoded
/// response. Transfer-Encoding is dropped on both legs because the client
/// applies its own chunking on the way out and removes it on the way back;
/// `Connection: close` delimits the response body when no Content-Length
/// survives.
async fn forward_direct<S>(
    client: &mut S,
    req: ForwardRequest,
    ctx: &ProxyContext,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let uri: hyper::Uri = req
        .target_url
        .as_str()
        .parse()
        .map_err(|_| ProxyError::BadTargetUrl(req.target_url.to_string()))?;
    let method = hyper::Method::from_bytes(req.method.as_bytes())
        .map_err(|_| ProxyError::BadRequest(format!("Invalid method: {:?}", req.method)))?;

    let mut builder = hyper::Request::builder().method(method).uri(uri);
    for (name, value) in req.headers.iter() {
        if STRIPPED_REQUEST_HEADERS
            .iter()
            .any(|h| name.eq_ignore_ascii_case(h))
            || name.eq_ignore_ascii_case("transfer-encoding")
        {
            continue;
        }
        builder = builder.header(name, value);
    }

    // Streamed bodies are fed through a channel: the receiver end travels
    // into the client as the request body while this task keeps reading the
    // client socket and pushing frames in.
    let mut progress = BodyProgress::new(req.framing);
    let (body, mut sender) = if req.framing.has_body() {
        let (tx, mut rx) = mpsc::channel::<Result<Frame<Bytes>, std::io::Error>>(16);
        let stream = futures::stream::poll_fn(move |cx| rx.poll_recv(cx));
        (BoxBody::new(StreamBody::new(stream)), Some(tx))
    } else {
        (empty_body(), None)
    };

    if sender.is_some() && !req.leftover.is_empty() {
        let (data, done) = progress.push(&req.leftover)?;
        let mut closed = done;
        if !data.is_empty() {
            if let Some(tx) = &sender {
                if tx.send(Ok(Frame::data(data))).await.is_err() {
                    closed = true;
                }
            }
        }
        if closed {
            sender = None;
        }
    }

    let request = builder
        .body(body)
        .map_err(|e| ProxyError::BadRequest(format!("Invalid forwarded request: {}", e)))?;

    let request_fut = ctx.client.request(request);
    tokio::pin!(request_fut);
    let deadline = sleep(ctx.head_timeout);
    tokio::pin!(deadline);

    let mut buf = [0u8; 8192];
    let result = loop {
        tokio::select! {
            result = &mut request_fut => break result,
            _ = &mut deadline => {
                return Err(ProxyError::connect(
                    ConnectReason::Network,
                    format!("Timed out waiting for {}", req.target_url),
                ));
            }
            read = client.read(&mut buf), if sender.is_some() => {
                match read {
                    Ok(0) | Err(_) => {
                        sender = None;
                    }
                    Ok(n) => {
                        let (data, done) = progress.push(&buf[..n])?;
                        let mut closed = done;
                        if !data.is_empty() {
                            if let Some(tx) = &sender {
                                if tx.send(Ok(Frame::data(data))).await.is_err() {
                                    closed = true;
                                }
                            }
                        }
                        if closed {
                            sender = None;
                        }
                    }
                }
            }
        }
    };

    let response = match result {
        Ok(response) => response,
        Err(e) if e.is_connect() => {
            return Err(ProxyError::connect(
                ConnectReason::Network,
                format!("Failed to reach {}: {}", req.target_url, e),
            ));
        }
        Err(e) => {
            return Err(ProxyError::Forward(format!(
                "Request to {} failed: {}",
                req.target_url, e
            )));
        }
    };

    let (parts, mut response_body) = response.into_parts();

    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        parts.status.as_u16(),
        parts.status.canonical_reason().unwrap_or("")
    );
    for (name, value) in parts.headers.iter() {
        if *name == hyper::header::TRANSFER_ENCODING || *name == hyper::header::CONNECTION {
            continue;
        }
        let Ok(value) = value.to_str() else { continue };
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str(&format!("Proxy-Agent: {}\r\nConnection: close\r\n\r\n", ctx.proxy_agent));

    if client.write_all(head.as_bytes()).await.is_err() {
        return Ok(());
    }

    while let Some(frame) = response_body.frame().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Body stream from {} aborted: {}", req.target_url, e);
                return Ok(());
            }
        };
        if let Some(data) = frame.data_ref() {
            if client.write_all(data).await.is_err() {
                return Ok(());
            }
        }
    }
    let _ = client.flush().await;
    Ok(())
}

/// Forward over an already-established relay stream: write the request head,
/// then pump body bytes up and response bytes down concurrently. The
/// response head is rebuilt with the reassembler; everything after it passes
/// through raw until the upstream closes.
async fn forward_relayed<S>(
    client: &mut S,
    req: ForwardRequest,
    ctx: &ProxyContext,
    mut upstream: tokio::net::TcpStream,
    host: &str,
    port: u16,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut origin_form = req.target_url.path().to_string();
    if let Some(query) = req.target_url.query() {
        origin_form.push('?');
        origin_form.push_str(query);
    }

    let mut headers = req.headers.clone();
    for name in STRIPPED_REQUEST_HEADERS {
        headers.remove(name);
    }
    if port == 80 {
        headers.set("Host", host);
    } else {
        headers.set("Host", format!("{}:{}", host, port));
    }
    headers.set("Connection", "close");

    let mut request = format!("{} {} HTTP/1.1\r\n", req.method, origin_form);
    for (name, value) in headers.iter() {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("\r\n");

    let send_failed =
        |e: std::io::Error| ProxyError::Forward(format!("Failed to send request upstream: {}", e));
    upstream.write_all(request.as_bytes()).await.map_err(send_failed)?;

    // The body travels with its original framing; progress tracking only
    // tells us when to stop reading it off the client.
    let mut progress = BodyProgress::new(req.framing);
    let mut body_open = req.framing.has_body();
    if !req.leftover.is_empty() {
        upstream.write_all(&req.leftover).await.map_err(send_failed)?;
        if body_open {
            let (_, done) = progress.push(&req.leftover)?;
            if done {
                body_open = false;
            }
        }
    }
    upstream.flush().await.map_err(send_failed)?;

    let mut reassembler = ResponseReassembler::new(ctx.max_header_size);
    let mut head_pending = true;
    let head_deadline = sleep(ctx.head_timeout);
    tokio::pin!(head_deadline);

    let mut upstream_buf = [0u8; 8192];
    let mut client_buf = [0u8; 8192];
    loop {
        tokio::select! {
            _ = &mut head_deadline, if head_pending => {
                return Err(ProxyError::BadUpstreamResponse(
                    "Timed out waiting for response head".to_string(),
                ));
            }
            read = upstream.read(&mut upstream_buf) => {
                match read {
                    Ok(0) => {
                        if head_pending {
                            return Err(ProxyError::BadUpstreamResponse(
                                "Upstream closed before the response head".to_string(),
                            ));
                        }
                        break;
                    }
                    Err(e) => {
                        if head_pending {
                            return Err(ProxyError::BadUpstreamResponse(format!(
                                "Failed reading response head: {}",
                                e
                            )));
                        }
                        debug!("Body relay from {}:{} aborted: {}", host, port, e);
                        break;
                    }
                    Ok(n) => {
                        if head_pending {
                            if let Some(head) = reassembler.push(&upstream_buf[..n])? {
                                head_pending = false;
                                // Head emitted; from here failures only
                                // terminate the connection.
                                if write_response_head(client, &head, ctx).await.is_err() {
                                    return Ok(());
                                }
                                if !head.body_prefix.is_empty()
                                    && client.write_all(&head.body_prefix).await.is_err()
                                {
                                    return Ok(());
                                }
                            }
                        } else if client.write_all(&upstream_buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
            read = client.read(&mut client_buf), if body_open => {
                match read {
                    Ok(0) | Err(_) => {
                        body_open = false;
                    }
                    Ok(n) => {
                        if upstream.write_all(&client_buf[..n]).await.is_err() {
                            body_open = false;
                        } else {
                            match progress.push(&client_buf[..n]) {
                                Ok((_, done)) => {
                                    if done {
                                        body_open = false;
                                    }
                                }
                                Err(e) => {
                                    if head_pending {
                                        return Err(e);
                                    }
                                    body_open = false;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    let _ = client.flush().await;
    Ok(())
}

async fn write_response_head<S>(
    client: &mut S,
    head: &crate::reassembler::ResponseHead,
    ctx: &ProxyContext,
) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut response = if head.reason.is_empty() {
        format!("HTTP/1.{} {}\r\n", head.version_minor, head.status)
    } else {
        format!(
            "HTTP/1.{} {} {}\r\n",
            head.version_minor, head.status, head.reason
        )
    };
    for (name, value) in &head.headers {
        if name == "connection" {
            continue;
        }
        response.push_str(&format!("{}: {}\r\n", name, value));
    }
    response.push_str(&format!(
        "proxy-agent: {}\r\nconnection: close\r\n\r\n",
        ctx.proxy_agent
    ));
    client.write_all(response.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ProfileRegistry;
    use crate::config::{ProfileConfig, UpstreamConfig};
    use crate::router::HeaderBlock;
    use base64::{Engine as _, engine::general_purpose};
    use hyper_tls::HttpsConnector;
    use hyper_util::client::legacy::Client;
    use hyper_util::rt::TokioExecutor;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use url::Url;

    fn ctx_with(profiles: Vec<ProfileConfig>) -> ProxyContext {
        ProxyContext {
            registry: ProfileRegistry::from_configs(&profiles),
            client: Client::builder(TokioExecutor::new()).build(HttpsConnector::new()),
            connect_timeout: Duration::from_secs(2),
            head_timeout: Duration::from_secs(2),
            relay_timeout: None,
            max_header_size: 16 * 1024,
            proxy_agent: "Heimdall-Proxy".to_string(),
            realm: "Proxy Authentication Required".to_string(),
        }
    }

    fn direct_profile(whitelist: Vec<String>) -> ProfileConfig {
        ProfileConfig {
            username: "alice".to_string(),
            password: "secret".to_string(),
            whitelist,
            upstream: UpstreamConfig::Direct,
        }
    }

    fn auth_header() -> Option<String> {
        Some(format!(
            "Basic {}",
            general_purpose::STANDARD.encode("alice:secret")
        ))
    }

    fn forward_request(url: &str) -> ForwardRequest {
        ForwardRequest {
            method: "GET".to_string(),
            target_url: Url::parse(url).unwrap(),
            headers: HeaderBlock::default(),
            proxy_auth: auth_header(),
            framing: BodyFraming::Empty,
            leftover: Bytes::new(),
        }
    }

    async fn canned_http_server(response: &'static [u8]) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            loop {
                let n = sock.read(&mut buf).await.unwrap();
                if n == 0 || buf[..n].windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            sock.write_all(response).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_direct_forward() {
        let addr =
            canned_http_server(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi").await;
        let ctx = ctx_with(vec![direct_profile(Vec::new())]);
        let req = forward_request(&format!("http://127.0.0.1:{}/", addr.port()));

        let (mut client, mut proxy_side) = tokio::io::duplex(16 * 1024);
        let engine = tokio::spawn(async move { handle(&mut proxy_side, req, &ctx).await });

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        engine.await.unwrap().unwrap();

        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.to_lowercase().contains("connection: close"));
        assert!(text.contains("Proxy-Agent: Heimdall-Proxy"));
        assert!(text.ends_with("hi"));
    }

    #[tokio::test]
    async fn test_direct_forward_streams_chunked_body() {
        // The server holds its response until the chunked body has fully
        // arrived, so the exchange only completes if the engine streams the
        // body while waiting.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut seen = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = sock.read(&mut buf).await.unwrap();
                assert!(n > 0, "client closed before finishing the body");
                seen.extend_from_slice(&buf[..n]);
                if seen.windows(5).any(|w| w == b"0\r\n\r\n") {
                    break;
                }
            }
            sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
        });

        let ctx = ctx_with(vec![direct_profile(Vec::new())]);
        let mut req = forward_request(&format!("http://127.0.0.1:{}/upload", addr.port()));
        req.method = "POST".to_string();
        req.headers.push("Transfer-Encoding", "chunked");
        req.framing = BodyFraming::Chunked;

        let (mut client, mut proxy_side) = tokio::io::duplex(16 * 1024);
        let engine = tokio::spawn(async move { handle(&mut proxy_side, req, &ctx).await });

        client
            .write_all(b"6\r\nchunky\r\n4\r\ndata\r\n0\r\n\r\n")
            .await
            .unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        engine.await.unwrap().unwrap();

        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("ok"));
    }

    #[tokio::test]
    async fn test_forward_rejects_host_outside_whitelist() {
        let ctx = ctx_with(vec![direct_profile(vec!["*.example.org".to_string()])]);
        let req = forward_request("http://forbidden.example.com/data");

        let (_client, mut proxy_side) = tokio::io::duplex(4096);
        assert!(matches!(
            handle(&mut proxy_side, req, &ctx).await,
            Err(ProxyError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_forward_requires_auth() {
        let ctx = ctx_with(vec![direct_profile(Vec::new())]);
        let mut req = forward_request("http://example.com/");
        req.proxy_auth = None;

        let (_client, mut proxy_side) = tokio::io::duplex(4096);
        assert!(matches!(
            handle(&mut proxy_side, req, &ctx).await,
            Err(ProxyError::Auth(_))
        ));
    }

    /// A minimal relay: accepts one connection, performs the server side of
    /// the no-auth SOCKS5 handshake, then answers once the HTTP request
    /// (head plus `body` bytes, verbatim) has arrived.
    async fn canned_socks_server(
        expected_body: &'static [u8],
        response: &'static [u8],
    ) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();

            let mut greeting = [0u8; 3];
            sock.read_exact(&mut greeting).await.unwrap();
            sock.write_all(&[0x05, 0x00]).await.unwrap();

            let mut header = [0u8; 4];
            sock.read_exact(&mut header).await.unwrap();
            assert_eq!(header[3], 0x03, "expected a domain address");
            let mut len = [0u8; 1];
            sock.read_exact(&mut len).await.unwrap();
            let mut rest = vec![0u8; len[0] as usize + 2];
            sock.read_exact(&mut rest).await.unwrap();
            sock.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();

            let mut buf = vec![0u8; 8192];
            let mut seen = Vec::new();
            loop {
                let n = sock.read(&mut buf).await.unwrap();
                assert!(n > 0, "client closed before sending a request");
                seen.extend_from_slice(&buf[..n]);
                let head_done = seen.windows(4).position(|w| w == b"\r\n\r\n");
                if let Some(pos) = head_done {
                    if seen.len() >= pos + 4 + expected_body.len() {
                        break;
                    }
                }
            }
            let pos = seen.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
            let head = String::from_utf8_lossy(&seen[..pos]);
            assert!(head.starts_with("GET /data?x=1 HTTP/1.1\r\n") || head.starts_with("POST "));
            assert!(head.contains("Host: target.example.com\r\n"));
            assert!(!head.to_lowercase().contains("proxy-authorization"));
            assert_eq!(&seen[pos + 4..pos + 4 + expected_body.len()], expected_body);

            sock.write_all(response).await.unwrap();
        });
        addr
    }

    fn socks_profile(addr: std::net::SocketAddr) -> ProfileConfig {
        ProfileConfig {
            username: "alice".to_string(),
            password: "secret".to_string(),
            whitelist: Vec::new(),
            upstream: UpstreamConfig::Socks5 {
                host: addr.ip().to_string(),
                port: addr.port(),
                username: None,
                password: None,
            },
        }
    }

    #[tokio::test]
    async fn test_relayed_forward() {
        let addr =
            canned_socks_server(b"", b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello").await;
        let ctx = ctx_with(vec![socks_profile(addr)]);
        let req = forward_request("http://target.example.com/data?x=1");

        let (mut client, mut proxy_side) = tokio::io::duplex(16 * 1024);
        let engine = tokio::spawn(async move { handle(&mut proxy_side, req, &ctx).await });

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        engine.await.unwrap().unwrap();

        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-length: 5"));
        assert!(text.contains("connection: close"));
        assert!(text.ends_with("hello"));
    }

    #[tokio::test]
    async fn test_relayed_forward_streams_chunked_body_verbatim() {
        // The framed body must reach the relay byte-for-byte; the relay
        // holds its response until it has all of it.
        let framed = b"6\r\nchunky\r\n0\r\n\r\n";
        let addr = canned_socks_server(
            framed,
            b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n",
        )
        .await;
        let ctx = ctx_with(vec![socks_profile(addr)]);
        let mut req = forward_request("http://target.example.com/data?x=1");
        req.method = "POST".to_string();
        req.headers.push("Transfer-Encoding", "chunked");
        req.framing = BodyFraming::Chunked;

        let (mut client, mut proxy_side) = tokio::io::duplex(16 * 1024);
        let engine = tokio::spawn(async move { handle(&mut proxy_side, req, &ctx).await });

        client.write_all(framed).await.unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        engine.await.unwrap().unwrap();

        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("HTTP/1.1 201 Created\r\n"));
    }

    #[tokio::test]
    async fn test_relayed_forward_body_in_leftover() {
        let addr = canned_socks_server(
            b"hello",
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
        )
        .await;
        let ctx = ctx_with(vec![socks_profile(addr)]);
        let mut req = forward_request("http://target.example.com/data?x=1");
        req.method = "POST".to_string();
        req.headers.push("Content-Length", "5");
        req.framing = BodyFraming::Length(5);
        req.leftover = Bytes::from_static(b"hello");

        let (mut client, mut proxy_side) = tokio::io::duplex(16 * 1024);
        let engine = tokio::spawn(async move { handle(&mut proxy_side, req, &ctx).await });

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        engine.await.unwrap().unwrap();

        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    }

    #[tokio::test]
    async fn test_relayed_forward_rejects_https() {
        let ctx = ctx_with(vec![socks_profile("127.0.0.1:1080".parse().unwrap())]);
        let req = forward_request("https://target.example.com/");

        let (_client, mut proxy_side) = tokio::io::duplex(4096);
        assert!(matches!(
            handle(&mut proxy_side, req, &ctx).await,
            Err(ProxyError::BadTargetUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_relayed_forward_upstream_garbage() {
        let addr = canned_socks_server(b"", b"garbage without a status line\r\n\r\n").await;
        let ctx = ctx_with(vec![socks_profile(addr)]);
        let req = forward_request("http://target.example.com/data?x=1");

        let (_client, mut proxy_side) = tokio::io::duplex(4096);
        assert!(matches!(
            handle(&mut proxy_side, req, &ctx).await,
            Err(ProxyError::BadUpstreamResponse(_))
        ));
    }
}
