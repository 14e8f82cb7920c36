//! Listener plumbing: the TLS proxy listener and the plaintext helper
//! listener that answers ACME `http-01` challenges.

use crate::auth::ProfileRegistry;
use crate::config::Config;
use crate::error::ProxyError;
use crate::router::{self, ProxyContext};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use log::{debug, info, warn};
use rustls::ServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

const ACME_PREFIX: &str = "/.well-known/acme-challenge/";

/// Build a rustls server config from PEM certificate and key files.
pub fn load_tls_config(cert_path: &str, key_path: &str) -> Result<ServerConfig, ProxyError> {
    let mut cert_file = BufReader::new(
        File::open(cert_path)
            .map_err(|e| ProxyError::Config(format!("Failed to open certificate file: {}", e)))?,
    );
    let mut key_file = BufReader::new(
        File::open(key_path)
            .map_err(|e| ProxyError::Config(format!("Failed to open private key file: {}", e)))?,
    );

    let certs = rustls_pemfile::certs(&mut cert_file)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Config(format!("Failed to read certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(ProxyError::Config("No valid certificate found".to_string()));
    }

    let private_key = rustls_pemfile::private_key(&mut key_file)
        .map_err(|e| ProxyError::Config(format!("Failed to read private key: {}", e)))?
        .ok_or_else(|| ProxyError::Config("No valid private key found".to_string()))?;

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, private_key)
        .map_err(|e| ProxyError::Config(format!("Failed to create TLS config: {}", e)))
}

pub struct ProxyServer {
    config: Config,
    ctx: Arc<ProxyContext>,
}

impl ProxyServer {
    pub fn new(config: Config) -> Result<Self, ProxyError> {
        config.validate()?;
        let ctx = Arc::new(ProxyContext {
            registry: ProfileRegistry::from_configs(&config.profiles),
            client: Client::builder(TokioExecutor::new()).build(HttpsConnector::new()),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            head_timeout: Duration::from_secs(config.head_timeout_secs),
            relay_timeout: config.relay_timeout_secs.map(Duration::from_secs),
            max_header_size: config.max_header_size,
            proxy_agent: config.proxy_agent.clone(),
            realm: "Proxy Authentication Required".to_string(),
        });
        Ok(Self { config, ctx })
    }

    /// Run both listeners until one of them fails.
    pub async fn run(self) -> Result<(), ProxyError> {
        let cert_path = self.config.certificate.clone().ok_or_else(|| {
            ProxyError::Config("A certificate path is required for the TLS listener".to_string())
        })?;
        let key_path = self.config.private_key.clone().ok_or_else(|| {
            ProxyError::Config("A private key path is required for the TLS listener".to_string())
        })?;
        let acceptor = TlsAcceptor::from(Arc::new(load_tls_config(&cert_path, &key_path)?));

        let challenge_dir = self.config.acme_challenge_dir.clone().map(PathBuf::from);
        let plain = run_plain_listener(
            self.config.plain_listen_addr,
            challenge_dir,
            self.ctx.clone(),
        );
        let tls = run_tls_listener(self.config.tls_listen_addr, acceptor, self.ctx.clone());

        tokio::try_join!(plain, tls)?;
        Ok(())
    }
}

async fn run_tls_listener(
    addr: SocketAddr,
    acceptor: TlsAcceptor,
    ctx: Arc<ProxyContext>,
) -> Result<(), ProxyError> {
    let listener = TcpListener::bind(addr).await?;
    info!("TLS proxy listening on {}", addr);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accept failed on {}: {}", addr, e);
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok(tls_stream) => router::serve_proxy_connection(tls_stream, &ctx).await,
                Err(e) => debug!("TLS handshake with {} failed: {}", peer, e),
            }
        });
    }
}

async fn run_plain_listener(
    addr: SocketAddr,
    challenge_dir: Option<PathBuf>,
    ctx: Arc<ProxyContext>,
) -> Result<(), ProxyError> {
    let listener = TcpListener::bind(addr).await?;
    info!("Plaintext listener on {}", addr);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accept failed on {}: {}", addr, e);
                continue;
            }
        };
        let challenge_dir = challenge_dir.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_plain_connection(stream, challenge_dir.as_deref(), &ctx).await {
                debug!("Plaintext connection from {} failed: {}", peer, e);
            }
        });
    }
}

/// One request on the plaintext listener: an ACME challenge lookup or the
/// informational banner. Everything closes after a single response.
async fn serve_plain_connection<S>(
    mut stream: S,
    challenge_dir: Option<&Path>,
    ctx: &ProxyContext,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (head, _leftover) = match timeout(
        ctx.head_timeout,
        router::read_head(&mut stream, ctx.max_header_size),
    )
    .await
    {
        Ok(result) => result?,
        Err(_) => return Ok(()),
    };

    if head.method.eq_ignore_ascii_case("GET") && head.target.starts_with(ACME_PREFIX) {
        let token = &head.target[ACME_PREFIX.len()..];
        match load_challenge(challenge_dir, token).await {
            Some(body) => {
                write_plain_response(&mut stream, "200 OK", "text/plain", &body).await?
            }
            None => {
                write_plain_response(&mut stream, "404 Not Found", "text/plain", b"Not Found")
                    .await?
            }
        }
        return Ok(());
    }

    let banner = format!(
        "{} is running. Configure your client to use this host as an HTTPS proxy.\n",
        ctx.proxy_agent
    );
    write_plain_response(&mut stream, "200 OK", "text/plain", banner.as_bytes()).await
}

/// Look a challenge token up in the configured directory. Tokens are
/// base64url, so anything outside that alphabet is refused before touching
/// the filesystem.
async fn load_challenge(challenge_dir: Option<&Path>, token: &str) -> Option<Vec<u8>> {
    let dir = challenge_dir?;
    if token.is_empty()
        || !token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return None;
    }
    tokio::fs::read(dir.join(token)).await.ok()
}

async fn write_plain_response<S>(
    stream: &mut S,
    status_line: &str,
    content_type: &str,
    body: &[u8],
) -> Result<(), ProxyError>
where
    S: AsyncWrite + Unpin,
{
    let head = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status_line,
        content_type,
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}
