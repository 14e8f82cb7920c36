//! Upstream connection establishment: direct TCP or via a SOCKS5 relay.

use crate::config::UpstreamConfig;
use crate::error::{ConnectReason, ProxyError};
use std::net::IpAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_PASSWORD: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REP_SUCCESS: u8 = 0x00;

/// Which transport produced an upstream handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Direct,
    Socks5Relay,
}

/// SOCKS5 relay coordinates for one profile.
#[derive(Debug, Clone)]
pub struct Socks5Relay {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Per-profile upstream routing mode. Selected once at connect time; no
/// fallback between variants.
#[derive(Debug, Clone)]
pub enum UpstreamMode {
    Direct,
    Socks5(Socks5Relay),
}

/// A connected duplex stream to the destination. Owned exclusively by the
/// engine that requested it, one per connection request.
pub struct UpstreamHandle {
    pub stream: TcpStream,
    pub via: Transport,
}

impl UpstreamMode {
    pub fn from_config(config: &UpstreamConfig) -> Self {
        match config {
            UpstreamConfig::Direct => UpstreamMode::Direct,
            UpstreamConfig::Socks5 {
                host,
                port,
                username,
                password,
            } => UpstreamMode::Socks5(Socks5Relay {
                host: host.clone(),
                port: *port,
                username: username.clone(),
                password: password.clone(),
            }),
        }
    }

    pub fn transport(&self) -> Transport {
        match self {
            UpstreamMode::Direct => Transport::Direct,
            UpstreamMode::Socks5(_) => Transport::Socks5Relay,
        }
    }

    /// Open a connection to `host:port` through this mode. A single failure
    /// is surfaced immediately; no retries.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        connect_timeout: Duration,
    ) -> Result<UpstreamHandle, ProxyError> {
        match self {
            UpstreamMode::Direct => {
                let stream = timeout(connect_timeout, TcpStream::connect((host, port)))
                    .await
                    .map_err(|_| {
                        ProxyError::connect(
                            ConnectReason::Network,
                            format!("Connect timeout to {}:{}", host, port),
                        )
                    })?
                    .map_err(|e| {
                        ProxyError::connect(
                            ConnectReason::Network,
                            format!("Failed to connect to {}:{}: {}", host, port, e),
                        )
                    })?;
                Ok(UpstreamHandle {
                    stream,
                    via: Transport::Direct,
                })
            }
            UpstreamMode::Socks5(relay) => {
                let handshake = async {
                    let mut stream =
                        TcpStream::connect((relay.host.as_str(), relay.port))
                            .await
                            .map_err(|e| {
                                ProxyError::connect(
                                    ConnectReason::Network,
                                    format!(
                                        "Failed to connect to relay {}:{}: {}",
                                        relay.host, relay.port, e
                                    ),
                                )
                            })?;
                    socks5_handshake(
                        &mut stream,
                        host,
                        port,
                        relay.username.as_deref(),
                        relay.password.as_deref(),
                    )
                    .await?;
                    Ok::<_, ProxyError>(stream)
                };

                let stream = timeout(connect_timeout, handshake).await.map_err(|_| {
                    ProxyError::connect(
                        ConnectReason::Network,
                        format!("Relay connect timeout via {}:{}", relay.host, relay.port),
                    )
                })??;

                Ok(UpstreamHandle {
                    stream,
                    via: Transport::Socks5Relay,
                })
            }
        }
    }
}

/// Client side of the SOCKS5 CONNECT handshake: greeting, optional
/// username/password sub-negotiation, CONNECT request, reply check.
pub(crate) async fn socks5_handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    host: &str,
    port: u16,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<(), ProxyError> {
    let requires_auth = username.is_some() && password.is_some();
    let offered = if requires_auth { AUTH_PASSWORD } else { AUTH_NONE };

    stream
        .write_all(&[SOCKS5_VERSION, 1, offered])
        .await
        .map_err(io_to_network)?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await.map_err(io_to_network)?;

    if response[0] != SOCKS5_VERSION {
        return Err(ProxyError::connect(
            ConnectReason::RelayHandshake,
            format!("Invalid SOCKS version from relay: {}", response[0]),
        ));
    }
    if response[1] == AUTH_NO_ACCEPTABLE {
        return Err(ProxyError::connect(
            ConnectReason::RelayHandshake,
            "Relay accepted none of the offered auth methods",
        ));
    }
    if response[1] != offered {
        return Err(ProxyError::connect(
            ConnectReason::RelayHandshake,
            format!("Relay selected unoffered auth method {}", response[1]),
        ));
    }

    if response[1] == AUTH_PASSWORD {
        let username = username.unwrap_or("");
        let password = password.unwrap_or("");
        if username.len() > 255 || password.len() > 255 {
            return Err(ProxyError::Config(
                "SOCKS5 relay credentials exceed 255 bytes".to_string(),
            ));
        }

        let mut auth_request = vec![0x01];
        auth_request.push(username.len() as u8);
        auth_request.extend_from_slice(username.as_bytes());
        auth_request.push(password.len() as u8);
        auth_request.extend_from_slice(password.as_bytes());
        stream.write_all(&auth_request).await.map_err(io_to_network)?;

        let mut auth_response = [0u8; 2];
        stream
            .read_exact(&mut auth_response)
            .await
            .map_err(io_to_network)?;
        if auth_response[1] != 0x00 {
            return Err(ProxyError::connect(
                ConnectReason::AuthRejected,
                "Relay rejected the configured credentials",
            ));
        }
    }

    let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&v4.octets());
        }
        Ok(IpAddr::V6(v6)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&v6.octets());
        }
        Err(_) => {
            if host.len() > 255 {
                return Err(ProxyError::BadTargetUrl(format!(
                    "Hostname too long for SOCKS5: {}",
                    host
                )));
            }
            request.push(ATYP_DOMAIN);
            request.push(host.len() as u8);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await.map_err(io_to_network)?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await.map_err(io_to_network)?;

    if reply[0] != SOCKS5_VERSION {
        return Err(ProxyError::connect(
            ConnectReason::RelayHandshake,
            format!("Invalid SOCKS version in reply: {}", reply[0]),
        ));
    }
    if reply[1] != REP_SUCCESS {
        return Err(ProxyError::connect(
            ConnectReason::Network,
            format!("Relay refused CONNECT: {}", reply_message(reply[1])),
        ));
    }

    // Drain the bound address the relay reports; it is not used.
    match reply[3] {
        ATYP_IPV4 => {
            let mut skip = [0u8; 6];
            stream.read_exact(&mut skip).await.map_err(io_to_network)?;
        }
        ATYP_IPV6 => {
            let mut skip = [0u8; 18];
            stream.read_exact(&mut skip).await.map_err(io_to_network)?;
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(io_to_network)?;
            let mut skip = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut skip).await.map_err(io_to_network)?;
        }
        other => {
            return Err(ProxyError::connect(
                ConnectReason::RelayHandshake,
                format!("Unknown address type in reply: {}", other),
            ));
        }
    }

    Ok(())
}

fn io_to_network(e: std::io::Error) -> ProxyError {
    ProxyError::connect(ConnectReason::Network, e.to_string())
}

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}
