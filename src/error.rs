use thiserror::Error;

/// Why an upstream connection attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReason {
    /// TCP/DNS failure or timeout, or the relay reported the destination
    /// unreachable.
    Network,
    /// The SOCKS5 relay violated the protocol during the handshake.
    RelayHandshake,
    /// The SOCKS5 relay refused the configured credentials.
    AuthRejected,
}

impl std::fmt::Display for ConnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectReason::Network => write!(f, "network"),
            ConnectReason::RelayHandshake => write!(f, "relay-handshake"),
            ConnectReason::AuthRejected => write!(f, "auth-rejected"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Destination not allowed: {0}")]
    Forbidden(String),

    #[error("Upstream connect error ({reason}): {message}")]
    Connect {
        reason: ConnectReason,
        message: String,
    },

    #[error("Invalid target URL: {0}")]
    BadTargetUrl(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Bad upstream response: {0}")]
    BadUpstreamResponse(String),

    #[error("Forwarding error: {0}")]
    Forward(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),
}

impl ProxyError {
    pub fn connect(reason: ConnectReason, message: impl Into<String>) -> Self {
        ProxyError::Connect {
            reason,
            message: message.into(),
        }
    }

    /// Status code this error surfaces as on the client connection.
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::Auth(_) => 407,
            ProxyError::Forbidden(_) => 403,
            ProxyError::Connect { .. } | ProxyError::BadUpstreamResponse(_) => 502,
            ProxyError::BadTargetUrl(_) | ProxyError::BadRequest(_) | ProxyError::Url(_) => 400,
            _ => 500,
        }
    }
}
