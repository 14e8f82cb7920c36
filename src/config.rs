use crate::error::ProxyError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

fn default_plain_listen() -> SocketAddr {
    "0.0.0.0:8080".parse().unwrap()
}

fn default_tls_listen() -> SocketAddr {
    "0.0.0.0:8443".parse().unwrap()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_head_timeout() -> u64 {
    30
}

fn default_max_header_size() -> usize {
    16 * 1024
}

fn default_proxy_agent() -> String {
    "Heimdall-Proxy".to_string()
}

/// Upstream routing mode for one profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum UpstreamConfig {
    Direct,
    Socks5 {
        host: String,
        port: u16,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
    },
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        UpstreamConfig::Direct
    }
}

/// One configured credential profile: who may authenticate, which
/// destinations they may reach, and how their traffic leaves the proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    pub username: String,
    pub password: String,
    /// Domain patterns, each either an exact hostname or `*.`-prefixed.
    /// Empty means all destinations are allowed.
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default)]
    pub upstream: UpstreamConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Plaintext listener: ACME challenge responses and the info banner.
    #[serde(default = "default_plain_listen")]
    pub plain_listen_addr: SocketAddr,
    /// TLS listener: all proxy traffic.
    #[serde(default = "default_tls_listen")]
    pub tls_listen_addr: SocketAddr,
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    /// Directory the certificate collaborator writes `http-01` challenge
    /// tokens into. Served under `/.well-known/acme-challenge/`.
    #[serde(default)]
    pub acme_challenge_dir: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Bound on reading a request head from the client.
    #[serde(default = "default_head_timeout")]
    pub head_timeout_secs: u64,
    /// Cap on the total lifetime of an established relay, idle or not.
    /// None leaves the tunnel open until either side closes.
    #[serde(default)]
    pub relay_timeout_secs: Option<u64>,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    #[serde(default = "default_proxy_agent")]
    pub proxy_agent: String,
    #[serde(default)]
    pub profiles: Vec<ProfileConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            plain_listen_addr: default_plain_listen(),
            tls_listen_addr: default_tls_listen(),
            certificate: None,
            private_key: None,
            acme_challenge_dir: None,
            connect_timeout_secs: default_connect_timeout(),
            head_timeout_secs: default_head_timeout(),
            relay_timeout_secs: None,
            max_header_size: default_max_header_size(),
            proxy_agent: default_proxy_agent(),
            profiles: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, ProxyError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| ProxyError::Config(format!("Failed to parse {}: {}", path, e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Single-profile fallback from the environment: `USERNAME`, `PASSWORD`
    /// and a comma-separated `WHITELIST_DOMAINS`.
    pub fn from_env() -> Result<Self, ProxyError> {
        let username = std::env::var("USERNAME")
            .map_err(|_| ProxyError::Config("USERNAME not set".to_string()))?;
        let password = std::env::var("PASSWORD")
            .map_err(|_| ProxyError::Config("PASSWORD not set".to_string()))?;
        let whitelist = std::env::var("WHITELIST_DOMAINS")
            .map(|raw| Self::parse_whitelist(&raw))
            .unwrap_or_default();

        let mut config = Config::default();
        config.profiles.push(ProfileConfig {
            username,
            password,
            whitelist,
            upstream: UpstreamConfig::Direct,
        });
        Ok(config)
    }

    pub fn parse_whitelist(raw: &str) -> Vec<String> {
        raw.split(',')
            .map(|d| d.trim().to_lowercase())
            .filter(|d| !d.is_empty())
            .collect()
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.profiles.is_empty() {
            return Err(ProxyError::Config(
                "At least one credential profile is required".to_string(),
            ));
        }
        for profile in &self.profiles {
            if profile.username.is_empty() {
                return Err(ProxyError::Config(
                    "Profile username must not be empty".to_string(),
                ));
            }
            if let UpstreamConfig::Socks5 { host, port, .. } = &profile.upstream {
                if host.is_empty() || *port == 0 {
                    return Err(ProxyError::Config(format!(
                        "Profile '{}' has an invalid SOCKS5 relay address",
                        profile.username
                    )));
                }
            }
        }
        Ok(())
    }
}
