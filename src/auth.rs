//! Credential profiles and Proxy-Authorization resolution.

use crate::config::{ProfileConfig, UpstreamConfig};
use crate::error::ProxyError;
use crate::policy::DomainPolicy;
use crate::upstream::UpstreamMode;
use base64::{Engine as _, engine::general_purpose};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// One resolved identity: credentials, destination policy and upstream
/// routing mode. Built once at startup, immutable afterwards.
#[derive(Debug)]
pub struct Profile {
    pub credentials: Credentials,
    pub policy: DomainPolicy,
    pub upstream: UpstreamMode,
}

/// The ordered, read-only set of all configured profiles. Shared across
/// every connection; resolution returns the first exact credential match in
/// registration order.
#[derive(Debug, Default)]
pub struct ProfileRegistry {
    profiles: Vec<Arc<Profile>>,
}

impl ProfileRegistry {
    pub fn from_configs(configs: &[ProfileConfig]) -> Self {
        let profiles = configs
            .iter()
            .map(|c| {
                Arc::new(Profile {
                    credentials: Credentials {
                        username: c.username.clone(),
                        password: c.password.clone(),
                    },
                    policy: DomainPolicy::new(&c.whitelist),
                    upstream: UpstreamMode::from_config(&c.upstream),
                })
            })
            .collect();
        Self { profiles }
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Resolve a `Proxy-Authorization` header value to a profile.
    ///
    /// Anything other than a well-formed `Basic <base64(user:pass)>` header
    /// that matches a registered profile is an authentication failure.
    pub fn authenticate(&self, header: Option<&str>) -> Result<Arc<Profile>, ProxyError> {
        let header = header.ok_or_else(|| {
            ProxyError::Auth("Missing Proxy-Authorization header".to_string())
        })?;

        let encoded = header
            .strip_prefix("Basic ")
            .ok_or_else(|| ProxyError::Auth("Unsupported authentication scheme".to_string()))?;

        let decoded = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|_| ProxyError::Auth("Invalid base64 encoding".to_string()))?;
        let credentials = String::from_utf8(decoded)
            .map_err(|_| ProxyError::Auth("Invalid UTF-8 in credentials".to_string()))?;

        let (username, password) = credentials
            .split_once(':')
            .ok_or_else(|| ProxyError::Auth("Invalid credentials format".to_string()))?;

        self.profiles
            .iter()
            .find(|p| {
                constant_time_eq(p.credentials.username.as_bytes(), username.as_bytes())
                    & constant_time_eq(p.credentials.password.as_bytes(), password.as_bytes())
            })
            .cloned()
            .ok_or_else(|| ProxyError::Auth("Invalid username or password".to_string()))
    }
}

/// Byte comparison that does not leak the position of the first mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
