pub mod auth;
pub mod body;
pub mod config;
pub mod error;
pub mod forward;
pub mod policy;
pub mod reassembler;
pub mod router;
pub mod server;
pub mod tunnel;
pub mod upstream;

pub use config::{Config, ProfileConfig, UpstreamConfig};
pub use error::{ConnectReason, ProxyError};
pub use server::ProxyServer;
