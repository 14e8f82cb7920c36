use clap::Parser;
use heimdall_proxy::config::Config;
use heimdall_proxy::server::ProxyServer;
use log::info;
use std::path::Path;
use tokio::signal;

#[derive(Parser)]
#[clap(
    version = "0.3.0",
    about = "TLS-terminated forward proxy with per-credential whitelists and upstream routing"
)]
struct Args {
    #[clap(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[clap(long, value_name = "ADDR", help = "TLS listen address (e.g., 0.0.0.0:8443)")]
    tls_listen: Option<String>,

    #[clap(long, value_name = "ADDR", help = "Plaintext listen address (e.g., 0.0.0.0:8080)")]
    plain_listen: Option<String>,

    #[clap(long, value_name = "FILE", help = "Certificate file path")]
    certificate: Option<String>,

    #[clap(long, value_name = "FILE", help = "Private key file path")]
    private_key: Option<String>,

    #[clap(long, value_name = "DIR", help = "Directory holding ACME http-01 challenge tokens")]
    acme_challenge_dir: Option<String>,

    #[clap(long, value_name = "SECONDS", help = "Upstream connect timeout in seconds")]
    connect_timeout: Option<u64>,

    #[clap(long, value_name = "SECONDS", help = "Total lifetime cap for established relays in seconds")]
    relay_timeout: Option<u64>,

    #[clap(long, value_name = "BYTES", help = "Maximum HTTP header size in bytes")]
    max_header_size: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    // A config file wins; otherwise fall back to the single-profile
    // environment variables.
    let mut config = if let Some(config_file) = &args.config {
        if !Path::new(config_file).exists() {
            return Err(format!("Configuration file not found: {}", config_file).into());
        }
        Config::from_file(config_file)?
    } else {
        Config::from_env()?
    };
    apply_overrides(&mut config, &args)?;

    info!("Starting proxy server...");
    let server = ProxyServer::new(config)?;

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            eprintln!("Server error: {}", e);
        }
    });

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
        result = server_handle => {
            if let Err(e) = result {
                eprintln!("Server task error: {}", e);
            }
        }
    }

    info!("Proxy server stopped");
    Ok(())
}

fn apply_overrides(config: &mut Config, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(addr) = &args.tls_listen {
        config.tls_listen_addr = addr.parse()?;
    }
    if let Some(addr) = &args.plain_listen {
        config.plain_listen_addr = addr.parse()?;
    }
    if let Some(path) = &args.certificate {
        config.certificate = Some(path.clone());
    }
    if let Some(path) = &args.private_key {
        config.private_key = Some(path.clone());
    }
    if let Some(dir) = &args.acme_challenge_dir {
        config.acme_challenge_dir = Some(dir.clone());
    }
    if let Some(secs) = args.connect_timeout {
        config.connect_timeout_secs = secs;
    }
    if let Some(secs) = args.relay_timeout {
        config.relay_timeout_secs = Some(secs);
    }
    if let Some(bytes) = args.max_header_size {
        config.max_header_size = bytes;
    }
    Ok(())
}
