//! Opaque tunnel establishment (CONNECT) and bidirectional relay.

use crate::error::ProxyError;
use crate::router::{ProxyContext, TunnelRequest};
use log::{debug, info};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Run a tunnel request to completion: authenticate, check policy, connect
/// upstream, confirm to the client, then pump bytes both ways until either
/// side closes.
///
/// Errors are returned only before the success banner is written; the
/// router maps them to 407/403/502. Past that point the response line is
/// already on the wire, so failures can only terminate the connection.
pub async fn handle<S>(
    client: &mut S,
    req: TunnelRequest,
    ctx: &ProxyContext,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let profile = ctx.registry.authenticate(req.proxy_auth.as_deref())?;

    if !profile.policy.is_allowed(&req.target_host) {
        return Err(ProxyError::Forbidden(req.target_host.clone()));
    }

    let mut upstream = profile
        .upstream
        .connect(&req.target_host, req.target_port, ctx.connect_timeout)
        .await?;

    info!(
        "CONNECT {}:{} as '{}' ({:?})",
        req.target_host, req.target_port, profile.credentials.username, upstream.via
    );

    let banner = format!(
        "HTTP/1.1 200 Connection Established\r\nProxy-Agent: {}\r\n\r\n",
        ctx.proxy_agent
    );
    if client.write_all(banner.as_bytes()).await.is_err() || client.flush().await.is_err() {
        return Ok(());
    }

    // Client bytes that rode along with the CONNECT head go first.
    if !req.leftover.is_empty() && upstream.stream.write_all(&req.leftover).await.is_err() {
        return Ok(());
    }

    // copy_bidirectional propagates EOF on one side as a write shutdown on
    // the other, so in-flight data toward the still-open side is delivered.
    let relay = tokio::io::copy_bidirectional(client, &mut upstream.stream);
    let result = match ctx.relay_timeout {
        Some(limit) => match timeout(limit, relay).await {
            Ok(result) => result,
            Err(_) => {
                debug!(
                    "Tunnel to {}:{} hit the relay time limit",
                    req.target_host, req.target_port
                );
                return Ok(());
            }
        },
        None => relay.await,
    };

    match result {
        Ok((to_upstream, to_client)) => debug!(
            "Tunnel to {}:{} closed ({} bytes up, {} bytes down)",
            req.target_host, req.target_port, to_upstream, to_client
        ),
        Err(e) => debug!(
            "Tunnel to {}:{} aborted: {}",
            req.target_host, req.target_port, e
        ),
    }

    Ok(())
}
