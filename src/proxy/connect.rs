use std::net::SocketAddr;

use anyhow::Result;
use http::StatusCode;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::AppContext;
use super::relay::relay;
use super::request::InboundRequest;
use super::respond::send_error;
use super::tunnel::{TunnelStream, TunnelTimeouts, establish_chained_tunnel, establish_tunnel};

#[derive(Debug, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
}

/// Splits `host:port` from a CONNECT request line. The port must be present
/// and explicit; IPv6 literals keep their brackets in the request but lose
/// them here.
pub fn parse_connect_target(target: &str) -> Option<ConnectTarget> {
    let (host, port) = target.rsplit_once(':')?;
    if host.is_empty() || port.contains(']') {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    if port == 0 {
        return None;
    }
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
        .to_string();
    Some(ConnectTarget { host, port })
}

/// Handles one CONNECT request end to end: negotiate the upstream tunnel,
/// confirm to the client, then splice bytes until either side closes.
pub async fn handle_connect(
    app: &AppContext,
    mut client: BufReader<TcpStream>,
    request: &InboundRequest,
    peer: SocketAddr,
) -> Result<()> {
    let settings = &app.settings;
    let timeouts = TunnelTimeouts::from_settings(settings);

    let Some(target) = parse_connect_target(&request.target) else {
        warn!(%peer, target = %request.target, "rejecting CONNECT with invalid target");
        send_error(
            &mut client,
            StatusCode::BAD_REQUEST,
            "Invalid port",
            settings.client_timeout(),
        )
        .await;
        return Ok(());
    };

    let upstream = match open_tunnel(app, &target, timeouts).await {
        Ok(upstream) => upstream,
        Err(err) => {
            warn!(%peer, target = %request.target, error = %err, "tunnel failed");
            send_error(
                &mut client,
                err.status_code(),
                &err.client_message(),
                settings.client_timeout(),
            )
            .await;
            return Ok(());
        }
    };

    match timeout(settings.client_timeout(), async {
        client
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;
        client.flush().await
    })
    .await
    {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            debug!(%peer, error = %err, "client went away before tunnel confirmation");
            return Ok(());
        }
        Err(_) => {
            debug!(%peer, "timed out confirming tunnel to client");
            return Ok(());
        }
    }

    info!(%peer, target = %request.target, "tunnel established");
    let stats = relay(client, upstream).await;
    info!(
        %peer,
        target = %request.target,
        sent = stats.client_to_upstream,
        received = stats.upstream_to_client,
        "tunnel closed"
    );
    Ok(())
}

async fn open_tunnel(
    app: &AppContext,
    target: &ConnectTarget,
    timeouts: TunnelTimeouts,
) -> Result<TunnelStream, super::tunnel::TunnelError> {
    let settings = &app.settings;
    match (app.chain_enabled(), settings.corporate.as_ref()) {
        (true, Some(corporate)) => {
            establish_chained_tunnel(
                &target.host,
                target.port,
                corporate,
                &settings.rotating,
                timeouts,
            )
            .await
        }
        _ => establish_tunnel(&target.host, target.port, &settings.rotating, None, timeouts).await,
    }
}
