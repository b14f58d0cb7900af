use std::net::SocketAddr;

use anyhow::{Context, Result};
use http::StatusCode;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::AppContext;
use super::request::{self, RequestError};
use super::respond::send_error;
use super::{connect, forward};

pub async fn start_listener(app: AppContext, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = TcpListener::bind(app.settings.listen)
        .await
        .with_context(|| format!("failed to bind listener on {}", app.settings.listen))?;
    info!(listen = %app.settings.listen, "listener started");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        error!(error = %err, "accept failed");
                        continue;
                    }
                };
                let _ = stream.set_nodelay(true);
                let app = app.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(app, stream, peer).await {
                        debug!(%peer, error = %err, "connection handler failed");
                    }
                });
            }
            _ = shutdown.changed() => {
                info!("listener shutting down");
                break;
            }
        }
    }
    Ok(())
}

async fn handle_connection(app: AppContext, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let mut client = BufReader::new(stream);

    let request = match request::read_request(&mut client, peer, &app.settings).await {
        Ok(Some(request)) => request,
        Ok(None) => {
            debug!(%peer, "client disconnected without a request");
            return Ok(());
        }
        Err(RequestError::Malformed(detail)) => {
            warn!(%peer, detail, "malformed request");
            send_error(
                &mut client,
                StatusCode::BAD_REQUEST,
                "Bad Request",
                app.settings.client_timeout(),
            )
            .await;
            return Ok(());
        }
        Err(err) => {
            // Timeouts and read errors before a full request: nothing useful
            // to tell the client.
            debug!(%peer, error = %err, "failed to read request");
            return Ok(());
        }
    };

    if request.is_connect() {
        connect::handle_connect(&app, client, &request, peer).await
    } else {
        forward::handle_forward(&app, client, &request, peer).await
    }
}
