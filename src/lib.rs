pub mod cli;
pub mod logging;
pub mod proxy;
pub mod settings;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::info;

use crate::{proxy::AppContext, settings::Settings};

pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);
    let mode = if settings.chain_enabled() {
        "corporate chain"
    } else {
        "direct to rotating proxy"
    };
    info!(
        listen = %settings.listen,
        rotating = %settings.rotating.address(),
        mode,
        "starting relay"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_shutdown_task(shutdown_tx);

    let app = AppContext::new(settings);
    proxy::run(app, shutdown_rx).await
}

#[cfg(unix)]
fn spawn_shutdown_task(shutdown_tx: watch::Sender<bool>) {
    use tokio::signal::unix::{SignalKind, signal};

    tokio::spawn(async move {
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });
}

#[cfg(not(unix))]
fn spawn_shutdown_task(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });
}
