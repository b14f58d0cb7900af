use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use hoprelay::{
    cli::LogFormat,
    proxy::{self, AppContext},
    settings::{ProxyEndpoint, Settings},
};

use super::net::{find_free_port, wait_for_listener};

pub fn test_endpoint(port: u16) -> ProxyEndpoint {
    ProxyEndpoint {
        host: "127.0.0.1".to_string(),
        port,
        username: String::new(),
        password: String::new(),
    }
}

fn default_test_settings(listen: SocketAddr, rotating: ProxyEndpoint) -> Settings {
    Settings {
        listen,
        rotating,
        corporate: None,
        use_corporate: false,
        client_timeout: 10,
        connect_timeout: 5,
        max_header_size: 32 * 1024,
        max_body_size: 1024 * 1024,
        log: LogFormat::Text,
    }
}

pub struct RelayHarness {
    pub addr: SocketAddr,
    pub settings: Arc<Settings>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RelayHarness {
    /// Spawns the relay against the given rotating proxy port, no chain.
    pub async fn spawn(rotating_port: u16) -> Result<Self> {
        Self::spawn_with(rotating_port, |_| {}).await
    }

    /// Spawns the relay with a settings override applied before start.
    pub async fn spawn_with<F>(rotating_port: u16, override_fn: F) -> Result<Self>
    where
        F: FnOnce(&mut Settings),
    {
        let listen_port = find_free_port()?;
        let listen: SocketAddr = format!("127.0.0.1:{listen_port}")
            .parse()
            .expect("valid listen address");

        let mut settings = default_test_settings(listen, test_endpoint(rotating_port));
        override_fn(&mut settings);
        let listen = settings.listen;
        let settings = Arc::new(settings);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let app = AppContext::new(settings.clone());
        let handle = tokio::spawn(async move {
            if let Err(err) = proxy::run(app, shutdown_rx).await {
                tracing::error!(error = ?err, "relay run failed");
            }
        });

        wait_for_listener(listen).await?;

        Ok(Self {
            addr: listen,
            settings,
            shutdown_tx,
            handle,
        })
    }

    pub async fn connect(&self) -> Result<TcpStream> {
        Ok(TcpStream::connect(self.addr).await?)
    }

    pub fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        self.handle.abort();
        let _ = self.handle.await;
    }
}
