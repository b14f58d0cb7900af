pub mod connect;
pub mod forward;
pub mod listener;
pub mod relay;
pub mod request;
pub mod respond;
pub mod tunnel;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;

use crate::settings::Settings;

#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
}

impl AppContext {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }

    pub fn chain_enabled(&self) -> bool {
        self.settings.chain_enabled()
    }
}

pub async fn run(app: AppContext, shutdown: watch::Receiver<bool>) -> Result<()> {
    listener::start_listener(app, shutdown).await
}
