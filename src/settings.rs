use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail, ensure};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};

fn default_listen() -> SocketAddr {
    "127.0.0.1:8888".parse().expect("default listen address")
}

fn default_use_corporate() -> bool {
    true
}

fn default_client_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_max_header_size() -> usize {
    32 * 1024
}

fn default_max_body_size() -> usize {
    64 * 1024 * 1024
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

/// One upstream proxy hop: address plus optional Basic credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl ProxyEndpoint {
    /// Credentials are presented only when both halves are configured.
    pub fn requires_auth(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }

    /// `Basic base64(username:password)`, computed on demand.
    pub fn basic_auth_value(&self) -> Option<String> {
        if !self.requires_auth() {
            return None;
        }
        let credentials = format!("{}:{}", self.username, self.password);
        Some(format!("Basic {}", BASE64.encode(credentials)))
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// The mandatory exit hop; every request leaves through this proxy.
    pub rotating: ProxyEndpoint,
    /// Optional first hop in front of the rotating proxy.
    #[serde(default)]
    pub corporate: Option<ProxyEndpoint>,
    #[serde(default = "default_use_corporate")]
    pub use_corporate: bool,
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let config_path = resolve_config_path(cli)?;

        let cfg = Config::builder()
            .add_source(File::from(config_path).required(true))
            .add_source(
                Environment::with_prefix("HOPRELAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;

        if cli.no_corporate {
            settings.use_corporate = false;
        }
        if let Some(log) = cli.log {
            settings.log = log;
        }
        settings.expand_credentials();
        settings.validate()?;
        Ok(settings)
    }

    /// The chain is active only when the flag is set and a corporate endpoint exists.
    pub fn chain_enabled(&self) -> bool {
        self.use_corporate && self.corporate.is_some()
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    fn expand_credentials(&mut self) {
        expand_endpoint(&mut self.rotating);
        if let Some(corporate) = self.corporate.as_mut() {
            expand_endpoint(corporate);
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.rotating.host.is_empty(),
            "rotating proxy host must not be empty"
        );
        ensure!(
            self.rotating.port > 0,
            "rotating proxy port must be greater than 0"
        );
        if let Some(corporate) = &self.corporate {
            ensure!(
                !corporate.host.is_empty(),
                "corporate proxy host must not be empty"
            );
            ensure!(
                corporate.port > 0,
                "corporate proxy port must be greater than 0"
            );
        }
        ensure!(
            self.client_timeout > 0,
            "client_timeout must be greater than 0 seconds (got {})",
            self.client_timeout
        );
        ensure!(
            self.connect_timeout > 0,
            "connect_timeout must be greater than 0 seconds (got {})",
            self.connect_timeout
        );
        ensure!(
            self.max_header_size > 0,
            "max_header_size must be greater than 0 (got {})",
            self.max_header_size
        );
        ensure!(
            self.max_body_size > 0,
            "max_body_size must be greater than 0 (got {})",
            self.max_body_size
        );
        Ok(())
    }
}

fn expand_endpoint(endpoint: &mut ProxyEndpoint) {
    endpoint.host = expand_env(&endpoint.host);
    endpoint.username = expand_env(&endpoint.username);
    endpoint.password = expand_env(&endpoint.password);
}

/// Replaces `${VAR}` references with the named environment variable, or the
/// empty string when the variable is unset. Unterminated references pass
/// through verbatim.
pub fn expand_env(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                out.push_str(&std::env::var(name).unwrap_or_default());
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

impl Cli {
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

fn resolve_config_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = cli.config_path() {
        return Ok(path.to_path_buf());
    }

    for candidate in default_config_candidates() {
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    bail!(
        "no configuration file provided via --config and none found in default locations: {}",
        default_config_candidates()
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("/etc/hoprelay/hoprelay.toml"),
        PathBuf::from("hoprelay.toml"),
    ]
}
