use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

#[derive(Debug, Clone, Parser)]
#[command(name = "hoprelay", about = "Local proxy chain relay")]
pub struct Cli {
    /// Path to the runtime configuration file (defaults to ./hoprelay.toml if present).
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Skip the corporate hop and connect straight to the rotating proxy.
    #[arg(long)]
    pub no_corporate: bool,

    /// Override the configured log format.
    #[arg(long, value_enum)]
    pub log: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}
