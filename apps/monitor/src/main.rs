//! SortHub station monitor entry point.

mod commands;
mod config;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::config::{Cli, Command, MonitorConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting SortHub monitor"
    );

    let mut config = match MonitorConfig::load(cli.config.as_deref()) {
        Ok(c) => {
            tracing::info!(station = %c.station_name, "configuration loaded");
            c
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to load config, using defaults");
            MonitorConfig::default()
        }
    };
    if let Some(endpoint) = cli.endpoint {
        config.device_endpoint = endpoint;
    }

    match cli.command {
        Command::Watch => commands::watch(&config).await,
        Command::Print {
            order_number,
            qr_data,
        } => commands::print(&config, &order_number, &qr_data).await,
        Command::Status => commands::status(&config).await,
    }
}
