//! A3S Relay CLI entry point.

use std::path::Path;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use a3s_relay_cli::commands::{dispatch, Cli};
use a3s_relay_cli::errors::render_error;
use a3s_relay_core::config::RelayConfig;

fn load_config(path: Option<&Path>) -> a3s_relay_core::Result<RelayConfig> {
    match path {
        Some(path) => RelayConfig::from_file(path),
        None => RelayConfig::load_default(),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    // --debug wins over RUST_LOG, which wins over the configured level
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(tracing::Level::from(config.log_level).as_str().to_lowercase())
        })
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = dispatch(cli, config).await {
        for line in render_error(e.as_ref()) {
            eprintln!("{line}");
        }
        std::process::exit(1);
    }
}
