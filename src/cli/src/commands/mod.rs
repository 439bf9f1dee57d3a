//! CLI command definitions and dispatch.

mod backup;
mod cp;
mod login;
mod logout;
mod repo;
mod version;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use a3s_relay_core::config::RelayConfig;
use a3s_relay_core::error::RelayError;
use a3s_relay_runtime::TargetOptions;

/// A3S Relay: copy and back up OCI artifacts.
#[derive(Parser)]
#[command(name = "a3s-relay", version, about)]
pub struct Cli {
    /// Print debug logs
    #[arg(long, global = true)]
    pub debug: bool,

    /// Config file (default: ~/.a3s/relay.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Copy an artifact between registries and OCI layouts
    Cp(cp::CpArgs),
    /// Back up tagged artifacts into an OCI layout or tar archive
    Backup(backup::BackupArgs),
    /// Inspect repositories
    Repo(repo::RepoArgs),
    /// Log in to a registry
    Login(login::LoginArgs),
    /// Log out from a registry
    Logout(logout::LogoutArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Connection flags shared by commands that talk to registries.
#[derive(Args, Debug, Clone, Default)]
pub struct RemoteFlags {
    /// Use plain HTTP for every registry
    #[arg(long)]
    pub plain_http: bool,

    /// Skip TLS certificate verification
    #[arg(long)]
    pub insecure: bool,
}

impl RemoteFlags {
    pub(crate) fn target_options(&self, config: &RelayConfig) -> TargetOptions {
        TargetOptions {
            config: config.clone(),
            plain_http: self.plain_http,
            insecure: self.insecure,
        }
    }
}

async fn run(command: Command, config: &RelayConfig) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Cp(args) => cp::execute(args, config).await,
        Command::Backup(args) => backup::execute(args, config).await,
        Command::Repo(args) => repo::execute(args, config).await,
        Command::Login(args) => login::execute(args, config).await,
        Command::Logout(args) => logout::execute(args, config).await,
        Command::Version(args) => version::execute(args).await,
    }
}

/// Dispatch a parsed CLI to the appropriate command handler.
///
/// Ctrl-C drops the running command; staging directories and tracking
/// scopes are released by their guards.
pub async fn dispatch(cli: Cli, config: RelayConfig) -> Result<(), Box<dyn std::error::Error>> {
    tokio::select! {
        result = run(cli.command, &config) => result,
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => Err(RelayError::Cancelled.into()),
            Err(e) => Err(e.into()),
        },
    }
}
