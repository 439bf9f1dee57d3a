//! `a3s-relay repo` subcommands: Inspect repositories.

use clap::{Args, Subcommand};

use a3s_relay_core::config::RelayConfig;
use a3s_relay_runtime::Target;

use super::RemoteFlags;

/// Inspect repositories.
#[derive(Args)]
pub struct RepoArgs {
    #[command(subcommand)]
    pub command: RepoCommand,
}

/// Repository subcommands.
#[derive(Subcommand)]
pub enum RepoCommand {
    /// List the tags of a repository
    Tags(TagsArgs),
}

#[derive(Args)]
pub struct TagsArgs {
    /// Repository: <registry>/<repo>, or a layout path with --oci-layout
    pub repository: String,

    /// Repository is an OCI layout directory or tar archive
    #[arg(long)]
    pub oci_layout: bool,

    #[command(flatten)]
    pub remote: RemoteFlags,
}

pub async fn execute(args: RepoArgs, config: &RelayConfig) -> Result<(), Box<dyn std::error::Error>> {
    match args.command {
        RepoCommand::Tags(a) => execute_tags(a, config).await,
    }
}

async fn execute_tags(args: TagsArgs, config: &RelayConfig) -> Result<(), Box<dyn std::error::Error>> {
    let target = Target::parse(&args.repository, args.oci_layout)?;
    let store = target.open_source(&args.remote.target_options(config))?;

    for tag in store.tags().await? {
        println!("{}", tag);
    }
    Ok(())
}
