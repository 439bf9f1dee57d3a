//! `a3s-relay backup` command: Back up tagged artifacts to local storage.

use std::path::PathBuf;

use clap::Args;

use a3s_relay_core::config::RelayConfig;
use a3s_relay_runtime::{
    parse_artifacts_to_backup, run_backup, BackupOptions, OutputFormat, Target, TextStatus,
};

use super::RemoteFlags;
use crate::output::{format_bytes, BackupPrinter};

#[derive(Args)]
pub struct BackupArgs {
    /// Artifacts to back up: <registry>/<repo>[:<tag>[,<tag>...]] (all tags when none given)
    pub reference: String,

    /// Output path; a ".tar" suffix writes an archive, anything else a layout directory
    #[arg(short, long)]
    pub output: PathBuf,

    /// Include the referrers of each tagged artifact
    #[arg(long)]
    pub include_referrers: bool,

    /// Maximum concurrent operations (default: config or 3)
    #[arg(long)]
    pub concurrency: Option<usize>,

    #[command(flatten)]
    pub remote: RemoteFlags,
}

pub async fn execute(
    args: BackupArgs,
    config: &RelayConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let (repository, tags) = parse_artifacts_to_backup(&args.reference)?;
    let concurrency = config.effective_concurrency(args.concurrency)?;

    let src = Target::remote(&repository)?.open_source(&args.remote.target_options(config))?;
    let options = BackupOptions {
        include_referrers: args.include_referrers,
        concurrency,
        ..BackupOptions::new(&args.output)
    };

    let summary = run_backup(
        src.as_ref(),
        &repository,
        tags,
        &TextStatus::stdout(),
        &BackupPrinter::new(std::io::stdout()),
        &options,
    )
    .await?;

    if OutputFormat::from_path(&summary.output) == OutputFormat::Directory {
        println!("Total size: {}", format_bytes(summary.size));
    }
    Ok(())
}
