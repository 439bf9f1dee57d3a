//! `a3s-relay cp` command: Copy an artifact between registries and layouts.

use clap::Args;

use a3s_relay_core::config::RelayConfig;
use a3s_relay_core::descriptor::Platform;
use a3s_relay_core::error::RelayError;
use a3s_relay_runtime::{copy_artifact, split_destination_tags, CopyOptions, Target, TextStatus};

use super::RemoteFlags;
use crate::errors::{attribute, Endpoint};

#[derive(Args)]
pub struct CpArgs {
    /// Source: <registry>/<repo>{:<tag>|@<digest>}, or a layout path with --from-oci-layout
    pub from: String,

    /// Destination: <registry>/<repo>[:<tag>[,<tag>...]], or a layout path with --to-oci-layout
    pub to: String,

    /// Also copy the artifact's referrers
    #[arg(short, long)]
    pub recursive: bool,

    /// Maximum concurrent operations (default: config or 3)
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Copy only the manifest for this platform (os/arch[/variant])
    #[arg(long)]
    pub platform: Option<String>,

    /// Source is an OCI layout directory or tar archive
    #[arg(long)]
    pub from_oci_layout: bool,

    /// Destination is an OCI layout directory
    #[arg(long)]
    pub to_oci_layout: bool,

    #[command(flatten)]
    pub remote: RemoteFlags,
}

pub async fn execute(args: CpArgs, config: &RelayConfig) -> Result<(), Box<dyn std::error::Error>> {
    let concurrency = config.effective_concurrency(args.concurrency)?;
    let platform = args
        .platform
        .as_deref()
        .map(str::parse::<Platform>)
        .transpose()?;

    let source = Target::parse(&args.from, args.from_oci_layout)?;
    let src_ref = source
        .reference()
        .ok_or_else(|| {
            RelayError::InvalidInput(format!("source {:?} must name a tag or digest", args.from))
        })?
        .to_string();
    let (to, extra_tags) = split_destination_tags(&args.to);
    let destination = Target::parse(&to, args.to_oci_layout)?;
    let dst_ref = destination.reference().unwrap_or_default().to_string();

    let options = args.remote.target_options(config);
    let src = source.open_source(&options)?;
    let dst = destination.open_destination(&options)?;

    let copy_options = CopyOptions {
        recursive: args.recursive,
        concurrency,
        extra_tags,
        platform,
    };
    let tracker = TextStatus::stdout();
    let result = copy_artifact(
        src.as_ref(),
        &src_ref,
        dst.clone(),
        &dst_ref,
        &tracker,
        &copy_options,
    )
    .await;

    let root = match result {
        Ok(root) => root,
        Err(e) => {
            if let RelayError::TagFailed { digest, .. } = &e {
                println!("Digest: {}", digest);
            }
            return Err(attribute(
                e,
                &Endpoint::new(src.kind(), source.to_string()),
                &Endpoint::new(dst.kind(), destination.to_string()),
            ));
        }
    };

    println!(
        "Copied [{}] {} => [{}] {}",
        src.kind(),
        source,
        dst.kind(),
        destination
    );
    println!("Digest: {}", root.digest);
    Ok(())
}
