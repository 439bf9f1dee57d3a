//! `a3s-relay version` command.

use clap::Args;

#[derive(Args)]
pub struct VersionArgs;

pub async fn execute(_args: VersionArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("a3s-relay version {}", a3s_relay_core::VERSION);
    Ok(())
}
