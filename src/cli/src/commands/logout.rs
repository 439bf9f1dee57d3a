//! `a3s-relay logout` command: Remove stored registry credentials.

use clap::Args;

use a3s_relay_core::config::RelayConfig;
use a3s_relay_runtime::CredentialStore;

#[derive(Args)]
pub struct LogoutArgs {
    /// Registry server
    pub server: String,
}

pub async fn execute(args: LogoutArgs, config: &RelayConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = CredentialStore::at(config.credentials_path.as_deref())?;

    if store.remove(&args.server)? {
        println!("Removing login credentials for {}", args.server);
    } else {
        println!("Not logged in to {}", args.server);
    }
    Ok(())
}
