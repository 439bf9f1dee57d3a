//! `a3s-relay login` command: Store registry credentials.

use std::io::BufRead;

use clap::Args;

use a3s_relay_core::config::RelayConfig;
use a3s_relay_runtime::CredentialStore;

#[derive(Args)]
pub struct LoginArgs {
    /// Registry server, e.g. ghcr.io or localhost:5000
    pub server: String,

    /// Username
    #[arg(short, long)]
    pub username: Option<String>,

    /// Password
    #[arg(short, long, conflicts_with = "password_stdin")]
    pub password: Option<String>,

    /// Read password from stdin
    #[arg(long)]
    pub password_stdin: bool,
}

fn read_line(prompt: Option<&str>) -> std::io::Result<String> {
    if let Some(prompt) = prompt {
        eprint!("{}", prompt);
    }
    let mut input = String::new();
    std::io::stdin().lock().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

pub async fn execute(args: LoginArgs, config: &RelayConfig) -> Result<(), Box<dyn std::error::Error>> {
    let username = match args.username {
        Some(u) => u,
        None => read_line(Some("Username: "))?,
    };

    let password = if args.password_stdin {
        read_line(None)?
    } else {
        match args.password {
            Some(p) => p,
            None => read_line(Some("Password: "))?,
        }
    };

    if username.is_empty() || password.is_empty() {
        return Err("Username and password are required".into());
    }

    let store = CredentialStore::at(config.credentials_path.as_deref())?;
    store.store(&args.server, &username, &password)?;
    tracing::debug!(registry = %args.server, "Stored registry credentials");

    println!("Login Succeeded");
    Ok(())
}
