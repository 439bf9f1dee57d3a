use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{RelayError, Result};

/// Default number of concurrent node operations.
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Environment variable overriding the configured concurrency.
pub const CONCURRENCY_ENV: &str = "A3S_RELAY_CONCURRENCY";

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Maximum concurrent fetch/push operations per copy
    pub concurrency: usize,

    /// Registry hosts reached over plain HTTP
    pub plain_http: Vec<String>,

    /// Registry hosts whose TLS certificates are not verified
    pub insecure: Vec<String>,

    /// Credential file override (defaults to ~/.a3s/auth/credentials.json)
    pub credentials_path: Option<PathBuf>,

    /// Log level
    pub log_level: LogLevel,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            plain_http: Vec::new(),
            insecure: Vec::new(),
            credentials_path: None,
            log_level: LogLevel::Warn,
        }
    }
}

impl RelayConfig {
    /// Default config file location (`~/.a3s/relay.yaml`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".a3s").join("relay.yaml"))
    }

    /// Load the default config file, or defaults if it does not exist.
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load and validate a YAML config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: Self = serde_yaml::from_str(&data).map_err(|e| {
            RelayError::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "Loaded relay config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(RelayError::Config(
                "concurrency must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve concurrency: flag, then environment, then config file.
    pub fn effective_concurrency(&self, flag: Option<usize>) -> Result<usize> {
        let env = std::env::var(CONCURRENCY_ENV).ok();
        resolve_concurrency(flag, env.as_deref(), self.concurrency)
    }

    /// Whether a registry host should be reached over plain HTTP.
    pub fn is_plain_http(&self, host: &str) -> bool {
        self.plain_http.iter().any(|h| h == host)
    }

    /// Whether TLS verification is disabled for a registry host.
    pub fn is_insecure(&self, host: &str) -> bool {
        self.insecure.iter().any(|h| h == host)
    }
}

fn resolve_concurrency(flag: Option<usize>, env: Option<&str>, configured: usize) -> Result<usize> {
    let value = match (flag, env) {
        (Some(n), _) => n,
        (None, Some(raw)) => raw.trim().parse::<usize>().map_err(|_| {
            RelayError::Config(format!("{} must be a positive integer, got {:?}", CONCURRENCY_ENV, raw))
        })?,
        (None, None) => configured,
    };
    if value == 0 {
        return Err(RelayError::InvalidInput(
            "concurrency must be greater than 0".to_string(),
        ));
    }
    Ok(value)
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}
