//! Registry credentials.
//!
//! Credentials are kept per registry host in `~/.a3s/auth/credentials.json`
//! (written atomically), with `REGISTRY_USERNAME`/`REGISTRY_PASSWORD` as a
//! fallback and anonymous access as the last resort.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use a3s_relay_core::error::{RelayError, Result};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CredentialEntry {
    username: String,
    password: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialFile {
    registries: BTreeMap<String, CredentialEntry>,
}

/// Persistent per-registry credential store.
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Store at `~/.a3s/auth/credentials.json`.
    pub fn default_path() -> Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| {
            RelayError::Config("Cannot determine home directory for credential store".to_string())
        })?;
        Ok(Self::new(home.join(".a3s").join("auth").join("credentials.json")))
    }

    /// Store at an explicit path, or the default one.
    pub fn at(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Ok(Self::new(path.to_path_buf())),
            None => Self::default_path(),
        }
    }

    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Save credentials for a registry, replacing any existing entry.
    pub fn store(&self, registry: &str, username: &str, password: &str) -> Result<()> {
        let mut file = self.load()?;
        file.registries.insert(
            normalize_registry(registry),
            CredentialEntry {
                username: username.to_string(),
                password: password.to_string(),
            },
        );
        self.save(&file)
    }

    /// Credentials for a registry as `(username, password)`.
    pub fn get(&self, registry: &str) -> Result<Option<(String, String)>> {
        Ok(self
            .load()?
            .registries
            .remove(&normalize_registry(registry))
            .map(|e| (e.username, e.password)))
    }

    /// Forget a registry. Returns whether an entry existed.
    pub fn remove(&self, registry: &str) -> Result<bool> {
        let mut file = self.load()?;
        let removed = file
            .registries
            .remove(&normalize_registry(registry))
            .is_some();
        if removed {
            self.save(&file)?;
        }
        Ok(removed)
    }

    fn load(&self) -> Result<CredentialFile> {
        if !self.path.exists() {
            return Ok(CredentialFile::default());
        }
        let data = std::fs::read_to_string(&self.path).map_err(|e| {
            RelayError::Config(format!(
                "Failed to read credential store {}: {}",
                self.path.display(),
                e
            ))
        })?;
        serde_json::from_str(&data).map_err(|e| {
            RelayError::Config(format!(
                "Failed to parse credential store {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    fn save(&self, file: &CredentialFile) -> Result<()> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).map_err(|e| {
            RelayError::Config(format!(
                "Failed to create credential store directory {}: {}",
                parent.display(),
                e
            ))
        })?;

        let data = serde_json::to_vec_pretty(file)?;
        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(&data)?;
        tmp.persist(&self.path).map_err(|e| {
            RelayError::Config(format!(
                "Failed to write credential store {}: {}",
                self.path.display(),
                e.error
            ))
        })?;
        Ok(())
    }
}

/// Docker Hub is known under several hostnames.
fn normalize_registry(registry: &str) -> String {
    let r = registry.trim().to_lowercase();
    if r == "docker.io" || r == "registry-1.docker.io" {
        "index.docker.io".to_string()
    } else {
        r
    }
}

/// Authentication for a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryAuth {
    Anonymous,
    Basic { username: String, password: String },
}

impl RegistryAuth {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    /// `REGISTRY_USERNAME`/`REGISTRY_PASSWORD`, if both are set.
    pub fn from_env() -> Option<Self> {
        let username = std::env::var("REGISTRY_USERNAME").ok()?;
        let password = std::env::var("REGISTRY_PASSWORD").ok()?;
        Some(Self::basic(username, password))
    }

    /// Credential store entry, then environment, then anonymous.
    ///
    /// An unreadable credential store is logged and skipped.
    pub fn resolve(registry: &str, store: &CredentialStore) -> Self {
        match store.get(registry) {
            Ok(Some((username, password))) => return Self::basic(username, password),
            Ok(None) => {}
            Err(e) => tracing::warn!(registry, error = %e, "Ignoring unreadable credential store"),
        }
        Self::from_env().unwrap_or(Self::Anonymous)
    }

    pub(crate) fn to_oci_auth(&self) -> OciRegistryAuth {
        match self {
            Self::Basic { username, password } => {
                OciRegistryAuth::Basic(username.clone(), password.clone())
            }
            Self::Anonymous => OciRegistryAuth::Anonymous,
        }
    }
}
