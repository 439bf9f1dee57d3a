//! Copy endpoints named on the command line.
//!
//! A target is either a repository on a remote registry or an OCI layout on
//! disk. Layout sources may also be a `.tar` archive of a layout.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use a3s_relay_core::config::RelayConfig;
use a3s_relay_core::descriptor;
use a3s_relay_core::error::{RelayError, Result};

use crate::oci::{is_valid_tag, ArtifactReference, CredentialStore, RegistryAuth, RegistryOptions, RemoteRepository};
use crate::store::{ContentStore, OciLayout};

/// Settings used when connecting to remote targets.
#[derive(Debug, Clone, Default)]
pub struct TargetOptions {
    pub config: RelayConfig,
    /// Plain HTTP for every registry, not only the configured ones
    pub plain_http: bool,
    /// Skip TLS verification for every registry
    pub insecure: bool,
}

impl TargetOptions {
    fn registry_options(&self, registry: &str) -> RegistryOptions {
        RegistryOptions {
            plain_http: self.plain_http || self.config.is_plain_http(registry),
            insecure: self.insecure || self.config.is_insecure(registry),
        }
    }

    fn auth(&self, registry: &str) -> Result<RegistryAuth> {
        let store = CredentialStore::at(self.config.credentials_path.as_deref())?;
        Ok(RegistryAuth::resolve(registry, &store))
    }
}

/// A copy source or destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Remote {
        reference: ArtifactReference,
    },
    Layout {
        path: PathBuf,
        /// Tag or digest inside the layout
        reference: Option<String>,
    },
}

impl Target {
    /// Parse `registry/repo[:tag|@digest]`.
    pub fn remote(raw: &str) -> Result<Self> {
        Ok(Self::Remote {
            reference: ArtifactReference::parse(raw)?,
        })
    }

    /// Parse `path[:tag|@digest]`.
    pub fn layout(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(RelayError::InvalidReference("empty layout path".to_string()));
        }

        if let Some((path, digest)) = raw.rsplit_once('@') {
            descriptor::validate_digest(digest).map_err(|_| {
                RelayError::InvalidReference(format!("invalid digest {:?} in {:?}", digest, raw))
            })?;
            return Ok(Self::Layout {
                path: PathBuf::from(path),
                reference: Some(digest.to_string()),
            });
        }

        let last_slash = raw.rfind('/');
        match raw.rfind(':') {
            Some(colon) if last_slash.map_or(true, |slash| colon > slash) => {
                let tag = &raw[colon + 1..];
                if !tag.is_empty() && !is_valid_tag(tag) {
                    return Err(RelayError::InvalidTag {
                        tag: tag.to_string(),
                        reference: raw.to_string(),
                    });
                }
                Ok(Self::Layout {
                    path: PathBuf::from(&raw[..colon]),
                    reference: (!tag.is_empty()).then(|| tag.to_string()),
                })
            }
            _ => Ok(Self::Layout {
                path: PathBuf::from(raw),
                reference: None,
            }),
        }
    }

    /// Parse as a layout or a remote reference.
    pub fn parse(raw: &str, is_layout: bool) -> Result<Self> {
        if is_layout {
            Self::layout(raw)
        } else {
            Self::remote(raw)
        }
    }

    /// Tag or digest this target selects.
    pub fn reference(&self) -> Option<&str> {
        match self {
            Self::Remote { reference } => reference.reference(),
            Self::Layout { reference, .. } => reference.as_deref(),
        }
    }

    /// Open for reading. A `.tar` layout is extracted and served read-only.
    pub fn open_source(&self, options: &TargetOptions) -> Result<Arc<dyn ContentStore>> {
        match self {
            Self::Remote { reference } => Ok(Arc::new(open_remote(reference, options)?)),
            Self::Layout { path, .. } if is_archive(path) => Ok(Arc::new(OciLayout::open_tar(path)?)),
            Self::Layout { path, .. } => Ok(Arc::new(OciLayout::open_read_only(path)?)),
        }
    }

    /// Open for writing. Layout directories are created on demand.
    pub fn open_destination(&self, options: &TargetOptions) -> Result<Arc<dyn ContentStore>> {
        match self {
            Self::Remote { reference } => Ok(Arc::new(open_remote(reference, options)?)),
            Self::Layout { path, .. } if is_archive(path) => Err(RelayError::InvalidInput(format!(
                "cannot copy into tar archive {}; use a layout directory",
                path.display()
            ))),
            Self::Layout { path, .. } => Ok(Arc::new(OciLayout::open(path)?)),
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote { reference } => write!(f, "{}", reference),
            Self::Layout {
                path,
                reference: Some(r),
            } if descriptor::validate_digest(r).is_ok() => write!(f, "{}@{}", path.display(), r),
            Self::Layout {
                path,
                reference: Some(r),
            } => write!(f, "{}:{}", path.display(), r),
            Self::Layout { path, .. } => write!(f, "{}", path.display()),
        }
    }
}

fn open_remote(reference: &ArtifactReference, options: &TargetOptions) -> Result<RemoteRepository> {
    let auth = options.auth(&reference.registry)?;
    RemoteRepository::new(
        reference,
        auth,
        &options.registry_options(&reference.registry),
    )
}

fn is_archive(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == "tar") && !path.is_dir()
}

/// Split `name:t1,t2,...` into `name:t1` and the remaining tags.
///
/// Input without a tag list is returned unchanged.
pub fn split_destination_tags(raw: &str) -> (String, Vec<String>) {
    if raw.contains('@') {
        return (raw.to_string(), Vec::new());
    }
    let last_slash = raw.rfind('/');
    match raw.rfind(':') {
        Some(colon) if last_slash.map_or(true, |slash| colon > slash) => {
            let mut tags = raw[colon + 1..]
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string);
            match tags.next() {
                Some(first) => (format!("{}:{}", &raw[..colon], first), tags.collect()),
                None => (raw[..colon].to_string(), Vec::new()),
            }
        }
        _ => (raw.to_string(), Vec::new()),
    }
}
