//! Content stores: the capability set every copy endpoint provides.
//!
//! A store is addressed by descriptor for content and by reference string
//! (a tag or a digest) for resolution. Implementations:
//! - [`MemoryStore`]: in-process store, used for tests and scratch copies
//! - [`OciLayout`]: OCI image layout directory (or a read-only tar of one)
//! - [`crate::oci::RemoteRepository`]: a repository on a remote registry

mod layout;
mod memory;

pub use layout::OciLayout;
pub use memory::MemoryStore;

use async_trait::async_trait;

use a3s_relay_core::descriptor::{self, Descriptor};
use a3s_relay_core::error::{RelayError, Result};

/// What kind of endpoint a store is, used when attributing errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Registry,
    OciLayout,
    Memory,
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Registry => write!(f, "registry"),
            Self::OciLayout => write!(f, "oci-layout"),
            Self::Memory => write!(f, "memory store"),
        }
    }
}

/// Registry host and repository a store lives in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    pub registry: String,
    pub repository: String,
}

/// Content-addressable store capability set.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Endpoint kind of this store.
    fn kind(&self) -> StoreKind;

    /// Registry identity, for stores that live on a remote registry.
    fn host_identity(&self) -> Option<HostIdentity> {
        None
    }

    /// Resolve a tag or digest to a descriptor.
    async fn resolve(&self, reference: &str) -> Result<Descriptor>;

    /// Fetch the full content of a node.
    async fn fetch(&self, desc: &Descriptor) -> Result<Vec<u8>>;

    /// Whether a node is already present.
    async fn exists(&self, desc: &Descriptor) -> Result<bool>;

    /// Store content under its descriptor.
    async fn push(&self, desc: &Descriptor, content: Vec<u8>) -> Result<()>;

    /// Point a tag at an existing manifest.
    async fn tag(&self, desc: &Descriptor, reference: &str) -> Result<()>;

    /// All tags in the store.
    async fn tags(&self) -> Result<Vec<String>>;

    /// Manifests declaring `desc` as their subject, optionally filtered by artifact type.
    async fn referrers(
        &self,
        desc: &Descriptor,
        artifact_type: Option<&str>,
    ) -> Result<Vec<Descriptor>>;

    /// Mount a blob from another repository on the same registry.
    async fn mount(&self, desc: &Descriptor, source_repository: &str) -> Result<()> {
        let _ = source_repository;
        Err(RelayError::Store(format!(
            "{} does not support mounting {}",
            self.kind(),
            desc.digest
        )))
    }

    /// Remove transient artifacts left behind by pushes.
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

/// Check content against the size and digest its descriptor claims.
pub fn verify_content(desc: &Descriptor, content: &[u8]) -> Result<()> {
    if content.len() as u64 != desc.size {
        return Err(RelayError::Store(format!(
            "size mismatch for {}: expected {} bytes, got {}",
            desc.digest,
            desc.size,
            content.len()
        )));
    }
    if !desc.digest.starts_with("sha256:") {
        descriptor::validate_digest(&desc.digest)?;
        return Ok(());
    }
    let actual = descriptor::sha256_digest(content);
    if actual != desc.digest {
        return Err(RelayError::Store(format!(
            "digest mismatch: expected {}, got {}",
            desc.digest, actual
        )));
    }
    Ok(())
}

/// Whether a reference string is a digest rather than a tag.
pub fn is_digest_reference(reference: &str) -> bool {
    descriptor::validate_digest(reference).is_ok()
}

/// Keep the referrers matching an artifact type filter.
pub(crate) fn filter_artifact_type(
    referrers: Vec<Descriptor>,
    artifact_type: Option<&str>,
) -> Vec<Descriptor> {
    match artifact_type {
        Some(wanted) => referrers
            .into_iter()
            .filter(|r| r.artifact_type.as_deref() == Some(wanted))
            .collect(),
        None => referrers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_content() {
        let desc = Descriptor::from_content("text/plain", b"hello");
        assert!(verify_content(&desc, b"hello").is_ok());
        assert!(verify_content(&desc, b"hellp").is_err());
        assert!(verify_content(&desc, b"hello!").is_err());
    }

    #[test]
    fn test_is_digest_reference() {
        let desc = Descriptor::from_content("text/plain", b"hello");
        assert!(is_digest_reference(&desc.digest));
        assert!(!is_digest_reference("v1"));
        assert!(!is_digest_reference("sha256:short"));
    }

    #[test]
    fn test_filter_artifact_type() {
        let mut sbom = Descriptor::from_content("application/vnd.oci.image.manifest.v1+json", b"a");
        sbom.artifact_type = Some("application/spdx+json".to_string());
        let sig = Descriptor::from_content("application/vnd.oci.image.manifest.v1+json", b"b");

        let all = vec![sbom.clone(), sig];
        assert_eq!(filter_artifact_type(all.clone(), None).len(), 2);
        assert_eq!(
            filter_artifact_type(all, Some("application/spdx+json")),
            vec![sbom]
        );
    }

    #[test]
    fn test_store_kind_display() {
        assert_eq!(StoreKind::Registry.to_string(), "registry");
        assert_eq!(StoreKind::OciLayout.to_string(), "oci-layout");
    }
}
