//! In-memory content store.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use a3s_relay_core::descriptor::{self, Descriptor};
use a3s_relay_core::error::{RelayError, Result};

use super::{filter_artifact_type, verify_content, ContentStore, HostIdentity, StoreKind};

#[derive(Default)]
struct MemoryState {
    content: HashMap<String, (Descriptor, Vec<u8>)>,
    tags: BTreeMap<String, Descriptor>,
    referrers: HashMap<String, Vec<Descriptor>>,
}

/// Content store held entirely in memory.
///
/// Keeps a subject index on push so referrers can be queried, and counts
/// pushes so callers can observe whether a copy wrote anything.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    identity: Option<HostIdentity>,
    pushes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A memory store that reports itself as a registry repository.
    pub fn with_identity(registry: impl Into<String>, repository: impl Into<String>) -> Self {
        Self {
            identity: Some(HostIdentity {
                registry: registry.into(),
                repository: repository.into(),
            }),
            ..Self::default()
        }
    }

    /// Number of successful pushes so far.
    pub fn push_count(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    /// Number of nodes stored.
    pub fn len(&self) -> usize {
        self.state.read().content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a node is stored.
    pub fn contains(&self, desc: &Descriptor) -> bool {
        self.state.read().content.contains_key(&desc.digest)
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Memory
    }

    fn host_identity(&self) -> Option<HostIdentity> {
        self.identity.clone()
    }

    async fn resolve(&self, reference: &str) -> Result<Descriptor> {
        let state = self.state.read();
        if let Some(desc) = state.tags.get(reference) {
            return Ok(desc.clone());
        }
        state
            .content
            .get(reference)
            .filter(|(desc, _)| desc.is_manifest())
            .map(|(desc, _)| desc.clone())
            .ok_or_else(|| RelayError::NotFound {
                reference: reference.to_string(),
            })
    }

    async fn fetch(&self, desc: &Descriptor) -> Result<Vec<u8>> {
        self.state
            .read()
            .content
            .get(&desc.digest)
            .map(|(_, content)| content.clone())
            .ok_or_else(|| RelayError::NotFound {
                reference: desc.digest.clone(),
            })
    }

    async fn exists(&self, desc: &Descriptor) -> Result<bool> {
        Ok(self.state.read().content.contains_key(&desc.digest))
    }

    async fn push(&self, desc: &Descriptor, content: Vec<u8>) -> Result<()> {
        verify_content(desc, &content)?;
        let subject = descriptor::subject_of(desc, &content)?;
        let referrer = match subject {
            Some(_) => Some(descriptor::referrer_descriptor(desc, &content)?),
            None => None,
        };

        let mut state = self.state.write();
        if state.content.contains_key(&desc.digest) {
            return Ok(());
        }
        state
            .content
            .insert(desc.digest.clone(), (desc.plain(), content));
        if let (Some(subject), Some(referrer)) = (subject, referrer) {
            let entries = state.referrers.entry(subject.digest).or_default();
            if !entries.contains(&referrer) {
                entries.push(referrer);
            }
        }
        self.pushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn tag(&self, desc: &Descriptor, reference: &str) -> Result<()> {
        let mut state = self.state.write();
        if !state.content.contains_key(&desc.digest) {
            return Err(RelayError::NotFound {
                reference: desc.digest.clone(),
            });
        }
        if reference != desc.digest {
            state.tags.insert(reference.to_string(), desc.plain());
        }
        Ok(())
    }

    async fn tags(&self) -> Result<Vec<String>> {
        Ok(self.state.read().tags.keys().cloned().collect())
    }

    async fn referrers(
        &self,
        desc: &Descriptor,
        artifact_type: Option<&str>,
    ) -> Result<Vec<Descriptor>> {
        let referrers = self
            .state
            .read()
            .referrers
            .get(&desc.digest)
            .cloned()
            .unwrap_or_default();
        Ok(filter_artifact_type(referrers, artifact_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use a3s_relay_core::descriptor::{ImageManifest, MEDIA_TYPE_EMPTY_JSON, MEDIA_TYPE_OCI_MANIFEST};

    fn manifest_with_subject(subject: Option<Descriptor>) -> (Descriptor, Vec<u8>) {
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_OCI_MANIFEST.to_string()),
            artifact_type: Some("application/vnd.example".to_string()),
            config: Descriptor::from_content(MEDIA_TYPE_EMPTY_JSON, b"{}"),
            layers: Vec::new(),
            subject,
            annotations: None,
        };
        let content = serde_json::to_vec(&manifest).unwrap();
        (Descriptor::from_content(MEDIA_TYPE_OCI_MANIFEST, &content), content)
    }

    #[tokio::test]
    async fn test_push_fetch_resolve() {
        let store = MemoryStore::new();
        let (desc, content) = manifest_with_subject(None);

        store.push(&desc, content.clone()).await.unwrap();
        assert!(store.exists(&desc).await.unwrap());
        assert_eq!(store.fetch(&desc).await.unwrap(), content);
        assert_eq!(store.resolve(&desc.digest).await.unwrap(), desc);

        store.tag(&desc, "v1").await.unwrap();
        assert_eq!(store.resolve("v1").await.unwrap(), desc);
        assert_eq!(store.tags().await.unwrap(), vec!["v1"]);
    }

    #[tokio::test]
    async fn test_push_is_idempotent() {
        let store = MemoryStore::new();
        let blob = Descriptor::from_content("text/plain", b"hello");
        store.push(&blob, b"hello".to_vec()).await.unwrap();
        store.push(&blob, b"hello".to_vec()).await.unwrap();
        assert_eq!(store.push_count(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_push_rejects_mismatched_content() {
        let store = MemoryStore::new();
        let blob = Descriptor::from_content("text/plain", b"hello");
        assert!(store.push(&blob, b"world".to_vec()).await.is_err());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_unknown() {
        let store = MemoryStore::new();
        let err = store.resolve("missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_blob_digest_does_not_resolve() {
        let store = MemoryStore::new();
        let blob = Descriptor::from_content("text/plain", b"hello");
        store.push(&blob, b"hello".to_vec()).await.unwrap();
        assert!(store.resolve(&blob.digest).await.is_err());
    }

    #[tokio::test]
    async fn test_tag_requires_content() {
        let store = MemoryStore::new();
        let (desc, _) = manifest_with_subject(None);
        assert!(store.tag(&desc, "v1").await.is_err());
    }

    #[tokio::test]
    async fn test_referrers_index() {
        let store = MemoryStore::new();
        let (subject, subject_content) = manifest_with_subject(None);
        store.push(&subject, subject_content).await.unwrap();

        let (referrer, content) = manifest_with_subject(Some(subject.clone()));
        store.push(&referrer, content).await.unwrap();

        let found = store.referrers(&subject, None).await.unwrap();
        assert_eq!(found, vec![referrer]);
        assert_eq!(
            found[0].artifact_type.as_deref(),
            Some("application/vnd.example")
        );
        assert!(store
            .referrers(&subject, Some("application/other"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_mount_unsupported_by_default() {
        let store = MemoryStore::with_identity("localhost:5000", "hello");
        let blob = Descriptor::from_content("text/plain", b"hello");
        assert!(store.mount(&blob, "other").await.is_err());
        assert_eq!(
            store.host_identity(),
            Some(HostIdentity {
                registry: "localhost:5000".to_string(),
                repository: "hello".to_string(),
            })
        );
    }
}
