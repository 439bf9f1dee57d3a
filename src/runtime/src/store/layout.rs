//! OCI image layout store.
//!
//! Stores content in the standard on-disk layout:
//! - `oci-layout` (layout version marker)
//! - `index.json` (tagged roots, plus every other manifest pushed)
//! - `blobs/<algorithm>/<hex>` (content addressed by digest)
//!
//! Pushes are staged under `ingest/` and renamed into place once the
//! content matches its digest. `index.json` is rewritten atomically.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use tempfile::{NamedTempFile, TempDir};

use a3s_relay_core::descriptor::{self, Descriptor, ImageIndex};
use a3s_relay_core::error::{RelayError, Result};

use super::{filter_artifact_type, verify_content, ContentStore, StoreKind};
use crate::archive;

const LAYOUT_FILE: &str = "oci-layout";
const LAYOUT_VERSION: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;
const INDEX_FILE: &str = "index.json";
const INGEST_DIR: &str = "ingest";

#[derive(Default)]
struct LayoutState {
    /// Tag name to root, in the order tags were first applied
    tags: Vec<(String, Descriptor)>,
    /// Manifests recorded without a tag
    untagged: Vec<Descriptor>,
    /// Every manifest known to the layout, by digest
    manifests: HashMap<String, Descriptor>,
    /// Subject digest to referrer descriptors
    referrers: HashMap<String, Vec<Descriptor>>,
}

impl LayoutState {
    fn record_manifest(&mut self, desc: &Descriptor, content: &[u8]) -> Result<()> {
        let plain = desc.plain();
        if self.manifests.contains_key(&desc.digest) {
            return Ok(());
        }
        if let Some(subject) = descriptor::subject_of(desc, content)? {
            let referrer = descriptor::referrer_descriptor(desc, content)?;
            let entries = self.referrers.entry(subject.digest).or_default();
            if !entries.contains(&referrer) {
                entries.push(referrer);
            }
        }
        self.manifests.insert(desc.digest.clone(), plain);
        Ok(())
    }

    fn to_index(&self) -> ImageIndex {
        let mut index = ImageIndex::new();
        let mut tagged = HashSet::new();
        for (name, desc) in &self.tags {
            index
                .manifests
                .push(desc.plain().with_annotation(descriptor::ANNOTATION_REF_NAME, name));
            tagged.insert(desc.digest.as_str());
        }
        for desc in &self.untagged {
            if !tagged.contains(desc.digest.as_str()) {
                index.manifests.push(desc.clone());
            }
        }
        index
    }
}

/// Content store backed by an OCI image layout directory.
pub struct OciLayout {
    root: PathBuf,
    state: RwLock<LayoutState>,
    read_only: bool,
    /// Extraction directory owned by a layout opened from a tar archive
    _extracted: Option<TempDir>,
}

impl OciLayout {
    /// Open a layout directory, creating it if it does not exist.
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root.join("blobs")).map_err(|e| {
            RelayError::Store(format!(
                "Failed to create OCI layout {}: {}",
                root.display(),
                e
            ))
        })?;
        let marker = root.join(LAYOUT_FILE);
        if !marker.exists() {
            std::fs::write(&marker, LAYOUT_VERSION)?;
        }

        let layout = Self::load(root.to_path_buf(), false, None)?;
        if !root.join(INDEX_FILE).exists() {
            layout.save_index(&layout.state.read())?;
        }
        Ok(layout)
    }

    /// Open an existing layout directory without allowing writes.
    pub fn open_read_only(root: &Path) -> Result<Self> {
        if !root.join(LAYOUT_FILE).exists() {
            return Err(RelayError::Store(format!(
                "{} is not an OCI layout: missing {}",
                root.display(),
                LAYOUT_FILE
            )));
        }
        Self::load(root.to_path_buf(), true, None)
    }

    /// Open a tar archive of a layout, extracted into a private temporary
    /// directory that lives as long as the store. The store is read-only.
    pub fn open_tar(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| {
            RelayError::Archive(format!("Failed to open {}: {}", path.display(), e))
        })?;
        let extracted = TempDir::new()?;
        archive::unpack(file, extracted.path())?;
        tracing::debug!(
            archive = %path.display(),
            dir = %extracted.path().display(),
            "Extracted OCI layout archive"
        );

        let root = extracted.path().to_path_buf();
        if !root.join(LAYOUT_FILE).exists() {
            return Err(RelayError::Archive(format!(
                "{} does not contain an OCI layout",
                path.display()
            )));
        }
        Self::load(root, true, Some(extracted))
    }

    /// Layout root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn load(root: PathBuf, read_only: bool, extracted: Option<TempDir>) -> Result<Self> {
        let mut state = LayoutState::default();
        let index_path = root.join(INDEX_FILE);
        if index_path.exists() {
            let data = std::fs::read(&index_path).map_err(|e| {
                RelayError::Store(format!(
                    "Failed to read {}: {}",
                    index_path.display(),
                    e
                ))
            })?;
            let index: ImageIndex = serde_json::from_slice(&data).map_err(|e| {
                RelayError::Store(format!(
                    "Failed to parse {}: {}",
                    index_path.display(),
                    e
                ))
            })?;
            for entry in &index.manifests {
                match entry.ref_name() {
                    Some(name) => {
                        state.tags.retain(|(n, _)| n != name);
                        state.tags.push((name.to_string(), entry.plain()));
                    }
                    None => state.untagged.push(entry.plain()),
                }
            }
            rebuild_graph(&root, &index.manifests, &mut state)?;
        }

        Ok(Self {
            root,
            state: RwLock::new(state),
            read_only,
            _extracted: extracted,
        })
    }

    fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        blob_path(&self.root, digest)
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(RelayError::Store(format!(
                "OCI layout {} is read-only",
                self.root.display()
            )));
        }
        Ok(())
    }

    fn save_index(&self, state: &LayoutState) -> Result<()> {
        let data = serde_json::to_vec_pretty(&state.to_index())?;
        let mut tmp = NamedTempFile::new_in(&self.root)?;
        tmp.write_all(&data)?;
        tmp.persist(self.root.join(INDEX_FILE))
            .map_err(|e| RelayError::Io(e.error))?;
        Ok(())
    }
}

fn blob_path(root: &Path, digest: &str) -> Result<PathBuf> {
    descriptor::validate_digest(digest)?;
    let (algorithm, encoded) = digest
        .split_once(':')
        .ok_or_else(|| RelayError::InvalidReference(format!("invalid digest {:?}", digest)))?;
    Ok(root.join("blobs").join(algorithm).join(encoded))
}

/// Walk the manifests reachable from the index to restore the manifest
/// table and the subject index.
fn rebuild_graph(root: &Path, entries: &[Descriptor], state: &mut LayoutState) -> Result<()> {
    let mut stack: Vec<Descriptor> = entries.iter().map(Descriptor::plain).collect();
    let mut visited = HashSet::new();
    while let Some(desc) = stack.pop() {
        if !desc.is_manifest() || !visited.insert(desc.digest.clone()) {
            continue;
        }
        let path = blob_path(root, &desc.digest)?;
        let content = match std::fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(digest = %desc.digest, "Manifest listed in index is missing");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        state.record_manifest(&desc, &content)?;
        stack.extend(
            descriptor::successors(&desc, &content)?
                .into_iter()
                .filter(Descriptor::is_manifest),
        );
    }
    Ok(())
}

fn write_blob(root: &Path, path: &Path, content: &[u8]) -> Result<()> {
    let ingest = root.join(INGEST_DIR);
    std::fs::create_dir_all(&ingest)?;
    let mut tmp = NamedTempFile::new_in(&ingest)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    tmp.persist(path).map_err(|e| RelayError::Io(e.error))?;
    Ok(())
}

#[async_trait]
impl ContentStore for OciLayout {
    fn kind(&self) -> StoreKind {
        StoreKind::OciLayout
    }

    async fn resolve(&self, reference: &str) -> Result<Descriptor> {
        let state = self.state.read();
        if let Some((_, desc)) = state.tags.iter().find(|(name, _)| name == reference) {
            return Ok(desc.clone());
        }
        state
            .manifests
            .get(reference)
            .cloned()
            .ok_or_else(|| RelayError::NotFound {
                reference: reference.to_string(),
            })
    }

    async fn fetch(&self, desc: &Descriptor) -> Result<Vec<u8>> {
        let path = self.blob_path(&desc.digest)?;
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RelayError::NotFound {
                    reference: desc.digest.clone(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        verify_content(desc, &content)?;
        Ok(content)
    }

    async fn exists(&self, desc: &Descriptor) -> Result<bool> {
        Ok(self.blob_path(&desc.digest)?.exists())
    }

    async fn push(&self, desc: &Descriptor, content: Vec<u8>) -> Result<()> {
        self.ensure_writable()?;
        verify_content(desc, &content)?;

        let path = self.blob_path(&desc.digest)?;
        let content = if path.exists() {
            content
        } else {
            let root = self.root.clone();
            tokio::task::spawn_blocking(move || {
                write_blob(&root, &path, &content).map(|_| content)
            })
            .await
            .map_err(|e| RelayError::Store(format!("Blob writer task failed: {}", e)))??
        };

        if desc.is_manifest() {
            let mut state = self.state.write();
            if state.manifests.contains_key(&desc.digest) {
                return Ok(());
            }
            state.record_manifest(desc, &content)?;
            state.untagged.push(desc.plain());
            self.save_index(&state)?;
        }
        tracing::debug!(digest = %desc.digest, size = desc.size, "Stored content in OCI layout");
        Ok(())
    }

    async fn tag(&self, desc: &Descriptor, reference: &str) -> Result<()> {
        self.ensure_writable()?;
        if reference.is_empty() {
            return Err(RelayError::InvalidReference("empty tag".to_string()));
        }

        let mut state = self.state.write();
        if !state.manifests.contains_key(&desc.digest) {
            return Err(RelayError::NotFound {
                reference: desc.digest.clone(),
            });
        }
        if reference == desc.digest {
            return Ok(());
        }
        if super::is_digest_reference(reference) {
            return Err(RelayError::InvalidReference(format!(
                "cannot tag {} with digest {}",
                desc.digest, reference
            )));
        }

        let entry = (reference.to_string(), desc.plain());
        match state.tags.iter().position(|(name, _)| name == reference) {
            Some(i) => state.tags[i] = entry,
            None => state.tags.push(entry),
        }
        self.save_index(&state)
    }

    async fn tags(&self) -> Result<Vec<String>> {
        let mut tags: Vec<String> = self
            .state
            .read()
            .tags
            .iter()
            .map(|(name, _)| name.clone())
            .collect();
        tags.sort();
        Ok(tags)
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

    async fn cleanup(&self) -> Result<()> {
        let ingest = self.root.join(INGEST_DIR);
        if ingest.exists() {
            tokio::fs::remove_dir_all(&ingest).await?;
        }
        Ok(())
    }
}
