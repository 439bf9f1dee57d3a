//! Graph replication engine.
//!
//! Copies the descriptor graph rooted at a node from one [`ContentStore`] to
//! another. Nodes already present at the destination are skipped together
//! with everything below them; successors land before the manifests that
//! reference them, so a destination never holds a manifest whose content is
//! missing.
//!
//! The extended mode additionally walks *up* from the root through a
//! [`PredecessorFinder`] (by default: the store's referrers) and copies
//! every graph found that way.

mod copy;

pub use copy::{copy_graph, extended_copy_graph, find_roots};

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};

use a3s_relay_core::descriptor::{Descriptor, ImageIndex, Platform};
use a3s_relay_core::error::{CopyOrigin, RelayError, Result};
use a3s_relay_core::DEFAULT_CONCURRENCY;

use crate::store::ContentStore;

/// Lookup of the nodes that point at a given node.
#[async_trait]
pub trait PredecessorFinder: Send + Sync {
    async fn find_predecessors(
        &self,
        store: &dyn ContentStore,
        desc: &Descriptor,
    ) -> Result<Vec<Descriptor>>;
}

/// Predecessors are the store's referrers, optionally of one artifact type.
#[derive(Debug, Clone, Default)]
pub struct ReferrersFinder {
    pub artifact_type: Option<String>,
}

#[async_trait]
impl PredecessorFinder for ReferrersFinder {
    async fn find_predecessors(
        &self,
        store: &dyn ContentStore,
        desc: &Descriptor,
    ) -> Result<Vec<Descriptor>> {
        store.referrers(desc, self.artifact_type.as_deref()).await
    }
}

/// Node and tag lifecycle callbacks.
pub trait CopyObserver: Send + Sync {
    /// A node is about to be transferred.
    fn pre_copy(&self, _desc: &Descriptor) {}
    /// A node has been transferred.
    fn post_copy(&self, _desc: &Descriptor) {}
    /// A node already exists at the destination.
    fn on_skipped(&self, _desc: &Descriptor) {}
    /// A blob was mounted from another repository instead of transferred.
    fn on_mounted(&self, _desc: &Descriptor, _source_repository: &str) {}
    /// A tag now points at a node.
    fn on_tagged(&self, _desc: &Descriptor, _tag: &str) {}
}

/// Observer that ignores every event.
pub struct NoopObserver;

impl CopyObserver for NoopObserver {}

/// Options for [`copy_graph`].
#[derive(Clone)]
pub struct CopyGraphOptions {
    /// Maximum concurrent fetch/push operations
    pub concurrency: usize,
    /// Repository on the destination registry to mount blobs from
    pub mount_from: Option<String>,
    pub observer: Arc<dyn CopyObserver>,
}

impl Default for CopyGraphOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            mount_from: None,
            observer: Arc::new(NoopObserver),
        }
    }
}

/// Options for [`extended_copy_graph`].
#[derive(Clone)]
pub struct ExtendedCopyGraphOptions {
    pub copy: CopyGraphOptions,
    pub find_predecessors: Arc<dyn PredecessorFinder>,
}

impl Default for ExtendedCopyGraphOptions {
    fn default() -> Self {
        Self {
            copy: CopyGraphOptions::default(),
            find_predecessors: Arc::new(ReferrersFinder::default()),
        }
    }
}

/// Resolve a reference, narrowing an index to one platform when asked.
///
/// A platform request against a single manifest returns the manifest.
pub async fn resolve(
    store: &dyn ContentStore,
    reference: &str,
    platform: Option<&Platform>,
) -> Result<Descriptor> {
    let desc = store.resolve(reference).await?;
    let platform = match platform {
        Some(platform) if desc.is_index() => platform,
        _ => return Ok(desc),
    };

    let content = store.fetch(&desc).await?;
    let index: ImageIndex = serde_json::from_slice(&content)?;
    index
        .select_platform(platform)
        .map(Descriptor::plain)
        .ok_or_else(|| RelayError::NotFound {
            reference: format!("{} for platform {}", reference, platform),
        })
}

/// Resolve `src_ref`, copy its graph and tag the root as `dst_ref`.
pub async fn copy(
    src: &dyn ContentStore,
    src_ref: &str,
    dst: &dyn ContentStore,
    dst_ref: &str,
    options: &CopyGraphOptions,
    platform: Option<&Platform>,
) -> Result<Descriptor> {
    let root = resolve(src, src_ref, platform)
        .await
        .map_err(|e| RelayError::copy(CopyOrigin::Source, format!("resolve {}", src_ref), e))?;
    copy_graph(src, dst, &root, options).await?;
    dst.tag(&root, dst_ref)
        .await
        .map_err(|e| RelayError::copy(CopyOrigin::Destination, format!("tag {}", dst_ref), e))?;
    Ok(root)
}

/// Apply several tags to one node, at most `concurrency` at a time.
///
/// The first failure stops the remaining tags; tags already applied stay.
pub async fn tag_n(
    dst: &dyn ContentStore,
    desc: &Descriptor,
    tags: &[String],
    concurrency: usize,
    observer: &dyn CopyObserver,
) -> Result<()> {
    stream::iter(tags)
        .map(|tag| async move {
            dst.tag(desc, tag)
                .await
                .map_err(|e| RelayError::TagFailed {
                    tag: tag.clone(),
                    digest: desc.digest.clone(),
                    source: Box::new(e),
                })?;
            observer.on_tagged(desc, tag);
            Ok::<(), RelayError>(())
        })
        .buffer_unordered(concurrency.max(1))
        .try_collect::<Vec<()>>()
        .await?;
    Ok(())
}
