//! Copy orchestration: one artifact from a source to a destination store.
//!
//! | Destination reference | Recursive | Mode |
//! |-----------------------|-----------|------|
//! | empty                 | no        | [`CopyMode::Direct`]: graph only, no tag |
//! | non-empty             | no        | [`CopyMode::Tagged`]: resolve, copy, tag |
//! | any                   | yes       | [`CopyMode::Extended`]: graph plus referrer closure |
//!
//! Extra destination tags are applied after the primary copy. They are not
//! rolled back if one of them fails: every step is content-addressed, so a
//! retry converges on the same state.

use std::sync::Arc;

use a3s_relay_core::descriptor::{Descriptor, Platform};
use a3s_relay_core::error::{CopyOrigin, RelayError, Result};
use a3s_relay_core::DEFAULT_CONCURRENCY;

use crate::closure::prepare_closure;
use crate::graph::{
    self, copy_graph, extended_copy_graph, tag_n, CopyGraphOptions, ExtendedCopyGraphOptions,
    PredecessorFinder, ReferrersFinder,
};
use crate::status::{with_tracking, StatusTracker};
use crate::store::ContentStore;

/// Options for [`copy_artifact`].
#[derive(Debug, Clone)]
pub struct CopyOptions {
    /// Include the referrer closure of the artifact
    pub recursive: bool,
    /// Maximum concurrent node and tag operations
    pub concurrency: usize,
    /// Tags applied to the copied root after the primary destination tag
    pub extra_tags: Vec<String>,
    /// Narrow an index source to one platform's manifest
    pub platform: Option<Platform>,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            recursive: false,
            concurrency: DEFAULT_CONCURRENCY,
            extra_tags: Vec::new(),
            platform: None,
        }
    }
}

/// Replication strategy for one copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    Direct,
    Tagged,
    Extended,
}

/// Pick the replication strategy.
pub fn select_mode(dst_ref: &str, recursive: bool) -> CopyMode {
    if recursive {
        CopyMode::Extended
    } else if dst_ref.is_empty() {
        CopyMode::Direct
    } else {
        CopyMode::Tagged
    }
}

/// Repository to mount blobs from, when both stores live on the same registry.
pub fn mount_hint(src: &dyn ContentStore, dst: &dyn ContentStore) -> Option<String> {
    let source = src.host_identity()?;
    let destination = dst.host_identity()?;
    (source.registry == destination.registry).then_some(source.repository)
}

/// Result of a copy that included a referrer closure.
pub struct ClosureCopy {
    pub root: Descriptor,
    /// Predecessor lookup the copy used; query it against the destination
    /// to see the root's referrers as they were copied.
    pub finder: Arc<dyn PredecessorFinder>,
}

/// Copy `src_ref` with its referrer closure and tag it as `dst_ref`.
///
/// No tag is applied when `dst_ref` is empty or is the root's own digest.
pub async fn recursive_copy(
    src: &dyn ContentStore,
    src_ref: &str,
    dst: &dyn ContentStore,
    dst_ref: &str,
    options: &CopyGraphOptions,
    platform: Option<&Platform>,
) -> Result<ClosureCopy> {
    let root = graph::resolve(src, src_ref, platform)
        .await
        .map_err(|e| e.context(format!("failed to resolve {}", src_ref)))?;
    let finder = prepare_closure(
        src,
        &root,
        Arc::new(ReferrersFinder::default()),
        options.concurrency,
    )
    .await?;

    let extended = ExtendedCopyGraphOptions {
        copy: options.clone(),
        find_predecessors: finder.clone(),
    };
    extended_copy_graph(src, dst, &root, &extended).await?;

    if !dst_ref.is_empty() && dst_ref != root.digest {
        dst.tag(&root, dst_ref)
            .await
            .map_err(|e| RelayError::copy(CopyOrigin::Destination, format!("tag {}", dst_ref), e))?;
    }
    Ok(ClosureCopy { root, finder })
}

/// Copy one artifact, then apply any extra tags.
///
/// Returns the copied root. A failing extra tag yields
/// [`RelayError::TagFailed`], which still carries the root digest.
pub async fn copy_artifact(
    src: &dyn ContentStore,
    src_ref: &str,
    dst: Arc<dyn ContentStore>,
    dst_ref: &str,
    tracker: &dyn StatusTracker,
    options: &CopyOptions,
) -> Result<Descriptor> {
    let mode = select_mode(dst_ref, options.recursive);
    let graph_options = CopyGraphOptions {
        concurrency: options.concurrency,
        mount_from: mount_hint(src, dst.as_ref()),
        observer: tracker.observer(),
    };
    let platform = options.platform.as_ref();
    tracing::info!(
        source = src_ref,
        destination = dst_ref,
        ?mode,
        mount_from = graph_options.mount_from.as_deref(),
        "Copying artifact"
    );

    let root = with_tracking(tracker, dst.clone(), |tracked| async move {
        let tracked = tracked.as_ref();
        match mode {
            CopyMode::Direct => {
                let root = graph::resolve(src, src_ref, platform)
                    .await
                    .map_err(|e| e.context(format!("failed to resolve {}", src_ref)))?;
                copy_graph(src, tracked, &root, &graph_options).await?;
                Ok(root)
            }
            CopyMode::Tagged => {
                graph::copy(src, src_ref, tracked, dst_ref, &graph_options, platform).await
            }
            CopyMode::Extended => {
                recursive_copy(src, src_ref, tracked, dst_ref, &graph_options, platform)
                    .await
                    .map(|copied| copied.root)
            }
        }
    })
    .await?;

    if !options.extra_tags.is_empty() {
        let observer = tracker.observer();
        tag_n(
            dst.as_ref(),
            &root,
            &options.extra_tags,
            options.concurrency,
            observer.as_ref(),
        )
        .await?;
    }
    tracing::info!(digest = %root.digest, "Copy completed");
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_select_mode() {
        assert_eq!(select_mode("", false), CopyMode::Direct);
        assert_eq!(select_mode("v1", false), CopyMode::Tagged);
        assert_eq!(select_mode("", true), CopyMode::Extended);
        assert_eq!(select_mode("v1", true), CopyMode::Extended);
    }

    #[test]
    fn test_mount_hint_same_registry() {
        let src = MemoryStore::with_identity("localhost:5000", "source");
        let dst = MemoryStore::with_identity("localhost:5000", "target");
        assert_eq!(mount_hint(&src, &dst), Some("source".to_string()));
    }

    #[test]
    fn test_mount_hint_other_combinations() {
        let remote = MemoryStore::with_identity("localhost:5000", "source");
        let elsewhere = MemoryStore::with_identity("ghcr.io", "target");
        let local = MemoryStore::new();

        assert_eq!(mount_hint(&remote, &elsewhere), None);
        assert_eq!(mount_hint(&remote, &local), None);
        assert_eq!(mount_hint(&local, &remote), None);
        assert_eq!(mount_hint(&local, &local), None);
    }

    #[test]
    fn test_default_options() {
        let options = CopyOptions::default();
        assert!(!options.recursive);
        assert_eq!(options.concurrency, DEFAULT_CONCURRENCY);
        assert!(options.extra_tags.is_empty());
    }
}
