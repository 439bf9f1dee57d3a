//! Graph walk: per-node dedup, bounded I/O, successors before parents.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::{try_join_all, BoxFuture, FutureExt};
use futures::stream::{self, StreamExt, TryStreamExt};
use tokio::sync::{OnceCell, Semaphore, SemaphorePermit};

use a3s_relay_core::descriptor::{self, Descriptor};
use a3s_relay_core::error::{CopyOrigin, RelayError, Result};

use super::{CopyGraphOptions, ExtendedCopyGraphOptions, PredecessorFinder};
use crate::store::ContentStore;

/// State shared by every node of one copy operation.
struct CopyContext<'a> {
    src: &'a dyn ContentStore,
    dst: &'a dyn ContentStore,
    options: &'a CopyGraphOptions,
    limiter: Semaphore,
    nodes: DashMap<String, Arc<OnceCell<()>>>,
}

impl<'a> CopyContext<'a> {
    fn new(
        src: &'a dyn ContentStore,
        dst: &'a dyn ContentStore,
        options: &'a CopyGraphOptions,
    ) -> Self {
        Self {
            src,
            dst,
            options,
            limiter: Semaphore::new(options.concurrency.max(1)),
            nodes: DashMap::new(),
        }
    }

    async fn permit(&self) -> Result<SemaphorePermit<'_>> {
        self.limiter.acquire().await.map_err(|_| RelayError::Cancelled)
    }

    /// Copy a node once per operation, however many parents reach it.
    fn copy_node<'b>(&'b self, desc: &'b Descriptor) -> BoxFuture<'b, Result<()>> {
        async move {
            let cell = self.nodes.entry(desc.digest.clone()).or_default().clone();
            cell.get_or_try_init(|| self.copy_node_once(desc)).await?;
            Ok(())
        }
        .boxed()
    }

    async fn copy_node_once(&self, desc: &Descriptor) -> Result<()> {
        let exists = {
            let _permit = self.permit().await?;
            self.dst.exists(desc).await
        }
        .map_err(|e| destination_error("check", desc, e))?;
        if exists {
            tracing::debug!(digest = %desc.digest, "Node exists at destination, skipping");
            self.options.observer.on_skipped(desc);
            return Ok(());
        }

        if desc.is_manifest() {
            let content = self.fetch(desc).await?;
            let successors = descriptor::successors(desc, &content)
                .map_err(|e| source_error("decode", desc, e))?;
            try_join_all(successors.iter().map(|s| self.copy_node(s))).await?;
            return self.transfer(desc, Some(content)).await;
        }

        if let Some(ref repository) = self.options.mount_from {
            let mounted = {
                let _permit = self.permit().await?;
                self.dst.mount(desc, repository).await
            };
            match mounted {
                Ok(()) => {
                    tracing::debug!(digest = %desc.digest, from = %repository, "Mounted blob");
                    self.options.observer.on_mounted(desc, repository);
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!(
                        digest = %desc.digest,
                        error = %e,
                        "Mount failed, falling back to copy"
                    );
                }
            }
        }
        self.transfer(desc, None).await
    }

    /// Fetch (unless already fetched) and push one node.
    async fn transfer(&self, desc: &Descriptor, content: Option<Vec<u8>>) -> Result<()> {
        self.options.observer.pre_copy(desc);
        let content = match content {
            Some(content) => content,
            None => self.fetch(desc).await?,
        };
        {
            let _permit = self.permit().await?;
            self.dst.push(desc, content).await
        }
        .map_err(|e| destination_error("push", desc, e))?;
        tracing::debug!(digest = %desc.digest, size = desc.size, "Copied node");
        self.options.observer.post_copy(desc);
        Ok(())
    }

    async fn fetch(&self, desc: &Descriptor) -> Result<Vec<u8>> {
        let _permit = self.permit().await?;
        self.src
            .fetch(desc)
            .await
            .map_err(|e| source_error("fetch", desc, e))
    }
}

fn source_error(operation: &str, desc: &Descriptor, e: RelayError) -> RelayError {
    RelayError::copy(CopyOrigin::Source, format!("{} {}", operation, desc.digest), e)
}

fn destination_error(operation: &str, desc: &Descriptor, e: RelayError) -> RelayError {
    RelayError::copy(
        CopyOrigin::Destination,
        format!("{} {}", operation, desc.digest),
        e,
    )
}

/// Copy the graph rooted at `root` from `src` to `dst`.
///
/// Tags nothing; the caller decides how the root is named.
pub async fn copy_graph(
    src: &dyn ContentStore,
    dst: &dyn ContentStore,
    root: &Descriptor,
    options: &CopyGraphOptions,
) -> Result<()> {
    let ctx = CopyContext::new(src, dst, options);
    ctx.copy_node(root).await
}

/// Walk predecessors upward from `node` and return the nodes nothing points at.
///
/// `node` itself is returned when it has no predecessors.
pub async fn find_roots(
    src: &dyn ContentStore,
    node: &Descriptor,
    finder: &dyn PredecessorFinder,
    concurrency: usize,
) -> Result<Vec<Descriptor>> {
    let mut visited: HashSet<Descriptor> = HashSet::from([node.clone()]);
    let mut roots = Vec::new();
    let mut frontier = vec![node.clone()];

    while !frontier.is_empty() {
        let found: Vec<(Descriptor, Vec<Descriptor>)> = stream::iter(std::mem::take(&mut frontier))
            .map(move |current| async move {
                let predecessors = finder
                    .find_predecessors(src, &current)
                    .await
                    .map_err(|e| source_error("find predecessors of", &current, e))?;
                Ok::<_, RelayError>((current, predecessors))
            })
            .buffered(concurrency.max(1))
            .try_collect()
            .await?;

        for (current, predecessors) in found {
            if predecessors.is_empty() {
                roots.push(current);
                continue;
            }
            for predecessor in predecessors {
                if visited.insert(predecessor.clone()) {
                    frontier.push(predecessor);
                }
            }
        }
    }
    Ok(roots)
}

/// Copy `root` and every graph reachable upward from it through predecessors.
///
/// All graphs share one dedup set, so a node reached from several roots is
/// transferred once.
pub async fn extended_copy_graph(
    src: &dyn ContentStore,
    dst: &dyn ContentStore,
    root: &Descriptor,
    options: &ExtendedCopyGraphOptions,
) -> Result<()> {
    let roots = find_roots(
        src,
        root,
        options.find_predecessors.as_ref(),
        options.copy.concurrency,
    )
    .await?;
    tracing::debug!(root = %root.digest, roots = roots.len(), "Found graph roots");

    let mut targets = vec![root.clone()];
    targets.extend(roots.into_iter().filter(|r| r != root));

    let ctx = CopyContext::new(src, dst, &options.copy);
    try_join_all(targets.iter().map(|t| ctx.copy_node(t))).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{CopyObserver, ReferrersFinder};
    use crate::store::{HostIdentity, MemoryStore, StoreKind};
    use a3s_relay_core::descriptor::{
        ImageIndex, ImageManifest, MEDIA_TYPE_EMPTY_JSON, MEDIA_TYPE_OCI_INDEX,
        MEDIA_TYPE_OCI_MANIFEST,
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;

    async fn push_manifest(
        store: &MemoryStore,
        layers: &[&[u8]],
        subject: Option<&Descriptor>,
    ) -> Descriptor {
        let config = Descriptor::from_content(MEDIA_TYPE_EMPTY_JSON, b"{}");
        store.push(&config, b"{}".to_vec()).await.unwrap();
        let mut layer_descs = Vec::new();
        for layer in layers {
            let desc = Descriptor::from_content("text/plain", layer);
            store.push(&desc, layer.to_vec()).await.unwrap();
            layer_descs.push(desc);
        }
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_OCI_MANIFEST.to_string()),
            artifact_type: subject.map(|_| "application/vnd.test.signature".to_string()),
            config,
            layers: layer_descs,
            subject: subject.map(Descriptor::plain),
            annotations: None,
        };
        let content = serde_json::to_vec(&manifest).unwrap();
        let desc = Descriptor::from_content(MEDIA_TYPE_OCI_MANIFEST, &content);
        store.push(&desc, content).await.unwrap();
        desc
    }

    async fn push_index(store: &MemoryStore, children: &[Descriptor]) -> Descriptor {
        let mut index = ImageIndex::new();
        index.manifests = children.to_vec();
        let content = serde_json::to_vec(&index).unwrap();
        let desc = Descriptor::from_content(MEDIA_TYPE_OCI_INDEX, &content);
        store.push(&desc, content).await.unwrap();
        desc
    }

    #[derive(Default)]
    struct Recorder {
        copied: Mutex<Vec<String>>,
        skipped: Mutex<Vec<String>>,
        mounted: Mutex<Vec<String>>,
    }

    impl CopyObserver for Recorder {
        fn post_copy(&self, desc: &Descriptor) {
            self.copied.lock().push(desc.digest.clone());
        }
        fn on_skipped(&self, desc: &Descriptor) {
            self.skipped.lock().push(desc.digest.clone());
        }
        fn on_mounted(&self, desc: &Descriptor, _source_repository: &str) {
            self.mounted.lock().push(desc.digest.clone());
        }
    }

    fn options_with(recorder: &Arc<Recorder>) -> CopyGraphOptions {
        CopyGraphOptions {
            observer: recorder.clone(),
            ..CopyGraphOptions::default()
        }
    }

    #[tokio::test]
    async fn test_copy_graph_successors_before_parent() {
        let src = MemoryStore::new();
        let dst = MemoryStore::new();
        let root = push_manifest(&src, &[b"one", b"two"], None).await;
        let recorder = Arc::new(Recorder::default());

        copy_graph(&src, &dst, &root, &options_with(&recorder)).await.unwrap();

        let copied = recorder.copied.lock().clone();
        assert_eq!(copied.len(), 4);
        assert_eq!(copied.last(), Some(&root.digest));
        assert_eq!(dst.len(), 4);
        assert!(dst.tags().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_copy_graph_shared_blob_copied_once() {
        let src = MemoryStore::new();
        let dst = MemoryStore::new();
        let a = push_manifest(&src, &[b"shared", b"a"], None).await;
        let b = push_manifest(&src, &[b"shared", b"b"], None).await;
        let index = push_index(&src, &[a, b]).await;

        copy_graph(&src, &dst, &index, &CopyGraphOptions::default())
            .await
            .unwrap();

        // index + 2 manifests + config + shared + a + b
        assert_eq!(dst.len(), 7);
        assert_eq!(dst.push_count(), 7);
    }

    #[tokio::test]
    async fn test_copy_graph_skips_existing_subtree() {
        let src = MemoryStore::new();
        let dst = MemoryStore::new();
        let root = push_manifest(&src, &[b"layer"], None).await;
        let recorder = Arc::new(Recorder::default());

        copy_graph(&src, &dst, &root, &CopyGraphOptions::default())
            .await
            .unwrap();
        let pushes = dst.push_count();

        copy_graph(&src, &dst, &root, &options_with(&recorder)).await.unwrap();
        assert_eq!(dst.push_count(), pushes);
        assert!(recorder.copied.lock().is_empty());
        assert_eq!(recorder.skipped.lock().clone(), vec![root.digest.clone()]);
    }

    #[tokio::test]
    async fn test_copy_graph_missing_blob_is_source_error() {
        let src = MemoryStore::new();
        let dst = MemoryStore::new();
        let layer = Descriptor::from_content("text/plain", b"absent");
        let config = Descriptor::from_content(MEDIA_TYPE_EMPTY_JSON, b"{}");
        src.push(&config, b"{}".to_vec()).await.unwrap();
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_OCI_MANIFEST.to_string()),
            artifact_type: None,
            config,
            layers: vec![layer],
            subject: None,
            annotations: None,
        };
        let content = serde_json::to_vec(&manifest).unwrap();
        let root = Descriptor::from_content(MEDIA_TYPE_OCI_MANIFEST, &content);
        src.push(&root, content).await.unwrap();

        let err = copy_graph(&src, &dst, &root, &CopyGraphOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.origin(), Some(CopyOrigin::Source));
        assert!(!dst.contains(&root));
    }

    #[tokio::test]
    async fn test_find_roots_walks_referrer_chain() {
        let src = MemoryStore::new();
        let base = push_manifest(&src, &[b"base"], None).await;
        let sig = push_manifest(&src, &[b"sig"], Some(&base)).await;
        let sig_of_sig = push_manifest(&src, &[b"sig2"], Some(&sig)).await;
        let sbom = push_manifest(&src, &[b"sbom"], Some(&base)).await;

        let mut roots = find_roots(&src, &base, &ReferrersFinder::default(), 2)
            .await
            .unwrap();
        roots.sort_by(|a, b| a.digest.cmp(&b.digest));
        let mut expected = vec![sig_of_sig.plain(), sbom.plain()];
        expected.sort_by(|a, b| a.digest.cmp(&b.digest));
        assert_eq!(roots, expected);

        let alone = find_roots(&src, &sig_of_sig, &ReferrersFinder::default(), 2)
            .await
            .unwrap();
        assert_eq!(alone, vec![sig_of_sig]);
    }

    #[tokio::test]
    async fn test_extended_copy_graph_brings_referrers() {
        let src = MemoryStore::new();
        let dst = MemoryStore::new();
        let base = push_manifest(&src, &[b"base"], None).await;
        let sig = push_manifest(&src, &[b"sig"], Some(&base)).await;

        extended_copy_graph(&src, &dst, &base, &ExtendedCopyGraphOptions::default())
            .await
            .unwrap();

        assert!(dst.contains(&base));
        assert!(dst.contains(&sig));
        assert_eq!(dst.referrers(&base, None).await.unwrap(), vec![sig.plain()]);
    }

    /// Memory store that claims a registry identity and accepts mounts of
    /// blobs it can find in a sibling store.
    struct MountingStore {
        inner: MemoryStore,
        sibling: MemoryStore,
    }

    #[async_trait]
    impl ContentStore for MountingStore {
        fn kind(&self) -> StoreKind {
            StoreKind::Registry
        }
        fn host_identity(&self) -> Option<HostIdentity> {
            Some(HostIdentity {
                registry: "localhost:5000".to_string(),
                repository: "target".to_string(),
            })
        }
        async fn resolve(&self, reference: &str) -> Result<Descriptor> {
            self.inner.resolve(reference).await
        }
        async fn fetch(&self, desc: &Descriptor) -> Result<Vec<u8>> {
            self.inner.fetch(desc).await
        }
        async fn exists(&self, desc: &Descriptor) -> Result<bool> {
            self.inner.exists(desc).await
        }
        async fn push(&self, desc: &Descriptor, content: Vec<u8>) -> Result<()> {
            self.inner.push(desc, content).await
        }
        async fn tag(&self, desc: &Descriptor, reference: &str) -> Result<()> {
            self.inner.tag(desc, reference).await
        }
        async fn tags(&self) -> Result<Vec<String>> {
            self.inner.tags().await
        }
        async fn referrers(
            &self,
            desc: &Descriptor,
            artifact_type: Option<&str>,
        ) -> Result<Vec<Descriptor>> {
            self.inner.referrers(desc, artifact_type).await
        }
        async fn mount(&self, desc: &Descriptor, _source_repository: &str) -> Result<()> {
            let content = self.sibling.fetch(desc).await?;
            self.inner.push(desc, content).await
        }
    }

    #[tokio::test]
    async fn test_copy_graph_mounts_blobs() {
        let src = MemoryStore::new();
        let root = push_manifest(&src, &[b"layer"], None).await;
        let sibling = MemoryStore::new();
        copy_graph(&src, &sibling, &root, &CopyGraphOptions::default())
            .await
            .unwrap();
        let dst = MountingStore {
            inner: MemoryStore::new(),
            sibling,
        };
        let recorder = Arc::new(Recorder::default());
        let options = CopyGraphOptions {
            mount_from: Some("source".to_string()),
            ..options_with(&recorder)
        };

        copy_graph(&src, &dst, &root, &options).await.unwrap();

        // config + layer mounted; the manifest itself is always transferred
        assert_eq!(recorder.mounted.lock().len(), 2);
        assert_eq!(recorder.copied.lock().clone(), vec![root.digest.clone()]);
        assert!(dst.inner.contains(&root));
    }

    #[tokio::test]
    async fn test_copy_graph_mount_failure_falls_back() {
        let src = MemoryStore::new();
        let dst = MemoryStore::new();
        let root = push_manifest(&src, &[b"layer"], None).await;
        let recorder = Arc::new(Recorder::default());
        let options = CopyGraphOptions {
            mount_from: Some("source".to_string()),
            ..options_with(&recorder)
        };

        copy_graph(&src, &dst, &root, &options).await.unwrap();

        assert!(recorder.mounted.lock().is_empty());
        assert_eq!(recorder.copied.lock().len(), 3);
        assert_eq!(dst.len(), 3);
    }
}
