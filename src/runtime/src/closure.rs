//! Referrer closure of index roots.
//!
//! Referrers of an index's child manifests are attached to the index itself,
//! so an extended copy of the index brings them along and a referrers query
//! against the index at the destination finds them.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{stream, StreamExt, TryStreamExt};

use a3s_relay_core::descriptor::{Descriptor, ImageIndex};
use a3s_relay_core::error::{RelayError, Result};

use crate::graph::PredecessorFinder;
use crate::store::ContentStore;

/// Predecessor lookup that adds a precomputed referrer set to one root.
pub struct ReferrerClosure {
    base: Arc<dyn PredecessorFinder>,
    root: Descriptor,
    referrers: Vec<Descriptor>,
}

impl ReferrerClosure {
    pub fn new(base: Arc<dyn PredecessorFinder>, root: Descriptor, referrers: Vec<Descriptor>) -> Self {
        Self {
            base,
            root,
            referrers,
        }
    }

    /// Referrers attached to the root in addition to its own.
    pub fn referrers(&self) -> &[Descriptor] {
        &self.referrers
    }
}

#[async_trait]
impl PredecessorFinder for ReferrerClosure {
    async fn find_predecessors(
        &self,
        store: &dyn ContentStore,
        desc: &Descriptor,
    ) -> Result<Vec<Descriptor>> {
        let mut predecessors = self.base.find_predecessors(store, desc).await?;
        if *desc == self.root {
            for referrer in &self.referrers {
                if !predecessors.contains(referrer) {
                    predecessors.push(referrer.clone());
                }
            }
        }
        Ok(predecessors)
    }
}

/// Build the predecessor lookup for an extended copy of `root`.
///
/// Returns `base` itself unless `root` is an index whose children have
/// referrers other than `root`. At most `concurrency` child queries are in
/// flight. Any failure aborts the computation; a partial closure is never
/// returned.
pub async fn prepare_closure(
    src: &dyn ContentStore,
    root: &Descriptor,
    base: Arc<dyn PredecessorFinder>,
    concurrency: usize,
) -> Result<Arc<dyn PredecessorFinder>> {
    if !root.is_index() {
        return Ok(base);
    }

    let closure_error = |e: RelayError| RelayError::Closure {
        root: root.digest.clone(),
        source: Box::new(e),
    };

    let content = src.fetch(root).await.map_err(closure_error)?;
    let index: ImageIndex = serde_json::from_slice(&content).map_err(|e| closure_error(e.into()))?;
    if index.manifests.is_empty() {
        return Ok(base);
    }

    let finder = base.as_ref();
    let found: Vec<Vec<Descriptor>> = stream::iter(&index.manifests)
        .map(|child| finder.find_predecessors(src, child))
        .buffered(concurrency.max(1))
        .try_collect()
        .await
        .map_err(closure_error)?;

    let referrers = merge_referrers(root, found);
    if referrers.is_empty() {
        return Ok(base);
    }
    tracing::debug!(
        root = %root.digest,
        referrers = referrers.len(),
        "Attaching child referrers to index"
    );
    Ok(Arc::new(ReferrerClosure::new(base, root.clone(), referrers)))
}

/// Union of the per-child referrer lists in first-seen order, without `root`.
fn merge_referrers(root: &Descriptor, found: Vec<Vec<Descriptor>>) -> Vec<Descriptor> {
    let mut seen = HashSet::new();
    found
        .into_iter()
        .flatten()
        .filter(|r| r != root && seen.insert(r.clone()))
        .collect()
}

/// Number of distinct referrers `finder` reports for `root` in `store`.
pub async fn count_referrers(
    finder: &dyn PredecessorFinder,
    store: &dyn ContentStore,
    root: &Descriptor,
) -> Result<usize> {
    let referrers = finder.find_predecessors(store, root).await?;
    Ok(referrers.iter().collect::<HashSet<_>>().len())
}
