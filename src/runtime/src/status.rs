//! Progress tracking for copy and backup operations.
//!
//! A [`StatusTracker`] opens one tracking scope per destination: it wraps the
//! destination in a [`TrackedStore`] that counts what gets pushed and reports
//! tags, and hands out a [`CopyObserver`] for node events. Trackers are
//! sinks; nothing in the orchestrators reads their state back.

use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use a3s_relay_core::descriptor::{Descriptor, ANNOTATION_TITLE};
use a3s_relay_core::error::{RelayError, Result};
use a3s_relay_core::event::{events, EventEmitter, RelayEvent};

use crate::graph::{CopyObserver, NoopObserver};
use crate::store::{ContentStore, HostIdentity, StoreKind};

/// Totals for one tracking scope.
#[derive(Debug, Default)]
pub struct TransferStats {
    nodes: AtomicUsize,
    bytes: AtomicU64,
}

impl TransferStats {
    pub fn nodes(&self) -> usize {
        self.nodes.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    fn record(&self, size: u64) {
        self.nodes.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(size, Ordering::Relaxed);
    }
}

/// The open scope of a tracker, if any.
#[derive(Debug, Default)]
pub struct TrackingState {
    current: Mutex<Option<Arc<TransferStats>>>,
}

impl TrackingState {
    /// Stats of the open scope.
    pub fn current(&self) -> Option<Arc<TransferStats>> {
        self.current.lock().clone()
    }
}

/// Sink for node and tag events with per-destination scopes.
pub trait StatusTracker: Send + Sync {
    /// Observer receiving node and tag events.
    fn observer(&self) -> Arc<dyn CopyObserver>;

    /// Scope bookkeeping for this tracker.
    fn state(&self) -> &TrackingState;

    /// Open a scope and wrap `dst` so pushes and tags are tracked.
    fn start_tracking(&self, dst: Arc<dyn ContentStore>) -> Result<Arc<dyn ContentStore>> {
        let mut current = self.state().current.lock();
        if current.is_some() {
            return Err(RelayError::Other(
                "tracking already started for another destination".to_string(),
            ));
        }
        let stats = Arc::new(TransferStats::default());
        *current = Some(stats.clone());
        Ok(Arc::new(TrackedStore {
            inner: dst,
            stats,
            observer: self.observer(),
        }))
    }

    /// Close the open scope.
    fn stop_tracking(&self) -> Result<()> {
        let stats = self
            .state()
            .current
            .lock()
            .take()
            .ok_or_else(|| RelayError::Other("tracking has not been started".to_string()))?;
        tracing::debug!(
            nodes = stats.nodes(),
            bytes = stats.bytes(),
            "Tracking scope closed"
        );
        Ok(())
    }
}

/// Destination wrapper counting pushed content and reporting tags.
pub struct TrackedStore {
    inner: Arc<dyn ContentStore>,
    stats: Arc<TransferStats>,
    observer: Arc<dyn CopyObserver>,
}

impl TrackedStore {
    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }
}

#[async_trait]
impl ContentStore for TrackedStore {
    fn kind(&self) -> StoreKind {
        self.inner.kind()
    }

    fn host_identity(&self) -> Option<HostIdentity> {
        self.inner.host_identity()
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
        self.inner.push(desc, content).await?;
        self.stats.record(desc.size);
        Ok(())
    }

    async fn tag(&self, desc: &Descriptor, reference: &str) -> Result<()> {
        self.inner.tag(desc, reference).await?;
        self.observer.on_tagged(desc, reference);
        Ok(())
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

    async fn mount(&self, desc: &Descriptor, source_repository: &str) -> Result<()> {
        self.inner.mount(desc, source_repository).await
    }

    async fn cleanup(&self) -> Result<()> {
        self.inner.cleanup().await
    }
}

/// Closes a tracking scope on drop unless it was closed explicitly.
struct TrackingScope<'a> {
    tracker: &'a dyn StatusTracker,
    closed: bool,
}

impl TrackingScope<'_> {
    fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.tracker.stop_tracking()
    }
}

impl Drop for TrackingScope<'_> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.tracker.stop_tracking() {
                tracing::debug!(error = %e, "Failed to stop abandoned tracking scope");
            }
        }
    }
}

/// Run `f` against a tracked `dst` inside one tracking scope.
///
/// The scope is closed on every exit path, including cancellation. A
/// failure to close it is returned only when `f` itself succeeded.
pub async fn with_tracking<F, Fut, T>(
    tracker: &dyn StatusTracker,
    dst: Arc<dyn ContentStore>,
    f: F,
) -> Result<T>
where
    F: FnOnce(Arc<dyn ContentStore>) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let tracked = tracker.start_tracking(dst)?;
    let mut scope = TrackingScope {
        tracker,
        closed: false,
    };
    let result = f(tracked).await;
    let stopped = scope.close();
    match (result, stopped) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(stop)) => Err(stop),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(stop)) => {
            tracing::debug!(error = %stop, "Failed to stop tracking after error");
            Err(e)
        }
    }
}

/// Metadata sink for backup progress.
pub trait BackupObserver: Send + Sync {
    fn on_tags_found(&self, _repository: &str, _tags: &[String]) {}
    fn on_artifact_pulled(&self, _tag: &str, _referrers: usize) {}
    fn on_tar_exporting(&self, _path: &Path) {}
    fn on_tar_exported(&self, _path: &Path, _size: u64) {}
    fn on_backup_completed(&self, _count: usize, _output: &Path) {}
}

/// Tracker that records nothing.
#[derive(Default)]
pub struct SilentStatus {
    state: TrackingState,
}

impl SilentStatus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatusTracker for SilentStatus {
    fn observer(&self) -> Arc<dyn CopyObserver> {
        Arc::new(NoopObserver)
    }

    fn state(&self) -> &TrackingState {
        &self.state
    }
}

impl BackupObserver for SilentStatus {}

/// Human-readable progress lines.
struct TextPrinter {
    out: Mutex<Box<dyn Write + Send>>,
}

impl TextPrinter {
    fn print(&self, status: &str, desc: &Descriptor) {
        let name = desc
            .annotation(ANNOTATION_TITLE)
            .unwrap_or(desc.media_type.as_str());
        let mut out = self.out.lock();
        let _ = writeln!(out, "{:<8}{} {}", status, desc.short_digest(), name);
    }
}

impl CopyObserver for TextPrinter {
    fn pre_copy(&self, desc: &Descriptor) {
        self.print("Copying", desc);
    }

    fn post_copy(&self, desc: &Descriptor) {
        self.print("Copied", desc);
    }

    fn on_skipped(&self, desc: &Descriptor) {
        self.print("Exists", desc);
    }

    fn on_mounted(&self, desc: &Descriptor, _source_repository: &str) {
        self.print("Mounted", desc);
    }

    fn on_tagged(&self, _desc: &Descriptor, tag: &str) {
        let mut out = self.out.lock();
        let _ = writeln!(out, "{:<8}{}", "Tagged", tag);
    }
}

/// Tracker printing one line per node and tag.
pub struct TextStatus {
    printer: Arc<TextPrinter>,
    state: TrackingState,
}

impl TextStatus {
    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self {
            printer: Arc::new(TextPrinter {
                out: Mutex::new(Box::new(out)),
            }),
            state: TrackingState::default(),
        }
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl StatusTracker for TextStatus {
    fn observer(&self) -> Arc<dyn CopyObserver> {
        self.printer.clone()
    }

    fn state(&self) -> &TrackingState {
        &self.state
    }
}

/// Forwards node events to an [`EventEmitter`].
struct EventForwarder {
    emitter: EventEmitter,
}

impl CopyObserver for EventForwarder {
    fn pre_copy(&self, desc: &Descriptor) {
        self.emitter.emit(RelayEvent::node(events::COPY_STARTED, desc));
    }

    fn post_copy(&self, desc: &Descriptor) {
        self.emitter.emit(RelayEvent::node(events::COPY_COMPLETED, desc));
    }

    fn on_skipped(&self, desc: &Descriptor) {
        self.emitter.emit(RelayEvent::node(events::COPY_SKIPPED, desc));
    }

    fn on_mounted(&self, desc: &Descriptor, source_repository: &str) {
        self.emitter
            .emit(RelayEvent::node(events::COPY_MOUNTED, desc).detail(source_repository));
    }

    fn on_tagged(&self, desc: &Descriptor, tag: &str) {
        self.emitter
            .emit(RelayEvent::node(events::TAG_APPLIED, desc).detail(tag));
    }
}

/// Tracker publishing [`RelayEvent`]s.
pub struct EventStatus {
    forwarder: Arc<EventForwarder>,
    state: TrackingState,
}

impl EventStatus {
    pub fn new(emitter: EventEmitter) -> Self {
        Self {
            forwarder: Arc::new(EventForwarder { emitter }),
            state: TrackingState::default(),
        }
    }

    fn emit(&self, event: RelayEvent) {
        self.forwarder.emitter.emit(event);
    }
}

impl StatusTracker for EventStatus {
    fn observer(&self) -> Arc<dyn CopyObserver> {
        self.forwarder.clone()
    }

    fn state(&self) -> &TrackingState {
        &self.state
    }
}

impl BackupObserver for EventStatus {
    fn on_tags_found(&self, repository: &str, tags: &[String]) {
        self.emit(RelayEvent::with_detail(
            events::BACKUP_TAGS_FOUND,
            format!("{}: {}", repository, tags.join(", ")),
        ));
    }

    fn on_artifact_pulled(&self, tag: &str, referrers: usize) {
        self.emit(RelayEvent::with_detail(
            events::BACKUP_ARTIFACT,
            format!("{} ({} referrers)", tag, referrers),
        ));
    }

    fn on_tar_exporting(&self, path: &Path) {
        self.emit(RelayEvent::with_detail(
            events::BACKUP_EXPORTING,
            path.display().to_string(),
        ));
    }

    fn on_tar_exported(&self, path: &Path, size: u64) {
        self.emit(RelayEvent::with_detail(
            events::BACKUP_EXPORTED,
            format!("{} ({} bytes)", path.display(), size),
        ));
    }

    fn on_backup_completed(&self, count: usize, output: &Path) {
        self.emit(RelayEvent::with_detail(
            events::BACKUP_COMPLETED,
            format!("{} artifact(s) to {}", count, output.display()),
        ));
    }
}
