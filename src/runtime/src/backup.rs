//! Backup orchestration: tagged artifacts of one repository into an OCI
//! layout directory or a tar archive of one.
//!
//! Tags are copied one after another into a staging layout, each inside its
//! own tracking scope. Archive output is staged in a temporary directory and
//! published with an atomic rename, so the output path never holds a partial
//! archive.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tempfile::{NamedTempFile, TempDir, TempPath};

use a3s_relay_core::error::{RelayError, Result};
use a3s_relay_core::DEFAULT_CONCURRENCY;

use crate::archive;
use crate::closure::count_referrers;
use crate::copy::recursive_copy;
use crate::graph::{self, CopyGraphOptions, CopyObserver};
use crate::oci::{is_valid_tag, ArtifactReference};
use crate::status::{with_tracking, BackupObserver, StatusTracker};
use crate::store::{ContentStore, OciLayout};

/// Shape of the backup output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// OCI layout directory
    Directory,
    /// Uncompressed tar of an OCI layout directory
    Archive,
}

impl OutputFormat {
    /// A path ending in `.tar` selects an archive; anything else is a
    /// directory.
    pub fn from_path(path: &Path) -> Self {
        if path.to_string_lossy().ends_with(".tar") {
            Self::Archive
        } else {
            Self::Directory
        }
    }
}

/// Split `registry/repo[:t1[,t2...]]` into the repository and its tags.
///
/// Digest references are rejected. Whitespace around tags is trimmed and
/// empty entries are skipped; every remaining tag must match the tag
/// grammar.
pub fn parse_artifacts_to_backup(input: &str) -> Result<(String, Vec<String>)> {
    let input = input.trim();
    if input.is_empty() {
        return Err(RelayError::InvalidInput(
            "an artifact reference is required".to_string(),
        ));
    }
    if input.contains('@') {
        return Err(RelayError::DigestNotSupported(input.to_string()));
    }

    let last_slash = input.rfind('/');
    let (repository, tag_list) = match input.rfind(':') {
        Some(colon) if last_slash.map_or(true, |slash| colon > slash) => {
            (&input[..colon], Some(&input[colon + 1..]))
        }
        _ => (input, None),
    };
    ArtifactReference::parse(repository)?;

    let mut tags = Vec::new();
    for tag in tag_list.into_iter().flat_map(|list| list.split(',')) {
        let tag = tag.trim();
        if tag.is_empty() {
            continue;
        }
        if !is_valid_tag(tag) {
            return Err(RelayError::InvalidTag {
                tag: tag.to_string(),
                reference: input.to_string(),
            });
        }
        tags.push(tag.to_string());
    }
    Ok((repository.to_string(), tags))
}

/// Options for [`run_backup`].
#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// Output directory, or `.tar` file
    pub output: PathBuf,
    /// Include the referrer closure of every tag
    pub include_referrers: bool,
    pub concurrency: usize,
}

impl BackupOptions {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            output: output.into(),
            include_referrers: false,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

/// One backed-up tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedArtifact {
    pub tag: String,
    pub digest: String,
    /// Referrers of the tagged root found at the destination
    pub referrers: usize,
}

/// Outcome of a backup.
#[derive(Debug, Clone)]
pub struct BackupSummary {
    /// Backed-up tags in processing order
    pub tags: Vec<TaggedArtifact>,
    pub output: PathBuf,
    /// Size of the output directory or archive in bytes
    pub size: u64,
}

/// The explicit tags, or every tag in the source when none were given.
pub async fn find_tags_to_backup(
    src: &dyn ContentStore,
    repository: &str,
    tags: Vec<String>,
) -> Result<Vec<String>> {
    if !tags.is_empty() {
        return Ok(tags);
    }
    let found = src
        .tags()
        .await
        .map_err(|e| e.context(format!("failed to list tags of {}", repository)))?;
    if found.is_empty() {
        return Err(RelayError::NoTags {
            repository: repository.to_string(),
        });
    }
    Ok(found)
}

/// Prefix of the staging directory created next to an archive output.
const STAGING_PREFIX: &str = ".a3s-relay-backup-";

/// Parent directory of `output`, created if missing.
fn output_parent(output: &Path) -> Result<&Path> {
    let parent = output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| {
        RelayError::Archive(format!(
            "Failed to create output directory {}: {}",
            parent.display(),
            e
        ))
    })?;
    Ok(parent)
}

/// Where the layout is assembled before it becomes the output.
enum Staging {
    /// The output directory itself
    Output(PathBuf),
    /// Hidden directory next to the archive, removed when dropped
    Temporary(TempDir),
}

impl Staging {
    fn new(output: &Path, format: OutputFormat) -> Result<Self> {
        match format {
            OutputFormat::Directory => Ok(Self::Output(output.to_path_buf())),
            OutputFormat::Archive => {
                let dir = tempfile::Builder::new()
                    .prefix(STAGING_PREFIX)
                    .tempdir_in(output_parent(output)?)?;
                Ok(Self::Temporary(dir))
            }
        }
    }

    fn path(&self) -> &Path {
        match self {
            Self::Output(path) => path,
            Self::Temporary(dir) => dir.path(),
        }
    }
}

/// Back up `tags` of `repository` from `src` (all tags when empty).
pub async fn run_backup(
    src: &dyn ContentStore,
    repository: &str,
    tags: Vec<String>,
    tracker: &dyn StatusTracker,
    observer: &dyn BackupObserver,
    options: &BackupOptions,
) -> Result<BackupSummary> {
    let tags = find_tags_to_backup(src, repository, tags).await?;
    observer.on_tags_found(repository, &tags);
    tracing::info!(
        repository,
        tags = tags.len(),
        output = %options.output.display(),
        "Starting backup"
    );

    let format = OutputFormat::from_path(&options.output);
    let staging = Staging::new(&options.output, format)?;
    let layout = Arc::new(OciLayout::open(staging.path())?);
    let dst: Arc<dyn ContentStore> = layout.clone();

    let mut artifacts = Vec::with_capacity(tags.len());
    for tag in &tags {
        let observer_for_tag = tracker.observer();
        let artifact = with_tracking(tracker, dst.clone(), |tracked| {
            backup_tag(src, tracked, tag, observer_for_tag, options)
        })
        .await
        .map_err(|e| e.context(format!("failed to copy ref {}", tag)))?;
        tracing::debug!(tag = %tag, digest = %artifact.digest, "Backed up tag");
        observer.on_artifact_pulled(tag, artifact.referrers);
        artifacts.push(artifact);
    }

    if let Err(e) = layout.cleanup().await {
        tracing::debug!(error = %e, "Failed to remove ingest directory");
    }

    let size = match format {
        OutputFormat::Directory => archive::dir_size(&options.output),
        OutputFormat::Archive => {
            observer.on_tar_exporting(&options.output);
            let size = export_archive(staging.path(), &options.output).await?;
            observer.on_tar_exported(&options.output, size);
            size
        }
    };
    observer.on_backup_completed(artifacts.len(), &options.output);
    tracing::info!(
        artifacts = artifacts.len(),
        size,
        output = %options.output.display(),
        "Backup completed"
    );
    Ok(BackupSummary {
        tags: artifacts,
        output: options.output.clone(),
        size,
    })
}

async fn backup_tag(
    src: &dyn ContentStore,
    dst: Arc<dyn ContentStore>,
    tag: &str,
    observer: Arc<dyn CopyObserver>,
    options: &BackupOptions,
) -> Result<TaggedArtifact> {
    let graph_options = CopyGraphOptions {
        concurrency: options.concurrency,
        mount_from: None,
        observer,
    };

    if !options.include_referrers {
        let root = graph::copy(src, tag, dst.as_ref(), tag, &graph_options, None).await?;
        return Ok(TaggedArtifact {
            tag: tag.to_string(),
            digest: root.digest,
            referrers: 0,
        });
    }

    let copied = recursive_copy(src, tag, dst.as_ref(), tag, &graph_options, None).await?;
    let referrers = count_referrers(copied.finder.as_ref(), dst.as_ref(), &copied.root)
        .await
        .map_err(|e| e.context(format!("failed to get referrers of {}", copied.root.digest)))?;
    Ok(TaggedArtifact {
        tag: tag.to_string(),
        digest: copied.root.digest,
        referrers,
    })
}

/// Archive file being written next to the final output.
///
/// Dropping it before [`ArchiveExport::publish`] deletes the file and makes
/// the writer fail on its next write, so a cancelled backup leaves nothing
/// behind even while the blocking tar task is still running.
struct ArchiveExport {
    path: Option<TempPath>,
    cancelled: Arc<AtomicBool>,
}

impl ArchiveExport {
    fn create(output: &Path) -> Result<(Self, CancellableWriter<File>)> {
        let (file, path) = NamedTempFile::new_in(output_parent(output)?)?.into_parts();
        let cancelled = Arc::new(AtomicBool::new(false));
        let writer = CancellableWriter {
            inner: file,
            cancelled: cancelled.clone(),
        };
        Ok((
            Self {
                path: Some(path),
                cancelled,
            },
            writer,
        ))
    }

    /// Atomically move the finished archive to `output`.
    fn publish(&mut self, output: &Path) -> Result<()> {
        let path = self
            .path
            .take()
            .ok_or_else(|| RelayError::Archive("archive already published".to_string()))?;
        path.persist(output).map_err(|e| {
            RelayError::Archive(format!(
                "Failed to move archive to {}: {}",
                output.display(),
                e.error
            ))
        })
    }
}

impl Drop for ArchiveExport {
    fn drop(&mut self) {
        if self.path.is_some() {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }
}

/// Writer that fails once its export has been abandoned.
struct CancellableWriter<W> {
    inner: W,
    cancelled: Arc<AtomicBool>,
}

impl<W: Write> Write for CancellableWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "archive export cancelled",
            ));
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Tar `dir` into a temporary file next to `output`, then rename it into
/// place. Returns the archive size.
async fn export_archive(dir: &Path, output: &Path) -> Result<u64> {
    let (mut export, writer) = ArchiveExport::create(output)?;
    let dir = dir.to_path_buf();
    let file = tokio::task::spawn_blocking(move || -> Result<File> {
        let writer = archive::tar_directory(&dir, writer)?;
        writer.inner.sync_all()?;
        Ok(writer.inner)
    })
    .await
    .map_err(|e| RelayError::Other(format!("Archive task failed: {}", e)))??;

    let size = file.metadata()?.len();
    drop(file);
    export.publish(output)?;
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use a3s_relay_core::descriptor::{
        Descriptor, ImageManifest, MEDIA_TYPE_EMPTY_JSON, MEDIA_TYPE_OCI_MANIFEST,
    };

    #[test]
    fn test_output_format() {
        assert_eq!(
            OutputFormat::from_path(Path::new("backup.tar")),
            OutputFormat::Archive
        );
        assert_eq!(
            OutputFormat::from_path(Path::new("out/dir")),
            OutputFormat::Directory
        );
        assert_eq!(
            OutputFormat::from_path(Path::new("backup.tar.gz")),
            OutputFormat::Directory
        );
        assert_eq!(OutputFormat::from_path(Path::new(".tar")), OutputFormat::Archive);
        assert_eq!(
            OutputFormat::from_path(Path::new("out/.tar")),
            OutputFormat::Archive
        );
    }

    #[test]
    fn test_parse_repository_only() {
        let (repo, tags) = parse_artifacts_to_backup("localhost:5000/hello").unwrap();
        assert_eq!(repo, "localhost:5000/hello");
        assert!(tags.is_empty());
    }

    #[test]
    fn test_parse_tag_list() {
        let (repo, tags) =
            parse_artifacts_to_backup("localhost:5000/org/hello: v1 ,v2,,v1").unwrap();
        assert_eq!(repo, "localhost:5000/org/hello");
        assert_eq!(tags, vec!["v1", "v2", "v1"]);
    }

    #[test]
    fn test_parse_rejects_digest() {
        let err = parse_artifacts_to_backup(
            "localhost:5000/hello@sha256:abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890",
        )
        .unwrap_err();
        assert!(matches!(err, RelayError::DigestNotSupported(_)));
    }

    #[test]
    fn test_parse_rejects_bad_tag() {
        let err = parse_artifacts_to_backup("localhost:5000/hello:v1,.bad").unwrap_err();
        match err {
            RelayError::InvalidTag { tag, .. } => assert_eq!(tag, ".bad"),
            other => panic!("unexpected error: {other}"),
        }
        let long = format!("localhost:5000/hello:{}", "a".repeat(129));
        assert!(parse_artifacts_to_backup(&long).is_err());
    }

    #[test]
    fn test_parse_rejects_bad_repository() {
        assert!(parse_artifacts_to_backup("hello:v1").is_err());
        assert!(parse_artifacts_to_backup("localhost:5000/Hello").is_err());
        assert!(parse_artifacts_to_backup("  ").is_err());
    }

    #[tokio::test]
    async fn test_find_tags_prefers_explicit() {
        let store = MemoryStore::new();
        let tags = find_tags_to_backup(&store, "localhost:5000/hello", vec!["v1".to_string()])
            .await
            .unwrap();
        assert_eq!(tags, vec!["v1"]);
    }

    #[tokio::test]
    async fn test_find_tags_discovers() {
        let store = MemoryStore::new();
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_OCI_MANIFEST.to_string()),
            artifact_type: None,
            config: Descriptor::from_content(MEDIA_TYPE_EMPTY_JSON, b"{}"),
            layers: Vec::new(),
            subject: None,
            annotations: None,
        };
        let content = serde_json::to_vec(&manifest).unwrap();
        let desc = Descriptor::from_content(MEDIA_TYPE_OCI_MANIFEST, &content);
        store.push(&desc, content).await.unwrap();
        store.tag(&desc, "b").await.unwrap();
        store.tag(&desc, "a").await.unwrap();

        let tags = find_tags_to_backup(&store, "localhost:5000/hello", Vec::new())
            .await
            .unwrap();
        assert_eq!(tags, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_find_tags_none() {
        let store = MemoryStore::new();
        let err = find_tags_to_backup(&store, "localhost:5000/hello", Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NoTags { .. }));
        assert!(err.recommendation().unwrap().contains("repo tags"));
    }

    #[tokio::test]
    async fn test_export_archive_replaces_output() {
        let dir = TempDir::new().unwrap();
        let staged = dir.path().join("staged");
        std::fs::create_dir_all(staged.join("blobs")).unwrap();
        std::fs::write(staged.join("index.json"), b"{}").unwrap();
        let output = dir.path().join("nested").join("out.tar");

        let size = export_archive(&staged, &output).await.unwrap();
        assert_eq!(size, std::fs::metadata(&output).unwrap().len());

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .flatten()
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_dropped_export_removes_partial_archive() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("out.tar");
        let (export, mut writer) = ArchiveExport::create(&output).unwrap();
        writer.write_all(b"partial").unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        drop(export);

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(writer.write_all(b"more").is_err());
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn test_failed_archive_backup_removes_staging() {
        let src = MemoryStore::new();
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("backup.tar");
        let tracker = crate::status::SilentStatus::new();

        let err = run_backup(
            &src,
            "localhost:5000/hello",
            vec!["missing".to_string()],
            &tracker,
            &tracker,
            &BackupOptions::new(&output),
        )
        .await
        .unwrap_err();

        assert!(err.unwrap_copy().is_not_found());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
