//! Remote registry repository as a content store.
//!
//! Uses the `oci-distribution` crate to talk to a repository on an OCI
//! distribution registry. Referrers come from the registry's referrers API
//! when it has one and from the tag schema index otherwise (see
//! [`super::referrers`]).

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::errors::OciDistributionError;
use oci_distribution::manifest::OciDescriptor;
use oci_distribution::{Client, Reference, RegistryOperation};
use serde::Deserialize;
use tokio::io::AsyncWrite;
use tokio::sync::OnceCell;

use a3s_relay_core::descriptor::{self, Descriptor, ImageIndex};
use a3s_relay_core::error::{RelayError, Result};

use super::credentials::RegistryAuth;
use super::reference::ArtifactReference;
use super::referrers::{self, ReferrerLocks, ReferrersApi, ReferrersBackend};
use crate::store::{self, filter_artifact_type, ContentStore, HostIdentity, StoreKind};

/// Page size requested when listing tags.
const TAG_PAGE_SIZE: usize = 100;

/// Upper bound on the buffer reserved up front for a blob download. The
/// descriptor size is untrusted until the content is verified.
const MAX_BLOB_PREALLOC: u64 = 4 * 1024 * 1024;

/// Transport options for a registry.
#[derive(Debug, Clone, Default)]
pub struct RegistryOptions {
    /// Talk plain HTTP instead of HTTPS
    pub plain_http: bool,
    /// Skip TLS certificate verification
    pub insecure: bool,
}

/// A repository on a remote registry.
pub struct RemoteRepository {
    client: Client,
    auth: RegistryAuth,
    registry: String,
    repository: String,
    pull_token: OnceCell<()>,
    push_token: OnceCell<()>,
    referrers_api: ReferrersApi,
    referrer_locks: ReferrerLocks,
}

impl RemoteRepository {
    pub fn new(
        reference: &ArtifactReference,
        auth: RegistryAuth,
        options: &RegistryOptions,
    ) -> Result<Self> {
        let scheme = if options.plain_http { "http" } else { "https" };
        let oci_reference = Reference::with_tag(
            reference.registry.clone(),
            reference.repository.clone(),
            "latest".to_string(),
        );
        let referrers_api = ReferrersApi::new(
            format!("{}://{}", scheme, oci_reference.resolve_registry()),
            reference.registry.clone(),
            oci_reference.repository().to_string(),
            auth.clone(),
            options.insecure,
        )?;

        let config = ClientConfig {
            protocol: if options.plain_http {
                ClientProtocol::Http
            } else {
                ClientProtocol::Https
            },
            accept_invalid_certificates: options.insecure,
            ..Default::default()
        };

        Ok(Self {
            client: Client::new(config),
            auth,
            registry: reference.registry.clone(),
            repository: reference.repository.clone(),
            pull_token: OnceCell::new(),
            push_token: OnceCell::new(),
            referrers_api,
            referrer_locks: ReferrerLocks::default(),
        })
    }

    /// `registry/repository`.
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    fn oci_reference(&self, reference: &str) -> Reference {
        if store::is_digest_reference(reference) {
            Reference::with_digest(
                self.registry.clone(),
                self.repository.clone(),
                reference.to_string(),
            )
        } else {
            Reference::with_tag(
                self.registry.clone(),
                self.repository.clone(),
                reference.to_string(),
            )
        }
    }

    /// Fetch a token for the operation once per repository handle.
    async fn authenticate(&self, operation: RegistryOperation) -> Result<()> {
        let cell = match operation {
            RegistryOperation::Push => &self.push_token,
            RegistryOperation::Pull => &self.pull_token,
        };
        let reference = self.oci_reference("latest");
        cell.get_or_try_init(|| async move {
            self.client
                .auth(&reference, &self.auth.to_oci_auth(), operation)
                .await
                .map(|_| ())
                .map_err(|e| self.registry_error("authenticate", e))
        })
        .await?;
        Ok(())
    }

    fn registry_error(&self, action: &str, err: OciDistributionError) -> RelayError {
        RelayError::Registry {
            registry: self.registry.clone(),
            message: format!("Failed to {} in {}: {}", action, self.repository, err),
        }
    }

    fn classify(&self, action: &str, reference: &str, err: OciDistributionError) -> RelayError {
        if is_not_found(&err) {
            let separator = if store::is_digest_reference(reference) { '@' } else { ':' };
            RelayError::NotFound {
                reference: format!(
                    "{}/{}{}{}",
                    self.registry, self.repository, separator, reference
                ),
            }
        } else {
            self.registry_error(action, err)
        }
    }

    async fn pull_manifest(&self, reference: &str, accepted: &[&str]) -> Result<(Vec<u8>, String)> {
        let (content, digest) = self
            .client
            .pull_manifest_raw(&self.oci_reference(reference), &self.auth.to_oci_auth(), accepted)
            .await
            .map_err(|e| self.classify("pull manifest", reference, e))?;
        Ok((content.to_vec(), digest))
    }

    async fn push_manifest(&self, reference: &str, media_type: &str, content: Vec<u8>) -> Result<()> {
        let content_type = media_type.parse().map_err(|_| {
            RelayError::InvalidInput(format!("invalid media type {:?}", media_type))
        })?;
        self.client
            .push_manifest_raw(&self.oci_reference(reference), content, content_type)
            .await
            .map_err(|e| self.registry_error("push manifest", e))?;
        Ok(())
    }

    /// Record `referrer` for `subject` unless the registry indexes it itself.
    async fn add_referrer(&self, subject: &Descriptor, referrer: Descriptor) -> Result<()> {
        if referrers::add_referrer(self, &self.referrer_locks, subject, referrer).await? {
            tracing::debug!(
                subject = %subject.digest,
                tag = %referrers::referrers_tag(&subject.digest),
                "Updated referrers index"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl ReferrersBackend for RemoteRepository {
    async fn query_api(&self, subject: &Descriptor) -> Result<Option<ImageIndex>> {
        self.referrers_api.fetch(&subject.digest).await
    }

    async fn load_index(&self, tag: &str) -> Result<Option<ImageIndex>> {
        match self.pull_manifest(tag, &[descriptor::MEDIA_TYPE_OCI_INDEX]).await {
            Ok((content, _)) => Ok(Some(serde_json::from_slice(&content)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn save_index(&self, tag: &str, index: &ImageIndex) -> Result<()> {
        let content = serde_json::to_vec(index)?;
        self.push_manifest(tag, descriptor::MEDIA_TYPE_OCI_INDEX, content)
            .await
    }
}

#[async_trait]
impl ContentStore for RemoteRepository {
    fn kind(&self) -> StoreKind {
        StoreKind::Registry
    }

    fn host_identity(&self) -> Option<HostIdentity> {
        Some(HostIdentity {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
        })
    }

    async fn resolve(&self, reference: &str) -> Result<Descriptor> {
        let (content, digest) = self
            .pull_manifest(reference, descriptor::MANIFEST_MEDIA_TYPES)
            .await?;
        let digest = if store::is_digest_reference(reference) {
            reference.to_string()
        } else if digest.is_empty() {
            descriptor::sha256_digest(&content)
        } else {
            digest
        };
        let desc = Descriptor::new(sniff_media_type(&content), digest, content.len() as u64);
        store::verify_content(&desc, &content)?;
        tracing::debug!(reference, digest = %desc.digest, "Resolved reference");
        Ok(desc)
    }

    async fn fetch(&self, desc: &Descriptor) -> Result<Vec<u8>> {
        let content = if desc.is_manifest() {
            self.pull_manifest(&desc.digest, &[desc.media_type.as_str()])
                .await?
                .0
        } else {
            self.authenticate(RegistryOperation::Pull).await?;
            let mut content = Vec::with_capacity(blob_capacity(desc.size));
            self.client
                .pull_blob(
                    &self.oci_reference(&desc.digest),
                    &oci_descriptor(desc),
                    &mut content,
                )
                .await
                .map_err(|e| self.classify("pull blob", &desc.digest, e))?;
            content
        };
        store::verify_content(desc, &content)?;
        Ok(content)
    }

    async fn exists(&self, desc: &Descriptor) -> Result<bool> {
        if desc.is_manifest() {
            return match self
                .client
                .fetch_manifest_digest(
                    &self.oci_reference(&desc.digest),
                    &self.auth.to_oci_auth(),
                )
                .await
            {
                Ok(_) => Ok(true),
                Err(e) if is_not_found(&e) => Ok(false),
                Err(e) => Err(self.registry_error("check manifest", e)),
            };
        }

        // Start a download and stop at the first byte.
        self.authenticate(RegistryOperation::Pull).await?;
        let mut writer = FirstByteWriter::default();
        let result = self
            .client
            .pull_blob(
                &self.oci_reference(&desc.digest),
                &oci_descriptor(desc),
                &mut writer,
            )
            .await;
        match result {
            Ok(()) => Ok(true),
            Err(_) if writer.received => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(self.registry_error("check blob", e)),
        }
    }

    async fn push(&self, desc: &Descriptor, content: Vec<u8>) -> Result<()> {
        store::verify_content(desc, &content)?;
        self.authenticate(RegistryOperation::Push).await?;

        if !desc.is_manifest() {
            self.client
                .push_blob(&self.oci_reference(&desc.digest), &content, &desc.digest)
                .await
                .map_err(|e| self.registry_error("push blob", e))?;
            return Ok(());
        }

        let subject = descriptor::subject_of(desc, &content)?;
        let referrer = match subject {
            Some(_) => Some(descriptor::referrer_descriptor(desc, &content)?),
            None => None,
        };
        self.push_manifest(&desc.digest, &desc.media_type, content)
            .await?;
        if let (Some(subject), Some(referrer)) = (subject, referrer) {
            self.add_referrer(&subject, referrer).await?;
        }
        Ok(())
    }

    async fn tag(&self, desc: &Descriptor, reference: &str) -> Result<()> {
        if reference == desc.digest {
            return Ok(());
        }
        let content = self.fetch(desc).await?;
        self.authenticate(RegistryOperation::Push).await?;
        self.push_manifest(reference, &desc.media_type, content)
            .await?;
        tracing::debug!(digest = %desc.digest, tag = reference, "Tagged manifest");
        Ok(())
    }

    async fn tags(&self) -> Result<Vec<String>> {
        let reference = self.oci_reference("latest");
        let auth = self.auth.to_oci_auth();
        collect_tag_pages(TAG_PAGE_SIZE, |last| {
            let (reference, auth) = (&reference, &auth);
            async move {
                self.client
                    .list_tags(reference, auth, Some(TAG_PAGE_SIZE), last.as_deref())
                    .await
                    .map(|page| page.tags)
                    .map_err(|e| self.registry_error("list tags", e))
            }
        })
        .await
    }

    async fn referrers(
        &self,
        desc: &Descriptor,
        artifact_type: Option<&str>,
    ) -> Result<Vec<Descriptor>> {
        let found = referrers::list_referrers(self, desc).await?;
        Ok(filter_artifact_type(found, artifact_type))
    }

    async fn mount(&self, desc: &Descriptor, source_repository: &str) -> Result<()> {
        self.authenticate(RegistryOperation::Push).await?;
        let source = Reference::with_digest(
            self.registry.clone(),
            source_repository.to_string(),
            desc.digest.clone(),
        );
        self.client
            .mount_blob(&self.oci_reference(&desc.digest), &source, &desc.digest)
            .await
            .map_err(|e| self.registry_error("mount blob", e))?;
        Ok(())
    }
}

/// Fetch tag pages until a short or repeated page.
///
/// `fetch_page` receives the last tag seen so far and returns the page that
/// follows it.
async fn collect_tag_pages<F, Fut>(page_size: usize, mut fetch_page: F) -> Result<Vec<String>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Vec<String>>>,
{
    let mut tags: Vec<String> = Vec::new();
    let mut last: Option<String> = None;
    loop {
        let page = fetch_page(last.clone()).await?;
        let next = page.last().cloned();
        // A registry that ignores `last` serves the same page again.
        if next.is_none() || (last.is_some() && next == last) {
            break;
        }
        let count = page.len();
        tags.extend(page);
        if count < page_size {
            break;
        }
        last = next;
    }
    Ok(tags)
}

/// Initial buffer size for a blob claiming `size` bytes.
fn blob_capacity(size: u64) -> usize {
    usize::try_from(size.min(MAX_BLOB_PREALLOC)).unwrap_or(0)
}

fn oci_descriptor(desc: &Descriptor) -> OciDescriptor {
    OciDescriptor {
        media_type: desc.media_type.clone(),
        digest: desc.digest.clone(),
        size: desc.size as i64,
        ..Default::default()
    }
}

fn is_not_found(err: &OciDistributionError) -> bool {
    if matches!(err, OciDistributionError::ImageManifestNotFoundError(_)) {
        return true;
    }
    let message = err.to_string().to_lowercase();
    ["404", "not found", "manifest_unknown", "blob_unknown", "name_unknown"]
        .iter()
        .any(|needle| message.contains(needle))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaTypeFields {
    media_type: Option<String>,
    manifests: Option<serde_json::Value>,
}

/// Media type of a manifest, read from its `mediaType` field or inferred
/// from its shape when the field is absent.
fn sniff_media_type(content: &[u8]) -> String {
    match serde_json::from_slice::<MediaTypeFields>(content) {
        Ok(MediaTypeFields {
            media_type: Some(media_type),
            ..
        }) => media_type,
        Ok(MediaTypeFields {
            manifests: Some(_), ..
        }) => descriptor::MEDIA_TYPE_OCI_INDEX.to_string(),
        _ => descriptor::MEDIA_TYPE_OCI_MANIFEST.to_string(),
    }
}

/// Writer that records whether any byte arrived, then aborts the transfer.
#[derive(Default)]
struct FirstByteWriter {
    received: bool,
}

impl AsyncWrite for FirstByteWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        self.received = true;
        Poll::Ready(Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            "existence check complete",
        )))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
