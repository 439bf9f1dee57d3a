//! Content descriptors and the manifest documents that link them.
//!
//! A [`Descriptor`] identifies one node of a content-addressable graph by
//! media type, digest and size. Manifests and indices are the only nodes
//! with outgoing edges; everything else is a leaf blob.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::{RelayError, Result};

/// OCI image manifest media type.
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
/// OCI image index media type.
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
/// Docker image manifest (schema 2) media type.
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Docker manifest list media type.
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
/// OCI empty JSON descriptor media type (`{}`).
pub const MEDIA_TYPE_EMPTY_JSON: &str = "application/vnd.oci.empty.v1+json";

/// Annotation carrying the tag of a manifest inside an OCI layout `index.json`.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";
/// Annotation carrying a human-readable name for a blob.
pub const ANNOTATION_TITLE: &str = "org.opencontainers.image.title";

/// Every manifest media type a registry may answer with.
pub const MANIFEST_MEDIA_TYPES: &[&str] = &[
    MEDIA_TYPE_OCI_MANIFEST,
    MEDIA_TYPE_OCI_INDEX,
    MEDIA_TYPE_DOCKER_MANIFEST,
    MEDIA_TYPE_DOCKER_MANIFEST_LIST,
];

/// Whether a media type names a multi-manifest index.
pub fn is_index(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_INDEX || media_type == MEDIA_TYPE_DOCKER_MANIFEST_LIST
}

/// Whether a media type names a manifest or an index (a node with edges).
pub fn is_manifest(media_type: &str) -> bool {
    MANIFEST_MEDIA_TYPES.contains(&media_type)
}

/// Compute the `sha256:` digest of some content.
pub fn sha256_digest(content: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(content)))
}

/// Check that a digest has the `algorithm:encoded` form with a known algorithm.
pub fn validate_digest(digest: &str) -> Result<()> {
    let (algorithm, encoded) = digest
        .split_once(':')
        .ok_or_else(|| RelayError::InvalidReference(format!("invalid digest {:?}", digest)))?;

    let expected_len = match algorithm {
        "sha256" => 64,
        "sha512" => 128,
        other => {
            return Err(RelayError::InvalidReference(format!(
                "unsupported digest algorithm {:?} in {:?}",
                other, digest
            )))
        }
    };

    let valid_hex = encoded
        .chars()
        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
    if encoded.len() != expected_len || !valid_hex {
        return Err(RelayError::InvalidReference(format!(
            "invalid digest {:?}",
            digest
        )));
    }
    Ok(())
}

/// Immutable identifier of a content-addressed node.
///
/// Equality and hashing only consider media type, digest and size;
/// annotations and other metadata are carried along but never compared.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    /// Create a descriptor without metadata.
    pub fn new(media_type: impl Into<String>, digest: impl Into<String>, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest: digest.into(),
            size,
            artifact_type: None,
            annotations: None,
            platform: None,
        }
    }

    /// Describe some content, computing its `sha256:` digest.
    pub fn from_content(media_type: impl Into<String>, content: &[u8]) -> Self {
        Self::new(media_type, sha256_digest(content), content.len() as u64)
    }

    pub fn is_index(&self) -> bool {
        is_index(&self.media_type)
    }

    pub fn is_manifest(&self) -> bool {
        is_manifest(&self.media_type)
    }

    /// Get an annotation value.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    /// Return a copy with one annotation set.
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// The tag recorded on this descriptor inside a layout index.
    pub fn ref_name(&self) -> Option<&str> {
        self.annotation(ANNOTATION_REF_NAME)
    }

    /// Identity-only copy, dropping annotations, artifact type and platform.
    pub fn plain(&self) -> Self {
        Self::new(self.media_type.clone(), self.digest.clone(), self.size)
    }

    /// Abbreviated digest for display (`sha256:` prefix stripped, 12 chars).
    pub fn short_digest(&self) -> &str {
        let encoded = self
            .digest
            .split_once(':')
            .map(|(_, e)| e)
            .unwrap_or(&self.digest);
        &encoded[..encoded.len().min(12)]
    }
}

impl PartialEq for Descriptor {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest && self.media_type == other.media_type && self.size == other.size
    }
}

impl Eq for Descriptor {}

impl Hash for Descriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.media_type.hash(state);
        self.digest.hash(state);
        self.size.hash(state);
    }
}

/// Target platform of a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    /// Whether `candidate` satisfies this platform request.
    ///
    /// The variant only has to match when the request names one.
    pub fn matches(&self, candidate: &Platform) -> bool {
        self.os == candidate.os
            && self.architecture == candidate.architecture
            && match &self.variant {
                Some(v) => candidate.variant.as_deref() == Some(v.as_str()),
                None => true,
            }
    }
}

impl FromStr for Platform {
    type Err = RelayError;

    /// Parse `os/arch[/variant]`, e.g. `linux/arm64` or `linux/arm/v7`.
    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        let invalid = || {
            RelayError::InvalidInput(format!(
                "invalid platform {:?}: expected os/arch[/variant]",
                s
            ))
        };
        if parts.iter().any(|p| p.is_empty()) {
            return Err(invalid());
        }
        match parts.as_slice() {
            [os, arch] => Ok(Self {
                os: os.to_string(),
                architecture: arch.to_string(),
                variant: None,
            }),
            [os, arch, variant] => Ok(Self {
                os: os.to_string(),
                architecture: arch.to_string(),
                variant: Some(variant.to_string()),
            }),
            _ => Err(invalid()),
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(ref variant) = self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

/// Image index (also the shape of an OCI layout `index.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl ImageIndex {
    /// An empty OCI index.
    pub fn new() -> Self {
        Self {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_OCI_INDEX.to_string()),
            artifact_type: None,
            manifests: Vec::new(),
            subject: None,
            annotations: None,
        }
    }

    /// First child manifest built for `platform`.
    pub fn select_platform(&self, platform: &Platform) -> Option<&Descriptor> {
        self.manifests.iter().find(|m| {
            m.platform
                .as_ref()
                .map_or(false, |candidate| platform.matches(candidate))
        })
    }
}

impl Default for ImageIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Image manifest (OCI or Docker schema 2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// Direct successors of a node: subject, config and layers of a manifest,
/// subject and children of an index. Blobs have none.
pub fn successors(desc: &Descriptor, content: &[u8]) -> Result<Vec<Descriptor>> {
    if desc.is_index() {
        let index: ImageIndex = serde_json::from_slice(content)?;
        let mut nodes = Vec::with_capacity(index.manifests.len() + 1);
        nodes.extend(index.subject);
        nodes.extend(index.manifests);
        Ok(nodes)
    } else if desc.is_manifest() {
        let manifest: ImageManifest = serde_json::from_slice(content)?;
        let mut nodes = Vec::with_capacity(manifest.layers.len() + 2);
        nodes.extend(manifest.subject);
        nodes.push(manifest.config);
        nodes.extend(manifest.layers);
        Ok(nodes)
    } else {
        Ok(Vec::new())
    }
}

/// Subject declared by a manifest or index, if any.
pub fn subject_of(desc: &Descriptor, content: &[u8]) -> Result<Option<Descriptor>> {
    if desc.is_index() {
        let index: ImageIndex = serde_json::from_slice(content)?;
        Ok(index.subject)
    } else if desc.is_manifest() {
        let manifest: ImageManifest = serde_json::from_slice(content)?;
        Ok(manifest.subject)
    } else {
        Ok(None)
    }
}

/// Descriptor of a referrer as listed in a referrers index: identity plus
/// the artifact type and annotations declared by its content.
pub fn referrer_descriptor(desc: &Descriptor, content: &[u8]) -> Result<Descriptor> {
    let mut referrer = desc.plain();
    if desc.is_index() {
        let index: ImageIndex = serde_json::from_slice(content)?;
        referrer.artifact_type = index.artifact_type;
        referrer.annotations = index.annotations;
    } else {
        let manifest: ImageManifest = serde_json::from_slice(content)?;
        referrer.artifact_type = manifest
            .artifact_type
            .or_else(|| Some(manifest.config.media_type));
        referrer.annotations = manifest.annotations;
    }
    Ok(referrer)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_DIGEST: &str =
        "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_sha256_digest() {
        assert_eq!(sha256_digest(b"hello"), HELLO_DIGEST);
    }

    #[test]
    fn test_from_content() {
        let desc = Descriptor::from_content("application/octet-stream", b"hello");
        assert_eq!(desc.digest, HELLO_DIGEST);
        assert_eq!(desc.size, 5);
    }

    #[test]
    fn test_equality_ignores_annotations() {
        let a = Descriptor::from_content(MEDIA_TYPE_OCI_MANIFEST, b"{}");
        let b = a.clone().with_annotation(ANNOTATION_REF_NAME, "v1");
        assert_eq!(a, b);

        let mut set = std::collections::HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_equality_checks_media_type_and_size() {
        let a = Descriptor::new(MEDIA_TYPE_OCI_MANIFEST, HELLO_DIGEST, 5);
        assert_ne!(a, Descriptor::new(MEDIA_TYPE_OCI_INDEX, HELLO_DIGEST, 5));
        assert_ne!(a, Descriptor::new(MEDIA_TYPE_OCI_MANIFEST, HELLO_DIGEST, 6));
    }

    #[test]
    fn test_index_detection() {
        assert!(is_index(MEDIA_TYPE_OCI_INDEX));
        assert!(is_index(MEDIA_TYPE_DOCKER_MANIFEST_LIST));
        assert!(!is_index(MEDIA_TYPE_OCI_MANIFEST));
        assert!(is_manifest(MEDIA_TYPE_DOCKER_MANIFEST));
        assert!(!is_manifest("application/vnd.oci.image.layer.v1.tar+gzip"));
    }

    #[test]
    fn test_validate_digest() {
        assert!(validate_digest(HELLO_DIGEST).is_ok());
        assert!(validate_digest("sha256:abc").is_err());
        assert!(validate_digest("md5:2cf24dba5fb0a30e26e83b2ac5b9e29e").is_err());
        assert!(validate_digest("nodigest").is_err());
        assert!(validate_digest(&HELLO_DIGEST.to_uppercase().replace("SHA256", "sha256")).is_err());
    }

    #[test]
    fn test_short_digest() {
        let desc = Descriptor::new(MEDIA_TYPE_OCI_MANIFEST, HELLO_DIGEST, 5);
        assert_eq!(desc.short_digest(), "2cf24dba5fb0");
    }

    #[test]
    fn test_platform_parse() {
        let p: Platform = "linux/arm/v7".parse().unwrap();
        assert_eq!(p.os, "linux");
        assert_eq!(p.architecture, "arm");
        assert_eq!(p.variant.as_deref(), Some("v7"));
        assert_eq!(p.to_string(), "linux/arm/v7");

        assert!("linux".parse::<Platform>().is_err());
        assert!("linux//v7".parse::<Platform>().is_err());
        assert!("a/b/c/d".parse::<Platform>().is_err());
    }

    #[test]
    fn test_platform_matches_variant_only_when_requested() {
        let request: Platform = "linux/arm".parse().unwrap();
        let candidate: Platform = "linux/arm/v7".parse().unwrap();
        assert!(request.matches(&candidate));
        assert!(!candidate.matches(&request));
    }

    #[test]
    fn test_successors_of_manifest() {
        let subject = Descriptor::new(MEDIA_TYPE_OCI_MANIFEST, HELLO_DIGEST, 5);
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_OCI_MANIFEST.to_string()),
            artifact_type: Some("application/vnd.example.sbom".to_string()),
            config: Descriptor::from_content(MEDIA_TYPE_EMPTY_JSON, b"{}"),
            layers: vec![Descriptor::from_content("text/plain", b"layer")],
            subject: Some(subject.clone()),
            annotations: None,
        };
        let content = serde_json::to_vec(&manifest).unwrap();
        let desc = Descriptor::from_content(MEDIA_TYPE_OCI_MANIFEST, &content);

        let nodes = successors(&desc, &content).unwrap();
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0], subject);
        assert_eq!(subject_of(&desc, &content).unwrap(), Some(subject));

        let referrer = referrer_descriptor(&desc, &content).unwrap();
        assert_eq!(referrer, desc);
        assert_eq!(
            referrer.artifact_type.as_deref(),
            Some("application/vnd.example.sbom")
        );
    }

    #[test]
    fn test_successors_of_index() {
        let mut index = ImageIndex::new();
        index.manifests.push(Descriptor::new(MEDIA_TYPE_OCI_MANIFEST, HELLO_DIGEST, 5));
        let content = serde_json::to_vec(&index).unwrap();
        let desc = Descriptor::from_content(MEDIA_TYPE_OCI_INDEX, &content);

        let nodes = successors(&desc, &content).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(subject_of(&desc, &content).unwrap(), None);
    }

    #[test]
    fn test_successors_of_blob() {
        let desc = Descriptor::from_content("text/plain", b"hello");
        assert!(successors(&desc, b"hello").unwrap().is_empty());
    }

    #[test]
    fn test_successors_malformed_manifest() {
        let desc = Descriptor::from_content(MEDIA_TYPE_OCI_INDEX, b"not json");
        assert!(matches!(
            successors(&desc, b"not json"),
            Err(RelayError::Serialization(_))
        ));
    }

    #[test]
    fn test_select_platform() {
        let mut index = ImageIndex::new();
        let mut amd = Descriptor::new(MEDIA_TYPE_OCI_MANIFEST, HELLO_DIGEST, 5);
        amd.platform = Some("linux/amd64".parse().unwrap());
        let mut arm = Descriptor::new(
            MEDIA_TYPE_OCI_MANIFEST,
            sha256_digest(b"arm"),
            3,
        );
        arm.platform = Some("linux/arm64".parse().unwrap());
        index.manifests = vec![amd, arm.clone()];

        let selected = index.select_platform(&"linux/arm64".parse().unwrap());
        assert_eq!(selected, Some(&arm));
        assert!(index
            .select_platform(&"windows/amd64".parse().unwrap())
            .is_none());
    }

    #[test]
    fn test_descriptor_json_shape() {
        let desc = Descriptor::new(MEDIA_TYPE_OCI_MANIFEST, HELLO_DIGEST, 5)
            .with_annotation(ANNOTATION_REF_NAME, "v1");
        let json = serde_json::to_value(&desc).unwrap();
        assert_eq!(json["mediaType"], MEDIA_TYPE_OCI_MANIFEST);
        assert_eq!(json["annotations"][ANNOTATION_REF_NAME], "v1");
        assert!(json.get("platform").is_none());
    }
}
