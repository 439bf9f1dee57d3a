//! Registry artifact reference parsing.
//!
//! Parses references like `localhost:5000/hello:v1` or
//! `ghcr.io/org/app@sha256:...` into structured components. The first path
//! component is always the registry host; no default registry or tag is
//! applied.

use a3s_relay_core::descriptor;
use a3s_relay_core::error::{RelayError, Result};

/// Maximum tag length allowed by the distribution grammar.
const MAX_TAG_LEN: usize = 128;

/// Parsed registry artifact reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactReference {
    /// Registry host, with optional port (e.g., "localhost:5000")
    pub registry: String,
    /// Repository path (e.g., "org/app")
    pub repository: String,
    /// Tag (e.g., "v1")
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:abc123...")
    pub digest: Option<String>,
}

impl ArtifactReference {
    /// Parse `registry/repository[:tag][@digest]`.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(RelayError::InvalidReference("empty reference".to_string()));
        }

        let (name_tag, digest) = match reference.split_once('@') {
            Some((name, digest)) => {
                descriptor::validate_digest(digest).map_err(|_| {
                    RelayError::InvalidReference(format!(
                        "invalid digest {:?} in reference {:?}",
                        digest, reference
                    ))
                })?;
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A colon after the last slash starts the tag; earlier colons belong to the host port.
        let last_slash = name_tag.rfind('/');
        let (name, tag) = match name_tag.rfind(':') {
            Some(colon) if last_slash.map_or(true, |slash| colon > slash) => {
                (&name_tag[..colon], Some(name_tag[colon + 1..].to_string()))
            }
            _ => (name_tag, None),
        };

        let (registry, repository) = name.split_once('/').ok_or_else(|| {
            RelayError::InvalidReference(format!(
                "{:?}: expected registry/repository",
                reference
            ))
        })?;
        if registry.is_empty() {
            return Err(RelayError::InvalidReference(format!(
                "{:?}: missing registry",
                reference
            )));
        }
        validate_repository(repository).map_err(|msg| {
            RelayError::InvalidReference(format!("{:?}: {}", reference, msg))
        })?;

        if let Some(ref tag) = tag {
            if !is_valid_tag(tag) {
                return Err(RelayError::InvalidTag {
                    tag: tag.clone(),
                    reference: reference.to_string(),
                });
            }
        }

        Ok(Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            tag,
            digest,
        })
    }

    /// The tag or digest this reference selects; the digest wins when both are present.
    pub fn reference(&self) -> Option<&str> {
        self.digest.as_deref().or(self.tag.as_deref())
    }

    /// `registry/repository` without tag or digest.
    pub fn repository_path(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Copy of this reference pointing at another tag or digest.
    pub fn with_reference(&self, reference: &str) -> Self {
        let mut copy = Self {
            tag: None,
            digest: None,
            ..self.clone()
        };
        if descriptor::validate_digest(reference).is_ok() {
            copy.digest = Some(reference.to_string());
        } else {
            copy.tag = Some(reference.to_string());
        }
        copy
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = self.repository_path();
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl std::fmt::Display for ArtifactReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

/// Whether a tag matches `^[\w][\w.-]{0,127}$`.
pub fn is_valid_tag(tag: &str) -> bool {
    let word = |c: char| c.is_ascii_alphanumeric() || c == '_';
    let mut chars = tag.chars();
    match chars.next() {
        Some(first) if word(first) => {}
        _ => return false,
    }
    tag.len() <= MAX_TAG_LEN && chars.all(|c| word(c) || c == '.' || c == '-')
}

/// Check a repository path: lowercase alphanumeric components joined by
/// `/`, each starting and ending with an alphanumeric, separated internally
/// by `.`, `_`, `__` or runs of `-`.
fn validate_repository(repository: &str) -> std::result::Result<(), String> {
    if repository.is_empty() {
        return Err("missing repository".to_string());
    }
    for component in repository.split('/') {
        let alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
        let valid_chars = component
            .chars()
            .all(|c| alnum(c) || matches!(c, '.' | '_' | '-'));
        let valid_edges = component.chars().next().map_or(false, alnum)
            && component.chars().last().map_or(false, alnum);
        let valid_separators = !component.contains("..")
            && !component.contains("___")
            && !component.contains("._")
            && !component.contains("_.")
            && !component.contains(".-")
            && !component.contains("-.")
            && !component.contains("_-")
            && !component.contains("-_");
        if !(valid_chars && valid_edges && valid_separators) {
            return Err(format!("invalid repository name {:?}", repository));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890";

    #[test]
    fn test_parse_with_tag() {
        let r = ArtifactReference::parse("localhost:5000/hello:v1").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "hello");
        assert_eq!(r.tag, Some("v1".to_string()));
        assert_eq!(r.digest, None);
        assert_eq!(r.reference(), Some("v1"));
    }

    #[test]
    fn test_parse_without_tag() {
        let r = ArtifactReference::parse("localhost:5000/hello").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "hello");
        assert_eq!(r.tag, None);
        assert_eq!(r.reference(), None);
    }

    #[test]
    fn test_parse_digest() {
        let r = ArtifactReference::parse(&format!("ghcr.io/org/app@{}", DIGEST)).unwrap();
        assert_eq!(r.repository, "org/app");
        assert_eq!(r.tag, None);
        assert_eq!(r.reference(), Some(DIGEST));
    }

    #[test]
    fn test_parse_tag_and_digest() {
        let r = ArtifactReference::parse(&format!("ghcr.io/org/app:v1@{}", DIGEST)).unwrap();
        assert_eq!(r.tag, Some("v1".to_string()));
        assert_eq!(r.reference(), Some(DIGEST));
        assert_eq!(r.full_reference(), format!("ghcr.io/org/app:v1@{}", DIGEST));
    }

    #[test]
    fn test_parse_deep_repository() {
        let r = ArtifactReference::parse("ghcr.io/org/sub/image:v1").unwrap();
        assert_eq!(r.repository, "org/sub/image");
        assert_eq!(r.repository_path(), "ghcr.io/org/sub/image");
    }

    #[test]
    fn test_parse_rejects_missing_repository() {
        assert!(ArtifactReference::parse("localhost:5000").is_err());
        assert!(ArtifactReference::parse("hello").is_err());
        assert!(ArtifactReference::parse("").is_err());
        assert!(ArtifactReference::parse("/hello").is_err());
    }

    #[test]
    fn test_parse_rejects_uppercase_repository() {
        assert!(ArtifactReference::parse("localhost:5000/Hello").is_err());
        assert!(ArtifactReference::parse("localhost:5000/hello-").is_err());
        assert!(ArtifactReference::parse("localhost:5000/a__b").is_ok());
        assert!(ArtifactReference::parse("localhost:5000/a--b.c_d").is_ok());
    }

    #[test]
    fn test_parse_rejects_bad_digest() {
        assert!(ArtifactReference::parse("ghcr.io/org/app@sha256:abc").is_err());
    }

    #[test]
    fn test_parse_rejects_bad_tag() {
        let err = ArtifactReference::parse("localhost:5000/hello:-bad").unwrap_err();
        assert!(matches!(err, RelayError::InvalidTag { .. }));
    }

    #[test]
    fn test_with_reference() {
        let r = ArtifactReference::parse("localhost:5000/hello:v1").unwrap();
        assert_eq!(r.with_reference("v2").to_string(), "localhost:5000/hello:v2");
        assert_eq!(
            r.with_reference(DIGEST).to_string(),
            format!("localhost:5000/hello@{}", DIGEST)
        );
    }

    #[test]
    fn test_tag_grammar() {
        assert!(is_valid_tag("v1"));
        assert!(is_valid_tag("_internal"));
        assert!(is_valid_tag("1.0.0-rc.1"));
        assert!(is_valid_tag(&"a".repeat(128)));

        assert!(!is_valid_tag(""));
        assert!(!is_valid_tag(".hidden"));
        assert!(!is_valid_tag("-dash"));
        assert!(!is_valid_tag("has space"));
        assert!(!is_valid_tag("tag:colon"));
        assert!(!is_valid_tag(&"a".repeat(129)));
        assert!(!is_valid_tag("é"));
    }
}
