//! Referrers of a subject on a remote registry.
//!
//! Registries that implement the referrers API answer
//! `GET /v2/<name>/referrers/<digest>` themselves. On other registries the
//! pushing client maintains a fallback index tagged `<alg>-<hex>` of the
//! subject digest that lists every manifest declaring it as subject.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE, LINK, WWW_AUTHENTICATE};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tokio::sync::OnceCell;

use a3s_relay_core::descriptor::{Descriptor, ImageIndex, MEDIA_TYPE_OCI_INDEX};
use a3s_relay_core::error::{RelayError, Result};

use super::credentials::RegistryAuth;

/// The two places referrers of a subject can live.
#[async_trait]
pub(crate) trait ReferrersBackend: Send + Sync {
    /// Answer of the referrers API, or `None` when the registry lacks it.
    async fn query_api(&self, subject: &Descriptor) -> Result<Option<ImageIndex>>;

    /// Fallback index stored under `tag`, or `None` when it was never written.
    async fn load_index(&self, tag: &str) -> Result<Option<ImageIndex>>;

    async fn save_index(&self, tag: &str, index: &ImageIndex) -> Result<()>;
}

/// Tag holding the fallback index of a subject (`sha256:abc` -> `sha256-abc`).
pub(crate) fn referrers_tag(digest: &str) -> String {
    digest.replacen(':', "-", 1)
}

/// Referrers of `subject`, from the API when the registry has it and from
/// the fallback index otherwise.
pub(crate) async fn list_referrers(
    backend: &dyn ReferrersBackend,
    subject: &Descriptor,
) -> Result<Vec<Descriptor>> {
    if let Some(index) = backend.query_api(subject).await? {
        return Ok(index.manifests);
    }
    let index = backend.load_index(&referrers_tag(&subject.digest)).await?;
    Ok(index.map(|index| index.manifests).unwrap_or_default())
}

/// One lock per subject digest, shared by every update of its fallback index.
#[derive(Default)]
pub(crate) struct ReferrerLocks {
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl ReferrerLocks {
    fn lock_for(&self, digest: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.entry(digest.to_string()).or_default().clone()
    }
}

/// Record `referrer` in the fallback index of `subject`.
///
/// Nothing is written when the registry indexes referrers itself or the
/// index already lists `referrer`. Returns whether the index changed.
pub(crate) async fn add_referrer(
    backend: &dyn ReferrersBackend,
    locks: &ReferrerLocks,
    subject: &Descriptor,
    referrer: Descriptor,
) -> Result<bool> {
    if backend.query_api(subject).await?.is_some() {
        return Ok(false);
    }

    let lock = locks.lock_for(&subject.digest);
    let _guard = lock.lock().await;

    let tag = referrers_tag(&subject.digest);
    let mut index = backend.load_index(&tag).await?.unwrap_or_else(ImageIndex::new);
    if index.manifests.contains(&referrer) {
        return Ok(false);
    }
    index.manifests.push(referrer);
    backend.save_index(&tag, &index).await?;
    Ok(true)
}

/// Credentials attached to referrers API requests.
#[derive(Debug, Clone, PartialEq)]
enum Authorization {
    Basic,
    Bearer(String),
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Client for the referrers API of one repository.
pub(crate) struct ReferrersApi {
    http: reqwest::Client,
    base_url: String,
    registry: String,
    repository: String,
    auth: RegistryAuth,
    authorization: Mutex<Option<Authorization>>,
    supported: OnceCell<bool>,
}

impl ReferrersApi {
    pub(crate) fn new(
        base_url: String,
        registry: String,
        repository: String,
        auth: RegistryAuth,
        insecure: bool,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(insecure)
            .build()
            .map_err(|e| RelayError::Registry {
                registry: registry.clone(),
                message: format!("Failed to create HTTP client: {}", e),
            })?;
        Ok(Self {
            http,
            base_url,
            registry,
            repository,
            auth,
            authorization: Mutex::new(None),
            supported: OnceCell::new(),
        })
    }

    fn error(&self, message: String) -> RelayError {
        RelayError::Registry {
            registry: self.registry.clone(),
            message,
        }
    }

    /// All referrers of `digest`, or `None` when the registry has no
    /// referrers API. Support is detected once per client.
    pub(crate) async fn fetch(&self, digest: &str) -> Result<Option<ImageIndex>> {
        if self.supported.get() == Some(&false) {
            return Ok(None);
        }

        let mut url = format!("{}/v2/{}/referrers/{}", self.base_url, self.repository, digest);
        let mut merged: Option<ImageIndex> = None;
        loop {
            let response = self.send(&url).await?;
            let status = response.status();
            if merged.is_none() && !is_index_response(status, response.headers()) {
                if status.is_success() || status == StatusCode::NOT_FOUND {
                    tracing::debug!(registry = %self.registry, %status, "Referrers API unavailable");
                    let _ = self.supported.set(false);
                    return Ok(None);
                }
                return Err(self.error(format!(
                    "Failed to query referrers of {} in {}: {}",
                    digest, self.repository, status
                )));
            }
            if !status.is_success() {
                return Err(self.error(format!(
                    "Failed to page referrers of {} in {}: {}",
                    digest, self.repository, status
                )));
            }
            let _ = self.supported.set(true);

            let next = next_link(response.headers());
            let body = response
                .bytes()
                .await
                .map_err(|e| self.error(format!("Failed to read referrers response: {}", e)))?;
            let page: ImageIndex = serde_json::from_slice(&body)?;
            match merged.as_mut() {
                Some(index) => index.manifests.extend(page.manifests),
                None => merged = Some(page),
            }

            match next {
                Some(link) if link.starts_with("http://") || link.starts_with("https://") => url = link,
                Some(link) => url = format!("{}{}", self.base_url, link),
                None => return Ok(merged),
            }
        }
    }

    fn request(&self, url: &str) -> RequestBuilder {
        let builder = self.http.get(url).header(ACCEPT, MEDIA_TYPE_OCI_INDEX);
        match (self.authorization.lock().clone(), &self.auth) {
            (Some(Authorization::Bearer(token)), _) => builder.bearer_auth(token),
            (Some(Authorization::Basic), RegistryAuth::Basic { username, password }) => {
                builder.basic_auth(username, Some(password))
            }
            _ => builder,
        }
    }

    /// GET `url`, answering one authentication challenge if the registry
    /// raises it.
    async fn send(&self, url: &str) -> Result<Response> {
        let response = self
            .request(url)
            .send()
            .await
            .map_err(|e| self.error(format!("Failed to reach referrers API: {}", e)))?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .and_then(Challenge::parse);
        let Some(challenge) = challenge else {
            return Ok(response);
        };
        let authorization = self.authorize(&challenge).await?;
        *self.authorization.lock() = Some(authorization);

        self.request(url)
            .send()
            .await
            .map_err(|e| self.error(format!("Failed to reach referrers API: {}", e)))
    }

    async fn authorize(&self, challenge: &Challenge) -> Result<Authorization> {
        if challenge.scheme == "basic" {
            return Ok(Authorization::Basic);
        }

        let realm = challenge
            .params
            .get("realm")
            .ok_or_else(|| self.error("Bearer challenge without realm".to_string()))?;
        let scope = challenge
            .params
            .get("scope")
            .cloned()
            .unwrap_or_else(|| format!("repository:{}:pull", self.repository));
        let mut query = vec![("scope", scope)];
        if let Some(service) = challenge.params.get("service") {
            query.push(("service", service.clone()));
        }

        let mut request = self.http.get(realm).query(&query);
        if let RegistryAuth::Basic { username, password } = &self.auth {
            request = request.basic_auth(username, Some(password));
        }
        let response = request
            .send()
            .await
            .map_err(|e| self.error(format!("Failed to fetch token from {}: {}", realm, e)))?;
        if !response.status().is_success() {
            return Err(self.error(format!(
                "Token endpoint {} returned {}",
                realm,
                response.status()
            )));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| self.error(format!("Invalid token response from {}: {}", realm, e)))?;
        token
            .token
            .or(token.access_token)
            .map(Authorization::Bearer)
            .ok_or_else(|| self.error(format!("Token response from {} has no token", realm)))
    }
}

fn is_index_response(status: StatusCode, headers: &HeaderMap) -> bool {
    status.is_success()
        && headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map_or(false, |value| value.starts_with(MEDIA_TYPE_OCI_INDEX))
}

/// Target of a `Link: <url>; rel="next"` header.
fn next_link(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(LINK)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .find(|link| link.contains("rel=\"next\"") || link.contains("rel=next"))
        .and_then(|link| {
            let start = link.find('<')? + 1;
            let end = link[start..].find('>')? + start;
            Some(link[start..end].to_string())
        })
}

/// A parsed `WWW-Authenticate` header.
#[derive(Debug, PartialEq)]
struct Challenge {
    /// Lowercased scheme
    scheme: String,
    params: BTreeMap<String, String>,
}

impl Challenge {
    fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, rest) = match header.find(' ') {
            Some(pos) => (&header[..pos], &header[pos + 1..]),
            None => (header, ""),
        };
        if scheme.is_empty() {
            return None;
        }

        let mut params = BTreeMap::new();
        let mut chars = rest.chars().peekable();
        loop {
            while chars.peek().map_or(false, |c| *c == ',' || c.is_whitespace()) {
                chars.next();
            }
            let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
            if key.is_empty() {
                break;
            }
            let mut value = String::new();
            if chars.peek() == Some(&'"') {
                chars.next();
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => value.extend(chars.next()),
                        '"' => break,
                        c => value.push(c),
                    }
                }
            } else {
                value = chars.by_ref().take_while(|c| *c != ',').collect();
            }
            params.insert(key.trim().to_lowercase(), value.trim().to_string());
        }

        Some(Self {
            scheme: scheme.to_lowercase(),
            params,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use a3s_relay_core::descriptor::MEDIA_TYPE_OCI_MANIFEST;
    use reqwest::header::HeaderValue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Registry double holding fallback indexes in memory.
    #[derive(Default)]
    struct FakeRegistry {
        api: Option<ImageIndex>,
        indexes: Mutex<BTreeMap<String, ImageIndex>>,
        saves: AtomicUsize,
    }

    #[async_trait]
    impl ReferrersBackend for FakeRegistry {
        async fn query_api(&self, _subject: &Descriptor) -> Result<Option<ImageIndex>> {
            Ok(self.api.clone())
        }

        async fn load_index(&self, tag: &str) -> Result<Option<ImageIndex>> {
            let index = self.indexes.lock().get(tag).cloned();
            // Let a concurrent update run between read and write.
            for _ in 0..4 {
                tokio::task::yield_now().await;
            }
            Ok(index)
        }

        async fn save_index(&self, tag: &str, index: &ImageIndex) -> Result<()> {
            tokio::task::yield_now().await;
            self.indexes.lock().insert(tag.to_string(), index.clone());
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn manifest(name: &[u8]) -> Descriptor {
        Descriptor::from_content(MEDIA_TYPE_OCI_MANIFEST, name)
    }

    #[test]
    fn test_referrers_tag() {
        assert_eq!(referrers_tag("sha256:abc"), "sha256-abc");
    }

    #[tokio::test]
    async fn test_add_referrer_creates_and_extends_index() {
        let registry = FakeRegistry::default();
        let locks = ReferrerLocks::default();
        let subject = manifest(b"subject");
        let sig = manifest(b"sig");
        let sbom = manifest(b"sbom");

        assert!(add_referrer(&registry, &locks, &subject, sig.clone()).await.unwrap());
        assert!(add_referrer(&registry, &locks, &subject, sbom.clone()).await.unwrap());
        assert!(!add_referrer(&registry, &locks, &subject, sig.clone()).await.unwrap());

        let tag = referrers_tag(&subject.digest);
        let index = registry.indexes.lock().get(&tag).cloned().unwrap();
        assert_eq!(index.media_type.as_deref(), Some(MEDIA_TYPE_OCI_INDEX));
        assert_eq!(index.manifests, vec![sig, sbom]);
        assert_eq!(registry.saves.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_add_referrer_keeps_both() {
        let registry = FakeRegistry::default();
        let locks = ReferrerLocks::default();
        let subject = manifest(b"subject");
        let sig = manifest(b"sig");
        let sbom = manifest(b"sbom");

        let (a, b) = tokio::join!(
            add_referrer(&registry, &locks, &subject, sig.clone()),
            add_referrer(&registry, &locks, &subject, sbom.clone()),
        );
        a.unwrap();
        b.unwrap();

        let found = list_referrers(&registry, &subject).await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.contains(&sig));
        assert!(found.contains(&sbom));
    }

    #[tokio::test]
    async fn test_subjects_do_not_share_index() {
        let registry = FakeRegistry::default();
        let locks = ReferrerLocks::default();
        let first = manifest(b"first");
        let second = manifest(b"second");
        let sig = manifest(b"sig");

        let (a, b) = tokio::join!(
            add_referrer(&registry, &locks, &first, sig.clone()),
            add_referrer(&registry, &locks, &second, sig.clone()),
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(list_referrers(&registry, &first).await.unwrap(), vec![sig.clone()]);
        assert_eq!(list_referrers(&registry, &second).await.unwrap(), vec![sig]);
    }

    #[tokio::test]
    async fn test_native_api_wins_over_fallback_index() {
        let subject = manifest(b"subject");
        let native = manifest(b"native");
        let stale = manifest(b"stale");

        let mut api = ImageIndex::new();
        api.manifests.push(native.clone());
        let registry = FakeRegistry {
            api: Some(api),
            ..Default::default()
        };
        registry
            .indexes
            .lock()
            .insert(referrers_tag(&subject.digest), {
                let mut index = ImageIndex::new();
                index.manifests.push(stale);
                index
            });

        assert_eq!(list_referrers(&registry, &subject).await.unwrap(), vec![native]);

        // The registry indexes pushed referrers itself.
        let locks = ReferrerLocks::default();
        assert!(!add_referrer(&registry, &locks, &subject, manifest(b"sig")).await.unwrap());
        assert_eq!(registry.saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_fallback_index_lists_nothing() {
        let registry = FakeRegistry::default();
        assert!(list_referrers(&registry, &manifest(b"subject"))
            .await
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_challenge_parse_bearer() {
        let challenge = Challenge::parse(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/ubuntu:pull,push""#,
        )
        .unwrap();
        assert_eq!(challenge.scheme, "bearer");
        assert_eq!(challenge.params["realm"], "https://auth.docker.io/token");
        assert_eq!(challenge.params["service"], "registry.docker.io");
        assert_eq!(challenge.params["scope"], "repository:library/ubuntu:pull,push");
    }

    #[test]
    fn test_challenge_parse_basic() {
        let challenge = Challenge::parse(r#"Basic realm="Registry Realm""#).unwrap();
        assert_eq!(challenge.scheme, "basic");
        assert_eq!(challenge.params["realm"], "Registry Realm");

        let bare = Challenge::parse("Basic").unwrap();
        assert!(bare.params.is_empty());
        assert!(Challenge::parse("   ").is_none());
    }

    #[test]
    fn test_next_link() {
        let mut headers = HeaderMap::new();
        assert_eq!(next_link(&headers), None);

        headers.insert(
            LINK,
            HeaderValue::from_static(r#"</v2/hello/referrers/sha256:abc?n=10&last=x>; rel="next""#),
        );
        assert_eq!(
            next_link(&headers).as_deref(),
            Some("/v2/hello/referrers/sha256:abc?n=10&last=x")
        );
    }

    #[test]
    fn test_is_index_response() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(MEDIA_TYPE_OCI_INDEX));
        assert!(is_index_response(StatusCode::OK, &headers));
        assert!(!is_index_response(StatusCode::NOT_FOUND, &headers));

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
        assert!(!is_index_response(StatusCode::OK, &headers));
    }
}
