use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::header::{ACCEPT, RANGE, WWW_AUTHENTICATE};
use reqwest::{RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::auth::{Anonymous, CredentialProvider, Credentials};
use crate::error::{OciError, Result};
use crate::manifest::{
    self, ImageConfig, ImageIndex, OciManifest, Platform, MEDIA_TYPE_DOCKER_MANIFEST,
    MEDIA_TYPE_DOCKER_MANIFEST_LIST, MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_MANIFEST,
};

const DOCKER_HUB: &str = "registry-1.docker.io";

// ---------------------------------------------------------------------------
// ImageRef
// ---------------------------------------------------------------------------

/// A parsed OCI image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Registry hostname (e.g. "registry-1.docker.io").
    pub registry: String,
    /// Repository path (e.g. "library/alpine").
    pub repository: String,
    /// Tag or digest reference (e.g. "latest" or "sha256:abc123").
    pub reference: String,
}

impl ImageRef {
    /// Parse a raw image reference string.
    ///
    /// Supported formats:
    /// - `alpine:latest`
    /// - `ubuntu`
    /// - `ghcr.io/foo/bar:v1`
    /// - `my.registry.io/org/repo@sha256:abc123`
    /// - `localhost:5000/repo:tag`
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(OciError::Reference("empty image reference".to_string()));
        }

        let (name_part, reference) = if let Some(at_pos) = raw.find('@') {
            (&raw[..at_pos], raw[at_pos + 1..].to_string())
        } else {
            // A tag colon always comes after the last '/', otherwise it is
            // a registry port.
            let after_last_slash = raw.rfind('/').map(|p| p + 1).unwrap_or(0);
            match raw.rfind(':') {
                Some(colon_pos) if colon_pos > after_last_slash => {
                    (&raw[..colon_pos], raw[colon_pos + 1..].to_string())
                }
                _ => (raw, "latest".to_string()),
            }
        };

        if name_part.is_empty() || reference.is_empty() {
            return Err(OciError::Reference(raw.to_string()));
        }

        // A first component with a dot or colon, or "localhost", is a host.
        let (registry, repository) = match name_part.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => (DOCKER_HUB.to_string(), name_part.to_string()),
        };

        let repository = if registry == DOCKER_HUB && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository
        };

        Ok(Self {
            registry,
            repository,
            reference,
        })
    }

    /// `true` when the reference pins a content digest instead of a tag.
    pub fn is_digest(&self) -> bool {
        self.reference.starts_with("sha256:")
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sep = if self.is_digest() { '@' } else { ':' };
        write!(f, "{}/{}{}{}", self.registry, self.repository, sep, self.reference)
    }
}

// ---------------------------------------------------------------------------
// RegistryClient
// ---------------------------------------------------------------------------

type TokenKey = (String, String);

/// OCI Distribution HTTP client with a per-repository bearer token cache.
pub struct RegistryClient {
    client: reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
    tokens: Mutex<HashMap<TokenKey, SecretString>>,
}

/// Return the base URL scheme for a registry host.
/// Localhost and loopback registries default to HTTP; everything else to HTTPS.
pub(crate) fn registry_scheme(registry: &str) -> &'static str {
    let host = registry.split(':').next().unwrap_or(registry);
    if host == "localhost" || host == "127.0.0.1" || host == "::1" {
        "http"
    } else {
        "https"
    }
}

enum RequestAuth {
    None,
    Bearer(SecretString),
    Basic(String, SecretString),
}

impl RegistryClient {
    /// Build a client that pulls anonymously.
    pub fn new() -> Result<Self> {
        Self::with_credentials(Arc::new(Anonymous))
    }

    pub fn with_credentials(credentials: Arc<dyn CredentialProvider>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("clip-oci/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            credentials,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    // -- public API ---------------------------------------------------------

    /// Fetch the manifest (or image index) for `image_ref`.
    pub async fn fetch_manifest(&self, image_ref: &ImageRef) -> Result<ManifestResponse> {
        let url = self.url(image_ref, "manifests", &image_ref.reference);
        let accept = [
            MEDIA_TYPE_OCI_INDEX,
            MEDIA_TYPE_DOCKER_MANIFEST_LIST,
            MEDIA_TYPE_OCI_MANIFEST,
            MEDIA_TYPE_DOCKER_MANIFEST,
        ]
        .join(", ");

        let body = self
            .authenticated_get(&url, image_ref, Some(&accept), 0)
            .await?
            .bytes()
            .await?;

        // Peek at the document to decide which type to deserialize.
        let raw: serde_json::Value = serde_json::from_slice(&body)?;
        let media_type = raw.get("mediaType").and_then(|v| v.as_str()).unwrap_or("");

        if manifest::is_index_media_type(media_type) || raw.get("manifests").is_some() {
            Ok(ManifestResponse::Index(serde_json::from_value(raw)?))
        } else {
            Ok(ManifestResponse::Manifest(serde_json::from_value(raw)?))
        }
    }

    /// Fetch a single manifest by its digest (used after resolving an index).
    pub async fn fetch_manifest_by_digest(
        &self,
        image_ref: &ImageRef,
        digest: &str,
    ) -> Result<OciManifest> {
        let url = self.url(image_ref, "manifests", digest);
        let accept = [MEDIA_TYPE_OCI_MANIFEST, MEDIA_TYPE_DOCKER_MANIFEST].join(", ");
        let body = self
            .authenticated_get(&url, image_ref, Some(&accept), 0)
            .await?
            .bytes()
            .await?;
        verify_digest(digest, &body)?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Resolve an image reference to a concrete [`OciManifest`], selecting the
    /// platform-appropriate entry when the reference names an index.
    pub async fn resolve_manifest(
        &self,
        image_ref: &ImageRef,
        platform: &Platform,
    ) -> Result<OciManifest> {
        match self.fetch_manifest(image_ref).await? {
            ManifestResponse::Manifest(m) => Ok(m),
            ManifestResponse::Index(idx) => {
                let desc = idx.select_platform(platform)?;
                info!(
                    digest = %desc.digest,
                    "resolved platform {}/{}",
                    platform.os,
                    platform.architecture,
                );
                self.fetch_manifest_by_digest(image_ref, &desc.digest).await
            }
        }
    }

    /// Download a small blob in full and verify its digest.
    pub async fn fetch_blob(&self, image_ref: &ImageRef, digest: &str) -> Result<Vec<u8>> {
        let url = self.url(image_ref, "blobs", digest);
        let body = self
            .authenticated_get(&url, image_ref, None, 0)
            .await?
            .bytes()
            .await?;
        verify_digest(digest, &body)?;
        Ok(body.to_vec())
    }

    /// Download and parse the image config referenced by `manifest`.
    pub async fn fetch_config(
        &self,
        image_ref: &ImageRef,
        manifest: &OciManifest,
    ) -> Result<ImageConfig> {
        let raw = self.fetch_blob(image_ref, &manifest.config.digest).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Start a blob download at byte `offset`.
    ///
    /// The registry may ignore the `Range` header; check
    /// [`BlobResponse::skip`] before consuming the body.
    pub async fn open_blob(
        &self,
        image_ref: &ImageRef,
        digest: &str,
        offset: u64,
    ) -> Result<BlobResponse> {
        let url = self.url(image_ref, "blobs", digest);
        let response = self
            .authenticated_get(&url, image_ref, None, offset)
            .await?;
        let skip = if offset > 0 && response.status() != StatusCode::PARTIAL_CONTENT {
            debug!(digest, offset, "registry ignored range request");
            offset
        } else {
            0
        };
        Ok(BlobResponse { response, skip })
    }

    // -- internals ----------------------------------------------------------

    fn url(&self, image_ref: &ImageRef, kind: &str, reference: &str) -> String {
        format!(
            "{}://{}/v2/{}/{}/{}",
            registry_scheme(&image_ref.registry),
            image_ref.registry,
            image_ref.repository,
            kind,
            reference,
        )
    }

    fn token_key(image_ref: &ImageRef) -> TokenKey {
        (image_ref.registry.clone(), image_ref.repository.clone())
    }

    fn cached_token(&self, key: &TokenKey) -> Option<SecretString> {
        self.tokens.lock().ok().and_then(|t| t.get(key).cloned())
    }

    fn store_token(&self, key: TokenKey, token: SecretString) {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(key, token);
        }
    }

    fn forget_token(&self, key: &TokenKey) {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.remove(key);
        }
    }

    fn build_get(&self, url: &str, accept: Option<&str>, offset: u64, auth: &RequestAuth) -> RequestBuilder {
        let mut req = self.client.get(url);
        if let Some(a) = accept {
            req = req.header(ACCEPT, a);
        }
        if offset > 0 {
            req = req.header(RANGE, format!("bytes={}-", offset));
        }
        match auth {
            RequestAuth::None => req,
            RequestAuth::Bearer(token) => req.bearer_auth(token.expose_secret()),
            RequestAuth::Basic(user, pass) => req.basic_auth(user, Some(pass.expose_secret())),
        }
    }

    /// GET with the cached token, falling back to the challenge flow on 401.
    async fn authenticated_get(
        &self,
        url: &str,
        image_ref: &ImageRef,
        accept: Option<&str>,
        offset: u64,
    ) -> Result<reqwest::Response> {
        let key = Self::token_key(image_ref);
        let first_auth = match self.cached_token(&key) {
            Some(token) => RequestAuth::Bearer(token),
            None => RequestAuth::None,
        };

        let resp = self.build_get(url, accept, offset, &first_auth).send().await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return check_status(url, resp).await;
        }

        let challenge = resp
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let creds = self
            .credentials
            .credentials(&image_ref.registry, &image_ref.repository)?;
        debug!(
            provider = self.credentials.name(),
            has_credentials = creds.is_some(),
            "registry challenged request",
        );

        let auth = if challenge.to_ascii_lowercase().starts_with("basic") {
            match creds {
                Some(Credentials::Basic { username, password }) => {
                    RequestAuth::Basic(username, password)
                }
                Some(Credentials::Bearer(token)) => RequestAuth::Bearer(token),
                None => {
                    return Err(OciError::Auth(format!(
                        "{} requires credentials",
                        image_ref.registry
                    )))
                }
            }
        } else {
            let token = match creds {
                Some(Credentials::Bearer(token)) => token,
                other => {
                    self.fetch_bearer_token(&challenge, image_ref, other.as_ref())
                        .await?
                }
            };
            self.store_token(key.clone(), token.clone());
            RequestAuth::Bearer(token)
        };

        let retry = self.build_get(url, accept, offset, &auth).send().await?;
        let status = retry.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            self.forget_token(&key);
            warn!(%url, %status, "registry rejected credentials");
            return Err(OciError::Auth(format!("GET {} returned {}", url, status)));
        }
        check_status(url, retry).await
    }

    /// Parse a `www-authenticate: Bearer realm="…",service="…",scope="…"`
    /// header and fetch a token, presenting basic credentials when we have them.
    async fn fetch_bearer_token(
        &self,
        www_auth: &str,
        image_ref: &ImageRef,
        creds: Option<&Credentials>,
    ) -> Result<SecretString> {
        let realm = extract_param(www_auth, "realm").unwrap_or_default();
        let service = extract_param(www_auth, "service").unwrap_or_default();
        let scope = extract_param(www_auth, "scope")
            .unwrap_or_else(|| format!("repository:{}:pull", image_ref.repository));

        if realm.is_empty() {
            return Err(OciError::Auth(
                "www-authenticate header missing realm".to_string(),
            ));
        }

        let mut query = vec![("scope", scope.as_str())];
        if !service.is_empty() {
            query.push(("service", service.as_str()));
        }
        debug!(%realm, %service, %scope, "fetching bearer token");

        let mut req = self.client.get(&realm).query(&query);
        if let Some(Credentials::Basic { username, password }) = creds {
            req = req.basic_auth(username, Some(password.expose_secret()));
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(OciError::Auth(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        let body: serde_json::Value = resp.json().await?;
        let token = body
            .get("token")
            .or_else(|| body.get("access_token"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| OciError::Auth("token response missing token field".to_string()))?;

        Ok(SecretString::from(token.to_string()))
    }
}

async fn check_status(url: &str, resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else if status == StatusCode::NOT_FOUND {
        Err(OciError::NotFound(url.to_string()))
    } else {
        let body = resp.text().await.unwrap_or_default();
        Err(OciError::Registry(format!(
            "GET {} returned {}: {}",
            url, status, body
        )))
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// The result of fetching a manifest endpoint: either a single manifest or
/// an image index that must be further resolved.
pub enum ManifestResponse {
    Manifest(OciManifest),
    Index(ImageIndex),
}

/// An in-flight blob download.
pub struct BlobResponse {
    pub response: reqwest::Response,
    /// Leading bytes to discard because the registry answered a ranged
    /// request with the whole blob.
    pub skip: u64,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Compute the SHA-256 hex digest of `data`.
pub fn hex_digest(data: &[u8]) -> String {
    hex_encode(&Sha256::digest(data))
}

pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Extract the hex portion from a digest string like "sha256:abcdef…".
pub fn digest_hex(digest: &str) -> &str {
    digest.strip_prefix("sha256:").unwrap_or(digest)
}

fn verify_digest(digest: &str, data: &[u8]) -> Result<()> {
    if !digest.starts_with("sha256:") {
        return Ok(());
    }
    let actual = hex_digest(data);
    let expected = digest_hex(digest);
    if actual != expected {
        return Err(OciError::DigestMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

/// Extract a parameter value from a `www-authenticate` header.
/// E.g. `extract_param(header, "realm")` returns the value of `realm="…"`.
fn extract_param(header: &str, param: &str) -> Option<String> {
    let search = format!("{}=\"", param);
    let start = header.find(&search)? + search.len();
    let end = header[start..].find('"')?;
    Some(header[start..start + end].to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
