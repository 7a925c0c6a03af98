//! Registry credential providers.
//!
//! A provider is asked for credentials every time the client needs a new
//! bearer token for a `(registry, repository)` pair. Returning `Ok(None)`
//! means "pull anonymously".

use std::sync::Arc;

use secrecy::SecretString;

use crate::Result;

/// Credentials presented to a registry or its token endpoint.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// Username/password, sent as HTTP basic auth.
    Basic {
        username: String,
        password: SecretString,
    },
    /// A pre-issued bearer token, sent as-is.
    Bearer(SecretString),
}

impl Credentials {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials::Basic {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Credentials::Bearer(SecretString::from(token.into()))
    }
}

/// Supplies credentials for a registry repository.
pub trait CredentialProvider: Send + Sync {
    fn credentials(&self, registry: &str, repository: &str) -> Result<Option<Credentials>>;

    /// Short name used in log lines.
    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// Anonymous
// ---------------------------------------------------------------------------

/// Never supplies credentials.
#[derive(Debug, Default, Clone, Copy)]
pub struct Anonymous;

impl CredentialProvider for Anonymous {
    fn credentials(&self, _registry: &str, _repository: &str) -> Result<Option<Credentials>> {
        Ok(None)
    }

    fn name(&self) -> &'static str {
        "anonymous"
    }
}

// ---------------------------------------------------------------------------
// Static
// ---------------------------------------------------------------------------

/// Hands out one fixed set of credentials, optionally only for one registry.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    registry: Option<String>,
    credentials: Credentials,
}

impl StaticCredentials {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            registry: None,
            credentials,
        }
    }

    /// Restrict these credentials to `registry`; other hosts get `None`.
    pub fn for_registry(mut self, registry: impl Into<String>) -> Self {
        self.registry = Some(registry.into());
        self
    }
}

impl CredentialProvider for StaticCredentials {
    fn credentials(&self, registry: &str, _repository: &str) -> Result<Option<Credentials>> {
        match self.registry {
            Some(ref only) if only != registry => Ok(None),
            _ => Ok(Some(self.credentials.clone())),
        }
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

pub const ENV_USERNAME: &str = "CLIP_REGISTRY_USERNAME";
pub const ENV_PASSWORD: &str = "CLIP_REGISTRY_PASSWORD";
pub const ENV_TOKEN: &str = "CLIP_REGISTRY_TOKEN";

/// Reads `CLIP_REGISTRY_TOKEN`, or `CLIP_REGISTRY_USERNAME` plus
/// `CLIP_REGISTRY_PASSWORD`, at call time.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentials;

impl CredentialProvider for EnvCredentials {
    fn credentials(&self, _registry: &str, _repository: &str) -> Result<Option<Credentials>> {
        if let Ok(token) = std::env::var(ENV_TOKEN) {
            if !token.is_empty() {
                return Ok(Some(Credentials::bearer(token)));
            }
        }
        match (std::env::var(ENV_USERNAME), std::env::var(ENV_PASSWORD)) {
            (Ok(user), Ok(pass)) if !user.is_empty() => Ok(Some(Credentials::basic(user, pass))),
            _ => Ok(None),
        }
    }

    fn name(&self) -> &'static str {
        "env"
    }
}

// ---------------------------------------------------------------------------
// Closure-backed
// ---------------------------------------------------------------------------

type CredentialFn = dyn Fn(&str, &str) -> Result<Option<Credentials>> + Send + Sync;

/// Delegates to a caller-supplied function.
#[derive(Clone)]
pub struct FnCredentials(Arc<CredentialFn>);

impl FnCredentials {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&str, &str) -> Result<Option<Credentials>> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }
}

impl std::fmt::Debug for FnCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnCredentials(..)")
    }
}

impl CredentialProvider for FnCredentials {
    fn credentials(&self, registry: &str, repository: &str) -> Result<Option<Credentials>> {
        (self.0)(registry, repository)
    }

    fn name(&self) -> &'static str {
        "callback"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn static_credentials_scoped_to_registry() {
        let p = StaticCredentials::new(Credentials::basic("u", "p")).for_registry("ghcr.io");
        assert!(p.credentials("ghcr.io", "a/b").unwrap().is_some());
        assert!(p.credentials("docker.io", "a/b").unwrap().is_none());
    }

    #[test]
    fn closure_provider_sees_repository() {
        let p = FnCredentials::new(|_, repo| {
            Ok((repo == "private/app").then(|| Credentials::bearer("tok")))
        });
        match p.credentials("r", "private/app").unwrap() {
            Some(Credentials::Bearer(t)) => assert_eq!(t.expose_secret(), "tok"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(p.credentials("r", "public/app").unwrap().is_none());
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let creds = Credentials::basic("alice", "hunter2");
        let shown = format!("{creds:?}");
        assert!(shown.contains("alice"));
        assert!(!shown.contains("hunter2"));
    }

    #[test]
    fn anonymous_yields_nothing() {
        assert!(Anonymous.credentials("any", "thing").unwrap().is_none());
        assert_eq!(Anonymous.name(), "anonymous");
    }
}
