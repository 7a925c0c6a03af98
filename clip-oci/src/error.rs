/// Errors produced by the OCI client.
#[derive(Debug, thiserror::Error)]
pub enum OciError {
    #[error("registry error: {0}")]
    Registry(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("invalid image reference: {0}")]
    Reference(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),
}

impl OciError {
    /// Whether the failure came from the network or the registry's
    /// authorization layer rather than from the content it returned.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            OciError::Registry(_)
                | OciError::Auth(_)
                | OciError::Timeout(_)
                | OciError::Http(_)
                | OciError::Io(_)
                | OciError::NotFound(_)
        )
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OciError>;
