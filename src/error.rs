//! Error types for clip

use thiserror::Error;

/// Result type alias using clip Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while indexing or serving an image
#[derive(Error, Debug)]
pub enum Error {
    /// A layer is not a well-formed gzip/tar stream
    #[error("malformed layer {layer} at offset {offset}: {reason}")]
    MalformedInput {
        layer: String,
        offset: u64,
        reason: String,
    },

    /// The origin could not deliver layer bytes (network, auth, missing blob)
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// A cache tier could not be used; callers fall through to the next tier
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    /// Path or layer absent from the index
    #[error("not found: {0}")]
    NotFound(String),

    /// The index breaks one of its structural rules
    #[error("index invariant violated: {0}")]
    InvariantViolation(String),

    /// Persisted artifact has a bad header or undecodable sections
    #[error("artifact error: {0}")]
    Artifact(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout waiting for operation
    #[error("Timeout: {0}")]
    Timeout(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn malformed(layer: &str, offset: u64, reason: impl Into<String>) -> Self {
        Error::MalformedInput {
            layer: layer.to_string(),
            offset,
            reason: reason.into(),
        }
    }

    /// Rebuild an error shared between several waiters.
    pub(crate) fn from_shared(shared: std::sync::Arc<Error>) -> Self {
        std::sync::Arc::try_unwrap(shared).unwrap_or_else(|e| e.duplicate())
    }

    fn duplicate(&self) -> Self {
        match self {
            Error::MalformedInput {
                layer,
                offset,
                reason,
            } => Error::malformed(layer, *offset, reason.clone()),
            Error::SourceUnavailable(m) => Error::SourceUnavailable(m.clone()),
            Error::CacheUnavailable(m) => Error::CacheUnavailable(m.clone()),
            Error::NotFound(m) => Error::NotFound(m.clone()),
            Error::InvariantViolation(m) => Error::InvariantViolation(m.clone()),
            Error::Artifact(m) => Error::Artifact(m.clone()),
            Error::Config(m) => Error::Config(m.clone()),
            Error::Timeout(m) => Error::Timeout(m.clone()),
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }
}

impl From<clip_oci::OciError> for Error {
    fn from(e: clip_oci::OciError) -> Self {
        match e {
            clip_oci::OciError::Timeout(msg) => Error::Timeout(msg),
            clip_oci::OciError::Reference(_) => Error::Config(e.to_string()),
            other => Error::SourceUnavailable(other.to_string()),
        }
    }
}

impl From<postcard::Error> for Error {
    fn from(e: postcard::Error) -> Self {
        Error::Artifact(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout("operation exceeded fetch timeout".to_string())
    }
}
