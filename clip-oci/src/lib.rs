pub mod auth;
pub mod blob;
pub mod error;
pub mod manifest;
pub mod registry;

pub use auth::{CredentialProvider, Credentials};
pub use blob::{is_transport_error, BlobReader, TransportError};
pub use error::{OciError, Result};
pub use manifest::{ImageConfig, OciManifest, Platform};
pub use registry::{ImageRef, RegistryClient};

use std::sync::Arc;
use tracing::info;

/// OCI image client: resolves references to manifests and configs without
/// downloading layer data.
pub struct OciClient {
    registry: Arc<RegistryClient>,
    platform: Platform,
}

/// A resolved image: its manifest (for the selected platform) and config.
#[derive(Debug, Clone)]
pub struct ResolvedImage {
    pub image: ImageRef,
    pub manifest: OciManifest,
    pub config: ImageConfig,
}

impl ResolvedImage {
    /// Layer digests in application order (bottom first).
    pub fn layer_digests(&self) -> Vec<String> {
        self.manifest.layers.iter().map(|l| l.digest.clone()).collect()
    }
}

impl OciClient {
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> Result<Self> {
        Ok(Self {
            registry: Arc::new(RegistryClient::with_credentials(credentials)?),
            platform: Platform::host(),
        })
    }

    /// Override the platform used to pick a manifest out of an image index.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn registry(&self) -> Arc<RegistryClient> {
        Arc::clone(&self.registry)
    }

    /// Fetch the manifest and config for `image_ref`.
    pub async fn resolve(&self, image_ref: &str) -> Result<ResolvedImage> {
        let parsed = ImageRef::parse(image_ref)?;
        info!(
            registry = %parsed.registry,
            repository = %parsed.repository,
            reference = %parsed.reference,
            "resolving image",
        );

        let manifest = self
            .registry
            .resolve_manifest(&parsed, &self.platform)
            .await?;
        manifest.ensure_gzip_layers()?;
        let config = self.registry.fetch_config(&parsed, &manifest).await?;

        info!(
            layers = manifest.layers.len(),
            os = %config.os,
            architecture = %config.architecture,
            "image resolved",
        );

        Ok(ResolvedImage {
            image: parsed,
            manifest,
            config,
        })
    }
}
