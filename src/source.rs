//! Origins of compressed layer bytes.
//!
//! A [`LayerSource`] is synchronous: indexing and checkpointed reads run on
//! blocking threads, and the registry-backed implementation bridges onto the
//! async HTTP client itself.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clip_oci::manifest::{self, ImageIndex, OciManifest, Platform, ANNOTATION_REF_NAME};
use clip_oci::registry::{digest_hex, hex_digest};
use clip_oci::{BlobReader, ImageConfig, ImageRef, OciClient, RegistryClient};
use serde::Deserialize;
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::archive::{ImageMetadata, StorageDescriptor, StorageKind};
use crate::error::{Error, Result};

/// Identity of a source, recorded in the artifact so a mount can reopen it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub kind: StorageKind,
    pub registry: String,
    pub repository: String,
    pub reference: String,
}

/// Supplier of compressed layer streams.
pub trait LayerSource: Send + Sync {
    /// Layer digests, bottom layer first.
    fn layer_digests(&self) -> Result<Vec<String>>;

    /// The whole compressed layer from byte 0.
    fn open_compressed(&self, digest: &str) -> Result<Box<dyn Read + Send>>;

    /// The compressed layer starting at `offset`.
    fn range_fetch(&self, digest: &str, offset: u64) -> Result<Box<dyn Read + Send>>;

    fn location(&self) -> SourceLocation;

    /// Runtime settings from the image config, when the source has one.
    fn image_metadata(&self) -> Option<ImageMetadata> {
        None
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Layers streamed from an OCI distribution registry.
pub struct RegistryLayerSource {
    client: Arc<RegistryClient>,
    image: ImageRef,
    layers: Vec<String>,
    metadata: Option<ImageMetadata>,
    handle: Handle,
    idle_timeout: Duration,
}

impl RegistryLayerSource {
    /// Resolve `image` (manifest and config) and capture the current runtime.
    pub async fn resolve(client: &OciClient, image: &str, idle_timeout: Duration) -> Result<Self> {
        let resolved = client.resolve(image).await?;
        Ok(Self {
            client: client.registry(),
            layers: resolved.layer_digests(),
            metadata: Some(ImageMetadata::from(&resolved.config)),
            image: resolved.image,
            handle: Handle::current(),
            idle_timeout,
        })
    }

    /// Reopen the registry recorded in an artifact, without touching the
    /// network until a layer is fetched.
    pub fn from_descriptor(
        client: Arc<RegistryClient>,
        storage: &StorageDescriptor,
        handle: Handle,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            client,
            image: ImageRef {
                registry: storage.registry.clone(),
                repository: storage.repository.clone(),
                reference: storage.reference.clone(),
            },
            layers: storage.layers.clone(),
            metadata: storage.image.clone(),
            handle,
            idle_timeout,
        }
    }

    pub fn image(&self) -> &ImageRef {
        &self.image
    }
}

impl LayerSource for RegistryLayerSource {
    fn layer_digests(&self) -> Result<Vec<String>> {
        Ok(self.layers.clone())
    }

    fn open_compressed(&self, digest: &str) -> Result<Box<dyn Read + Send>> {
        self.range_fetch(digest, 0)
    }

    fn range_fetch(&self, digest: &str, offset: u64) -> Result<Box<dyn Read + Send>> {
        debug!(digest, offset, image = %self.image, "fetching layer from registry");
        let reader = BlobReader::open(
            &self.handle,
            &self.client,
            &self.image,
            digest,
            offset,
            self.idle_timeout,
        )
        .map_err(|e| Error::SourceUnavailable(format!("{}: {}", digest, e)))?;
        Ok(Box::new(reader))
    }

    fn location(&self) -> SourceLocation {
        SourceLocation {
            kind: StorageKind::Oci,
            registry: self.image.registry.clone(),
            repository: self.image.repository.clone(),
            reference: self.image.reference.clone(),
        }
    }

    fn image_metadata(&self) -> Option<ImageMetadata> {
        self.metadata.clone()
    }
}

// ---------------------------------------------------------------------------
// OCI image layout
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct LayoutIndex {
    manifests: Vec<manifest::Descriptor>,
}

/// Layers read from an OCI image-layout directory (`index.json` + `blobs/`).
pub struct OciLayoutSource {
    root: PathBuf,
    reference: String,
    layers: Vec<String>,
    metadata: Option<ImageMetadata>,
}

impl OciLayoutSource {
    /// Open the manifest tagged `reference` (the first one when `None`).
    pub fn open(root: &Path, reference: Option<&str>, platform: &Platform) -> Result<Self> {
        let index_path = root.join("index.json");
        let raw = std::fs::read(&index_path)
            .map_err(|e| Error::SourceUnavailable(format!("{}: {}", index_path.display(), e)))?;
        let index: LayoutIndex = serde_json::from_slice(&raw)
            .map_err(|e| Error::Config(format!("{}: {}", index_path.display(), e)))?;

        let desc = match reference {
            Some(name) => index
                .manifests
                .iter()
                .find(|d| d.annotation(ANNOTATION_REF_NAME) == Some(name) || d.digest == name),
            None => index.manifests.first(),
        }
        .ok_or_else(|| Error::NotFound(format!("manifest {:?} in {}", reference, root.display())))?
        .clone();

        let manifest = Self::load_manifest(root, &desc, platform)?;
        manifest
            .ensure_gzip_layers()
            .map_err(|e| Error::Config(e.to_string()))?;
        let config: ImageConfig = serde_json::from_slice(&read_blob(root, &manifest.config.digest)?)
            .map_err(|e| Error::Config(format!("image config: {}", e)))?;

        info!(
            root = %root.display(),
            manifest = %desc.digest,
            layers = manifest.layers.len(),
            "opened OCI layout",
        );
        Ok(Self {
            root: root.to_path_buf(),
            reference: reference.unwrap_or(&desc.digest).to_string(),
            layers: manifest.layers.iter().map(|l| l.digest.clone()).collect(),
            metadata: Some(ImageMetadata::from(&config)),
        })
    }

    /// Reopen the layout recorded in an artifact.
    pub fn from_descriptor(storage: &StorageDescriptor) -> Self {
        Self {
            root: PathBuf::from(&storage.repository),
            reference: storage.reference.clone(),
            layers: storage.layers.clone(),
            metadata: storage.image.clone(),
        }
    }

    fn load_manifest(
        root: &Path,
        desc: &manifest::Descriptor,
        platform: &Platform,
    ) -> Result<OciManifest> {
        let raw = read_blob(root, &desc.digest)?;
        if manifest::is_index_media_type(&desc.media_type) {
            let nested: ImageIndex =
                serde_json::from_slice(&raw).map_err(|e| Error::Config(e.to_string()))?;
            let chosen = nested
                .select_platform(platform)
                .map_err(|e| Error::NotFound(e.to_string()))?
                .clone();
            return Self::load_manifest(root, &chosen, platform);
        }
        serde_json::from_slice(&raw).map_err(|e| Error::Config(format!("manifest: {}", e)))
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        blob_path(&self.root, digest)
    }
}

fn blob_path(root: &Path, digest: &str) -> PathBuf {
    root.join("blobs").join("sha256").join(digest_hex(digest))
}

fn read_blob(root: &Path, digest: &str) -> Result<Vec<u8>> {
    let path = blob_path(root, digest);
    let raw = std::fs::read(&path)
        .map_err(|e| Error::SourceUnavailable(format!("{}: {}", path.display(), e)))?;
    if hex_digest(&raw) != digest_hex(digest) {
        return Err(Error::SourceUnavailable(format!("{}: digest mismatch", digest)));
    }
    Ok(raw)
}

impl LayerSource for OciLayoutSource {
    fn layer_digests(&self) -> Result<Vec<String>> {
        Ok(self.layers.clone())
    }

    fn open_compressed(&self, digest: &str) -> Result<Box<dyn Read + Send>> {
        self.range_fetch(digest, 0)
    }

    fn range_fetch(&self, digest: &str, offset: u64) -> Result<Box<dyn Read + Send>> {
        let path = self.blob_path(digest);
        let unavailable = |e: std::io::Error| {
            Error::SourceUnavailable(format!("{}: {}", path.display(), e))
        };
        let mut file = File::open(&path).map_err(unavailable)?;
        file.seek(SeekFrom::Start(offset)).map_err(unavailable)?;
        Ok(Box::new(file))
    }

    fn location(&self) -> SourceLocation {
        SourceLocation {
            kind: StorageKind::OciLayout,
            registry: String::new(),
            repository: self.root.display().to_string(),
            reference: self.reference.clone(),
        }
    }

    fn image_metadata(&self) -> Option<ImageMetadata> {
        self.metadata.clone()
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Layers held in memory. Counts fetches and can simulate an outage.
#[derive(Default)]
pub struct MemoryLayerSource {
    order: Mutex<Vec<String>>,
    blobs: Mutex<HashMap<String, Arc<[u8]>>>,
    fetches: AtomicUsize,
    offline: AtomicBool,
}

impl MemoryLayerSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a source from compressed layers, bottom first.
    pub fn from_layers<I>(layers: I) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        let source = Self::new();
        for layer in layers {
            source.push_layer(layer);
        }
        source
    }

    /// Append a compressed layer on top; returns its digest.
    pub fn push_layer(&self, compressed: Vec<u8>) -> String {
        let digest = format!("sha256:{}", hex_digest(&compressed));
        if let Ok(mut blobs) = self.blobs.lock() {
            blobs.insert(digest.clone(), Arc::from(compressed));
        }
        if let Ok(mut order) = self.order.lock() {
            order.push(digest.clone());
        }
        digest
    }

    /// Number of `open_compressed`/`range_fetch` calls served so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// While offline every fetch fails with `SourceUnavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

impl LayerSource for MemoryLayerSource {
    fn layer_digests(&self) -> Result<Vec<String>> {
        self.order
            .lock()
            .map(|o| o.clone())
            .map_err(|_| Error::SourceUnavailable("layer list poisoned".to_string()))
    }

    fn open_compressed(&self, digest: &str) -> Result<Box<dyn Read + Send>> {
        self.range_fetch(digest, 0)
    }

    fn range_fetch(&self, digest: &str, offset: u64) -> Result<Box<dyn Read + Send>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::SourceUnavailable(format!("{}: source offline", digest)));
        }
        let blob = self
            .blobs
            .lock()
            .ok()
            .and_then(|b| b.get(digest).cloned())
            .ok_or_else(|| Error::SourceUnavailable(format!("{}: no such layer", digest)))?;
        let mut cursor = Cursor::new(blob);
        cursor.set_position(offset);
        Ok(Box::new(cursor))
    }

    fn location(&self) -> SourceLocation {
        SourceLocation {
            kind: StorageKind::Memory,
            registry: String::new(),
            repository: "memory".to_string(),
            reference: String::new(),
        }
    }
}
