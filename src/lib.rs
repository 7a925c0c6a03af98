//! clip: lazy, index-backed access to OCI container images
//!
//! An image is indexed once: its gzip tar layers are streamed bottom to top,
//! merged into a single path index, and sampled for decompression
//! checkpoints. The result is a small artifact with no file content in it.
//! Mounting the artifact gives an [`ImageView`] whose reads pull only the
//! layers they touch, through a disk cache, an optional shared cache and
//! finally the registry.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use clip::{ArchiveMetadata, CacheManager, DiskCache, ImageView, IndexOptions, ResolverOptions};
//! use clip::source::{LayerSource, RegistryLayerSource};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = clip_oci::OciClient::new(Arc::new(clip_oci::auth::Anonymous))?;
//!     let source: Arc<dyn LayerSource> = Arc::new(
//!         RegistryLayerSource::resolve(&client, "alpine:3.19", Duration::from_secs(30)).await?,
//!     );
//!
//!     let meta = clip::index_image(Arc::clone(&source), IndexOptions::default()).await?;
//!     meta.write_to("alpine.clip".as_ref())?;
//!
//!     let cache = Arc::new(CacheManager::new(DiskCache::new("/var/cache/clip")));
//!     let view = ImageView::new(meta, source, cache, ResolverOptions::default());
//!     let release = view.read_all("/etc/alpine-release").await?;
//!     println!("{}", String::from_utf8_lossy(&release));
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod gzip;
pub mod index;
pub mod indexer;
pub mod resolver;
pub mod source;
pub mod view;

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::info;

pub use archive::{ArchiveMetadata, ImageMetadata, StorageDescriptor, StorageKind};
pub use cache::{CacheManager, DiskCache, HttpSharedCache, SharedCache};
pub use checkpoint::{GzipCheckpoint, LayerCheckpointIndex};
pub use config::ClipConfig;
pub use error::{Error, Result};
pub use index::{Attr, Node, NodeKind, PathIndex, RemoteRef, Timestamp};
pub use indexer::{IndexOptions, IndexProgress, IndexedImage, ProgressStage, TarLayerIndexer};
pub use resolver::{ResolverOptions, TieredContentResolver};
pub use source::{LayerSource, MemoryLayerSource, OciLayoutSource, RegistryLayerSource};
pub use view::ImageView;

/// Index every layer of `source` and package the result.
///
/// Blocking: the layers are downloaded and decompressed on this thread.
pub fn index_source(source: &dyn LayerSource, options: IndexOptions) -> Result<ArchiveMetadata> {
    let indexed = TarLayerIndexer::new(options).index_source(source)?;
    let location = source.location();

    let storage = StorageDescriptor {
        kind: location.kind,
        registry: location.registry,
        repository: location.repository,
        reference: location.reference,
        layers: indexed.layers.iter().map(|l| l.layer_digest.clone()).collect(),
        checkpoints: indexed
            .layers
            .into_iter()
            .map(|l| (l.layer_digest.clone(), l))
            .collect(),
        image: source.image_metadata(),
    };
    let meta = ArchiveMetadata {
        index: indexed.index,
        storage,
    };
    meta.validate()?;
    info!(
        nodes = meta.index.len(),
        layers = meta.storage.layers.len(),
        "image indexed"
    );
    Ok(meta)
}

/// [`index_source`] on a blocking thread.
pub async fn index_image(source: Arc<dyn LayerSource>, options: IndexOptions) -> Result<ArchiveMetadata> {
    tokio::task::spawn_blocking(move || index_source(source.as_ref(), options))
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?
}

/// Reopen the origin recorded in an artifact.
///
/// Registry sources need a running tokio runtime and a client; in-memory
/// sources cannot be reopened.
pub fn open_source(
    storage: &StorageDescriptor,
    registry: Option<Arc<clip_oci::RegistryClient>>,
    idle_timeout: Duration,
) -> Result<Arc<dyn LayerSource>> {
    match storage.kind {
        StorageKind::Oci => {
            let handle = Handle::try_current()
                .map_err(|e| Error::Config(format!("registry source needs a runtime: {}", e)))?;
            let client = match registry {
                Some(c) => c,
                None => Arc::new(clip_oci::RegistryClient::new()?),
            };
            Ok(Arc::new(RegistryLayerSource::from_descriptor(
                client,
                storage,
                handle,
                idle_timeout,
            )))
        }
        StorageKind::OciLayout => Ok(Arc::new(OciLayoutSource::from_descriptor(storage))),
        StorageKind::Memory => Err(Error::Config(
            "artifact was built from an in-memory source and cannot be reopened".to_string(),
        )),
    }
}
