//! Read-only view of a mounted image, the surface a filesystem layer uses.

use std::sync::Arc;

use crate::archive::ArchiveMetadata;
use crate::cache::CacheManager;
use crate::error::{Error, Result};
use crate::index::{Node, NodeKind};
use crate::resolver::{ResolverOptions, TieredContentResolver};
use crate::source::LayerSource;

pub struct ImageView {
    metadata: Arc<ArchiveMetadata>,
    resolver: TieredContentResolver,
}

impl ImageView {
    pub fn new(
        metadata: ArchiveMetadata,
        source: Arc<dyn LayerSource>,
        cache: Arc<CacheManager>,
        options: ResolverOptions,
    ) -> Self {
        let storage = Arc::new(metadata.storage.clone());
        Self {
            metadata: Arc::new(metadata),
            resolver: TieredContentResolver::new(storage, source, cache, options),
        }
    }

    pub fn metadata(&self) -> &ArchiveMetadata {
        &self.metadata
    }

    pub fn resolver(&self) -> &TieredContentResolver {
        &self.resolver
    }

    /// Look up a path. Symlinks are not followed.
    pub fn resolve(&self, path: &str) -> Result<&Node> {
        self.metadata.index.resolve(path)
    }

    /// Up to `length` bytes of `node` starting at `offset`.
    ///
    /// Reads are clipped to the node's size; symlinks yield their target.
    pub async fn read(&self, node: &Node, offset: u64, length: u64) -> Result<Vec<u8>> {
        let size = node.attr.size;
        if offset >= size {
            return Ok(Vec::new());
        }
        let length = length.min(size - offset);

        match (&node.kind, &node.remote) {
            (NodeKind::Symlink { target }, _) => {
                let bytes = target.as_bytes();
                let start = (offset as usize).min(bytes.len());
                let end = (start + length as usize).min(bytes.len());
                Ok(bytes[start..end].to_vec())
            }
            (NodeKind::Directory, _) => {
                Err(Error::NotFound(format!("{} is a directory", node.path)))
            }
            (_, Some(remote)) => {
                self.resolver
                    .read(&remote.layer_digest, remote.offset + offset, length)
                    .await
            }
            (_, None) => Err(Error::InvariantViolation(format!(
                "{} has no content reference",
                node.path
            ))),
        }
    }

    /// Read a whole file.
    pub async fn read_all(&self, path: &str) -> Result<Vec<u8>> {
        let node = self.resolve(path)?;
        self.read(node, 0, node.attr.size).await
    }

    /// Direct children of directory `dir`, in path order.
    pub fn list_children(&self, dir: &str) -> Result<Vec<&Node>> {
        let node = self.resolve(dir)?;
        if !node.is_dir() {
            return Err(Error::NotFound(format!("{} is not a directory", node.path)));
        }
        Ok(self.metadata.index.list_children(&node.path))
    }
}
