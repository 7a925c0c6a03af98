//! Cache tiers for decompressed layer content.

pub mod disk;
pub mod shared;
pub mod singleflight;

use std::path::PathBuf;
use std::sync::Arc;

pub use disk::{Committed, DiskCache, LayerWriter};
pub use shared::{file_stream, ByteStream, HttpSharedCache, SharedCache};
pub use singleflight::SingleFlight;

/// Outcome of one origin fetch of a layer.
#[derive(Debug)]
pub(crate) enum Populated {
    /// The layer is on disk at this path.
    Cached(PathBuf),
    /// The disk tier refused the layer; only the range requested by the
    /// reader that started the fetch was kept.
    Uncached { offset: u64, bytes: Vec<u8> },
}

impl Populated {
    /// `length` bytes at `offset` if the captured range covers them.
    pub(crate) fn captured(&self, offset: u64, length: u64) -> Option<Vec<u8>> {
        let Populated::Uncached { offset: start, bytes } = self else {
            return None;
        };
        let from = offset.checked_sub(*start)? as usize;
        let to = from.checked_add(length as usize)?;
        bytes.get(from..to).map(<[u8]>::to_vec)
    }
}

/// Everything one mount needs to cache layer content: the local disk tier,
/// an optional shared tier and the per-layer populate coalescing.
///
/// Mounts that point at the same directory share cached layers; in-flight
/// populates are coalesced only within one manager.
pub struct CacheManager {
    disk: DiskCache,
    shared: Option<Arc<dyn SharedCache>>,
    flights: SingleFlight<String, Populated>,
}

impl CacheManager {
    pub fn new(disk: DiskCache) -> Self {
        Self {
            disk,
            shared: None,
            flights: SingleFlight::new(),
        }
    }

    pub fn with_shared(mut self, shared: Arc<dyn SharedCache>) -> Self {
        self.shared = Some(shared);
        self
    }

    pub fn disk(&self) -> &DiskCache {
        &self.disk
    }

    pub fn shared(&self) -> Option<&Arc<dyn SharedCache>> {
        self.shared.as_ref()
    }

    pub(crate) fn flights(&self) -> &SingleFlight<String, Populated> {
        &self.flights
    }
}
