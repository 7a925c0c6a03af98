//! Per-layer checkpoint tables for random-access decompression.

use serde::{Deserialize, Serialize};

/// Default uncompressed distance between checkpoints.
pub const DEFAULT_CHECKPOINT_INTERVAL: u64 = 2 * 1024 * 1024;

/// Files larger than this get a checkpoint right before their body.
pub const DEFAULT_LARGE_FILE_THRESHOLD: u64 = 512 * 1024;

/// A place in a gzip stream where decoding can resume.
///
/// `compressed_offset` is the byte holding the first unread bit; `bits` is
/// how many high bits of that byte are still unread (0 means the checkpoint
/// is byte aligned). `window` is the tail of the output preceding the
/// checkpoint, at most 32 KiB, needed to resolve back-references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GzipCheckpoint {
    pub compressed_offset: u64,
    pub uncompressed_offset: u64,
    pub bits: u8,
    pub window: Vec<u8>,
}

impl GzipCheckpoint {
    /// The implicit checkpoint at the very start of the stream.
    pub fn stream_start() -> Self {
        Self {
            compressed_offset: 0,
            uncompressed_offset: 0,
            bits: 0,
            window: Vec::new(),
        }
    }

    pub fn is_stream_start(&self) -> bool {
        self.compressed_offset == 0 && self.uncompressed_offset == 0
    }
}

/// Checkpoints and content metadata for a single layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerCheckpointIndex {
    pub layer_digest: String,
    /// Ordered by both offsets, ascending.
    pub checkpoints: Vec<GzipCheckpoint>,
    /// Hex SHA-256 of the whole decompressed layer (the OCI diff-id).
    pub content_hash: Option<String>,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
}

impl LayerCheckpointIndex {
    pub fn new(layer_digest: impl Into<String>) -> Self {
        Self {
            layer_digest: layer_digest.into(),
            checkpoints: Vec::new(),
            content_hash: None,
            compressed_size: 0,
            uncompressed_size: 0,
        }
    }

    /// Append a checkpoint, ignoring ones that would not move forward.
    pub fn push(&mut self, cp: GzipCheckpoint) -> bool {
        if let Some(last) = self.checkpoints.last() {
            if cp.uncompressed_offset <= last.uncompressed_offset
                || cp.compressed_offset < last.compressed_offset
            {
                return false;
            }
        }
        self.checkpoints.push(cp);
        true
    }

    /// The checkpoint with the largest uncompressed offset not past `target`.
    pub fn locate(&self, target: u64) -> GzipCheckpoint {
        let idx = self
            .checkpoints
            .partition_point(|cp| cp.uncompressed_offset <= target);
        match idx {
            0 => GzipCheckpoint::stream_start(),
            i => self.checkpoints[i - 1].clone(),
        }
    }

    /// Both offset sequences are non-decreasing.
    pub fn is_monotonic(&self) -> bool {
        self.checkpoints.windows(2).all(|w| {
            w[0].compressed_offset <= w[1].compressed_offset
                && w[0].uncompressed_offset <= w[1].uncompressed_offset
        })
    }

    /// Cache key: the content hash, or the digest's hex when it is unknown.
    pub fn cache_key(&self) -> String {
        match &self.content_hash {
            Some(hash) => hash.clone(),
            None => clip_oci::registry::digest_hex(&self.layer_digest).to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cp(c: u64, u: u64) -> GzipCheckpoint {
        GzipCheckpoint {
            compressed_offset: c,
            uncompressed_offset: u,
            bits: 0,
            window: Vec::new(),
        }
    }

    #[test]
    fn locate_picks_largest_not_after_target() {
        let mut idx = LayerCheckpointIndex::new("sha256:aa");
        idx.push(cp(100, 1000));
        idx.push(cp(200, 2000));
        idx.push(cp(300, 3000));

        assert!(idx.locate(999).is_stream_start());
        assert_eq!(idx.locate(1000).uncompressed_offset, 1000);
        assert_eq!(idx.locate(2999).uncompressed_offset, 2000);
        assert_eq!(idx.locate(u64::MAX).uncompressed_offset, 3000);
    }

    #[test]
    fn locate_on_empty_table_is_stream_start() {
        let idx = LayerCheckpointIndex::new("sha256:aa");
        assert!(idx.locate(12345).is_stream_start());
    }

    #[test]
    fn push_rejects_backwards_checkpoints() {
        let mut idx = LayerCheckpointIndex::new("sha256:aa");
        assert!(idx.push(cp(10, 100)));
        assert!(!idx.push(cp(10, 100)));
        assert!(!idx.push(cp(5, 200)));
        assert!(idx.push(cp(10, 200)));
        assert!(idx.is_monotonic());
    }

    #[test]
    fn cache_key_prefers_content_hash() {
        let mut idx = LayerCheckpointIndex::new("sha256:abc");
        assert_eq!(idx.cache_key(), "abc");
        idx.content_hash = Some("def".into());
        assert_eq!(idx.cache_key(), "def");
    }
}
