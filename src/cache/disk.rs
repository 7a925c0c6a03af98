use std::io::{self, SeekFrom, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

use clip_oci::registry::hex_encode;

use crate::error::{Error, Result};

/// Decompressed layers stored under `<cache_dir>/layers/<key>`.
///
/// Entries appear atomically: a writer fills a temp file in the same
/// directory and renames it into place once the content hash checks out.
#[derive(Debug, Clone)]
pub struct DiskCache {
    cache_dir: PathBuf,
}

impl DiskCache {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    fn layers_dir(&self) -> PathBuf {
        self.cache_dir.join("layers")
    }

    /// Keys are hex digests; anything else could escape the cache directory.
    fn check_key(key: &str) -> Result<()> {
        if key.is_empty() || !key.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(Error::CacheUnavailable(format!("invalid cache key {:?}", key)));
        }
        Ok(())
    }

    pub fn layer_path(&self, key: &str) -> PathBuf {
        self.layers_dir().join(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        Self::check_key(key).is_ok() && self.layer_path(key).is_file()
    }

    /// Read up to `length` bytes at `offset` of a cached layer.
    ///
    /// `Ok(None)` is a miss. Reads past the end come back short.
    pub async fn read_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        Self::check_key(key)?;
        let path = self.layer_path(key);
        let mut file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(cache_io(&path, e)),
        };
        let size = file.metadata().await.map_err(|e| cache_io(&path, e))?.len();
        if offset >= size || length == 0 {
            return Ok(Some(Vec::new()));
        }
        let want = length.min(size - offset) as usize;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| cache_io(&path, e))?;
        let mut buf = vec![0u8; want];
        file.read_exact(&mut buf).await.map_err(|e| cache_io(&path, e))?;
        Ok(Some(buf))
    }

    /// Start writing a new entry for `key`.
    pub fn writer(&self, key: &str) -> Result<LayerWriter> {
        Self::check_key(key)?;
        let dir = self.layers_dir();
        std::fs::create_dir_all(&dir).map_err(|e| cache_io(&dir, e))?;
        let tmp = tempfile::Builder::new()
            .prefix(".partial-")
            .tempfile_in(&dir)
            .map_err(|e| cache_io(&dir, e))?;
        Ok(LayerWriter {
            tmp,
            target: self.layer_path(key),
            hasher: Sha256::new(),
            written: 0,
        })
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        Self::check_key(key)?;
        let path = self.layer_path(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(cache_io(&path, e)),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

fn cache_io(path: &Path, e: io::Error) -> Error {
    Error::CacheUnavailable(format!("{}: {}", path.display(), e))
}

/// An in-progress cache entry. Dropping it without [`commit`](Self::commit)
/// deletes the temp file.
pub struct LayerWriter {
    tmp: tempfile::NamedTempFile,
    target: PathBuf,
    hasher: Sha256,
    written: u64,
}

/// A layer renamed into place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    pub path: PathBuf,
    pub size: u64,
    pub hash: String,
}

impl LayerWriter {
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Hex SHA-256 of what has been written so far.
    pub fn current_hash(&self) -> String {
        hex_encode(&self.hasher.clone().finalize())
    }

    /// Flush, fsync and rename into place.
    ///
    /// With `expected` set, a hash mismatch discards the entry and reports
    /// the layer as malformed.
    pub fn commit(mut self, layer: &str, expected: Option<&str>) -> Result<Committed> {
        let hash = self.current_hash();
        if let Some(expected) = expected {
            if hash != expected {
                return Err(Error::malformed(
                    layer,
                    self.written,
                    format!("decompressed content hash {} does not match {}", hash, expected),
                ));
            }
        }
        let target = self.target.clone();
        self.tmp.flush().map_err(|e| cache_io(&target, e))?;
        self.tmp.as_file().sync_all().map_err(|e| cache_io(&target, e))?;
        self.tmp
            .persist(&target)
            .map_err(|e| cache_io(&target, e.error))?;
        debug!(path = %self.target.display(), size = self.written, "cached layer");
        Ok(Committed {
            path: self.target,
            size: self.written,
            hash,
        })
    }
}

impl Write for LayerWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.tmp.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.tmp.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(data: &[u8]) -> String {
        hex_encode(&Sha256::digest(data))
    }

    #[test]
    fn layer_path_structure() {
        let cache = DiskCache::new("/tmp/clip-cache");
        assert_eq!(
            cache.layer_path("deadbeef"),
            PathBuf::from("/tmp/clip-cache/layers/deadbeef")
        );
    }

    #[test]
    fn rejects_keys_that_escape() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(tmp.path());
        assert!(matches!(cache.writer("../x"), Err(Error::CacheUnavailable(_))));
        assert!(!cache.contains(""));
    }

    #[tokio::test]
    async fn commit_then_read_ranges() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(tmp.path());
        let data = b"0123456789abcdef";

        assert_eq!(cache.read_range("cafe", 0, 4).await.unwrap(), None);

        let mut w = cache.writer("cafe").unwrap();
        w.write_all(data).unwrap();
        let committed = w.commit("sha256:cafe", Some(&hash(data))).unwrap();
        assert_eq!(committed.size, 16);
        assert!(cache.contains("cafe"));

        assert_eq!(cache.read_range("cafe", 4, 4).await.unwrap().unwrap(), b"4567");
        assert_eq!(cache.read_range("cafe", 12, 100).await.unwrap().unwrap(), b"cdef");
        assert!(cache.read_range("cafe", 16, 1).await.unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn hash_mismatch_leaves_nothing_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(tmp.path());

        let mut w = cache.writer("beef").unwrap();
        w.write_all(b"corrupted").unwrap();
        let err = w.commit("sha256:beef", Some(&hash(b"original"))).unwrap_err();
        assert!(matches!(err, Error::MalformedInput { .. }));
        assert!(!cache.contains("beef"));

        let leftovers = std::fs::read_dir(tmp.path().join("layers")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn recommit_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(tmp.path());
        for _ in 0..2 {
            let mut w = cache.writer("abcd").unwrap();
            w.write_all(b"same bytes").unwrap();
            w.commit("sha256:abcd", None).unwrap();
        }
        assert_eq!(
            cache.read_range("abcd", 0, 64).await.unwrap().unwrap(),
            b"same bytes"
        );
        cache.remove("abcd").await.unwrap();
        assert!(!cache.contains("abcd"));
    }
}
