//! Serves decompressed byte ranges of layers through the cache tiers.
//!
//! Lookup order is the local disk cache, then the shared cache, then the
//! origin. An origin fetch materializes the whole layer on disk (once per
//! layer, however many readers ask) and hands a copy to the shared cache in
//! the background.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use flate2::read::MultiGzDecoder;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use clip_oci::is_transport_error;

use crate::archive::StorageDescriptor;
use crate::cache::{file_stream, CacheManager, Committed, Populated};
use crate::error::{Error, Result};
use crate::gzip;
use crate::source::LayerSource;

const COPY_CHUNK: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct ResolverOptions {
    /// Serve origin reads straight from checkpoints instead of caching the
    /// whole layer first.
    pub checkpoint_reads: bool,
    /// Upper bound for shared cache requests.
    pub fetch_timeout: Duration,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            checkpoint_reads: false,
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
pub struct TieredContentResolver {
    storage: Arc<StorageDescriptor>,
    source: Arc<dyn LayerSource>,
    cache: Arc<CacheManager>,
    options: ResolverOptions,
}

enum Fetched {
    Committed(Committed),
    Captured(RangeCapture),
}

/// Collects the bytes of one range out of a sequential stream.
struct RangeCapture {
    start: u64,
    end: u64,
    bytes: Vec<u8>,
}

impl RangeCapture {
    fn new(offset: u64, length: u64) -> Self {
        Self {
            start: offset,
            end: offset.saturating_add(length),
            bytes: Vec::new(),
        }
    }

    /// Keep the part of `chunk`, found at stream position `pos`, that falls
    /// inside the range.
    fn offer(&mut self, pos: u64, chunk: &[u8]) {
        let from = self.start.max(pos);
        let to = self.end.min(pos + chunk.len() as u64);
        if from < to {
            self.bytes
                .extend_from_slice(&chunk[(from - pos) as usize..(to - pos) as usize]);
        }
    }

    fn is_complete(&self) -> bool {
        self.bytes.len() as u64 == self.end - self.start
    }
}

fn origin_error(digest: &str, offset: u64, e: io::Error) -> Error {
    if is_transport_error(&e) {
        Error::SourceUnavailable(format!("{}: {}", digest, e))
    } else {
        Error::malformed(digest, offset, e.to_string())
    }
}

fn join_error(e: tokio::task::JoinError) -> Error {
    Error::Io(io::Error::other(e.to_string()))
}

impl TieredContentResolver {
    pub fn new(
        storage: Arc<StorageDescriptor>,
        source: Arc<dyn LayerSource>,
        cache: Arc<CacheManager>,
        options: ResolverOptions,
    ) -> Self {
        Self {
            storage,
            source,
            cache,
            options,
        }
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    /// `length` decompressed bytes at `offset` of layer `digest`. The result
    /// is short only when the range runs past the end of the layer.
    pub async fn read(&self, digest: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let table = self.storage.layer(digest)?;
        let length = length.min(table.uncompressed_size.saturating_sub(offset));
        if length == 0 {
            return Ok(Vec::new());
        }
        let key = table.cache_key();

        match self.cache.disk().read_range(&key, offset, length).await {
            Ok(Some(bytes)) => {
                debug!(digest, offset, length, tier = "disk", "read");
                return Ok(bytes);
            }
            Ok(None) => {}
            Err(e) => warn!(digest, error = %e, "disk cache read failed"),
        }

        if let Some(shared) = self.cache.shared() {
            let lookup = timeout(self.options.fetch_timeout, shared.get_range(&key, offset, length));
            match lookup.await {
                Ok(Ok(Some(bytes))) if bytes.len() as u64 == length => {
                    debug!(digest, offset, length, tier = shared.name(), "read");
                    return Ok(bytes);
                }
                Ok(Ok(Some(bytes))) => {
                    warn!(digest, got = bytes.len(), want = length, "short shared cache read");
                }
                Ok(Ok(None)) => debug!(digest, "shared cache miss"),
                Ok(Err(e)) => warn!(digest, error = %e, "shared cache read failed"),
                Err(_) => warn!(digest, "shared cache read timed out"),
            }
        }

        if self.options.checkpoint_reads {
            return self.checkpoint_read(digest, offset, length).await;
        }

        let populated = match self.populate(digest, &key, offset, length).await {
            Ok(populated) => populated,
            Err(Error::CacheUnavailable(reason)) => {
                warn!(digest, %reason, "could not cache layer, reading from checkpoints");
                return self.checkpoint_read(digest, offset, length).await;
            }
            Err(e) => return Err(e),
        };
        if let Some(bytes) = populated.captured(offset, length) {
            debug!(digest, offset, length, tier = "origin", "read");
            return Ok(bytes);
        }
        let path = match &*populated {
            Populated::Cached(path) => path,
            // Joined another reader's fetch for a different range.
            Populated::Uncached { .. } => return self.checkpoint_read(digest, offset, length).await,
        };
        match self.cache.disk().read_range(&key, offset, length).await {
            Ok(Some(bytes)) => Ok(bytes),
            Ok(None) => {
                warn!(digest, path = %path.display(), "cached layer vanished, reading from checkpoints");
                self.checkpoint_read(digest, offset, length).await
            }
            Err(e) => {
                warn!(digest, error = %e, "disk cache read failed, reading from checkpoints");
                self.checkpoint_read(digest, offset, length).await
            }
        }
    }

    /// Materialize `digest` in the disk cache, coalescing with any populate
    /// of the same layer already running.
    ///
    /// The fetch runs as its own task, so it completes for the remaining
    /// readers even if the reader that started it goes away.
    async fn populate(
        &self,
        digest: &str,
        key: &str,
        offset: u64,
        length: u64,
    ) -> Result<Arc<Populated>> {
        let this = self.clone();
        let layer = digest.to_string();
        let cache_key = key.to_string();
        self.cache
            .flights()
            .execute(key.to_string(), move || async move {
                this.fill(&layer, &cache_key, offset, length).await
            })
            .await
            .map_err(Error::from_shared)
    }

    /// Stream the layer from the origin into the disk cache. Bytes inside
    /// `offset..offset + length` are also kept aside so the read can still be
    /// answered from this one fetch when the disk tier fails.
    async fn fill(&self, digest: &str, key: &str, offset: u64, length: u64) -> Result<Populated> {
        // Another mount may have finished it while we waited.
        let disk = self.cache.disk().clone();
        if disk.contains(key) {
            return Ok(Populated::Cached(disk.layer_path(key)));
        }

        let source = Arc::clone(&self.source);
        let storage = Arc::clone(&self.storage);
        let layer = digest.to_string();
        let cache_key = key.to_string();
        info!(digest, key, "fetching layer from origin");

        let fetched = tokio::task::spawn_blocking(move || -> Result<Fetched> {
            let table = storage.layer(&layer)?;
            let mut capture = RangeCapture::new(offset, length);
            let mut writer = match disk.writer(&cache_key) {
                Ok(w) => Some(w),
                Err(e) => {
                    warn!(digest = %layer, error = %e, "disk cache unavailable, streaming the read");
                    None
                }
            };
            let mut decoder = MultiGzDecoder::new(source.open_compressed(&layer)?);
            let mut buf = vec![0u8; COPY_CHUNK];
            let mut pos = 0u64;
            while writer.is_some() || !capture.is_complete() {
                let n = match decoder.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(origin_error(&layer, pos, e)),
                };
                capture.offer(pos, &buf[..n]);
                pos += n as u64;
                if let Some(w) = writer.as_mut() {
                    if let Err(e) = w.write_all(&buf[..n]) {
                        warn!(digest = %layer, error = %e, "disk cache write failed, streaming the read");
                        writer = None;
                    }
                }
            }
            match writer {
                Some(w) => match w.commit(&layer, table.content_hash.as_deref()) {
                    Ok(committed) => Ok(Fetched::Committed(committed)),
                    Err(Error::CacheUnavailable(reason)) => {
                        warn!(digest = %layer, %reason, "could not commit cached layer");
                        Ok(Fetched::Captured(capture))
                    }
                    Err(e) => Err(e),
                },
                None => Ok(Fetched::Captured(capture)),
            }
        })
        .await
        .map_err(join_error)??;

        match fetched {
            Fetched::Committed(committed) => {
                info!(digest, size = committed.size, path = %committed.path.display(), "layer cached");
                self.publish(key, committed.path.clone());
                Ok(Populated::Cached(committed.path))
            }
            Fetched::Captured(capture) => Ok(Populated::Uncached {
                offset: capture.start,
                bytes: capture.bytes,
            }),
        }
    }

    /// Upload a freshly cached layer to the shared tier without waiting.
    fn publish(&self, key: &str, path: PathBuf) {
        let Some(shared) = self.cache.shared().cloned() else {
            return;
        };
        let key = key.to_string();
        tokio::spawn(async move {
            let body = match file_stream(&path).await {
                Ok(body) => body,
                Err(e) => {
                    warn!(key, error = %e, "could not open cached layer for publishing");
                    return;
                }
            };
            match shared.put_stream(&key, body).await {
                Ok(()) => debug!(key, cache = shared.name(), "layer published"),
                Err(e) => warn!(key, error = %e, "publishing layer to shared cache failed"),
            }
        });
    }

    /// Decode the range from the nearest checkpoint at or before `offset`.
    pub async fn checkpoint_read(&self, digest: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let source = Arc::clone(&self.source);
        let storage = Arc::clone(&self.storage);
        let layer = digest.to_string();

        tokio::task::spawn_blocking(move || {
            let table = storage.layer(&layer)?;
            let cp = table.locate(offset);
            debug!(
                digest = %layer,
                offset,
                checkpoint = cp.uncompressed_offset,
                replay = offset - cp.uncompressed_offset,
                "checkpointed read",
            );
            let input = source.range_fetch(&layer, cp.compressed_offset)?;
            gzip::read_at(input, &cp, offset, length as usize)
                .map_err(|e| origin_error(&layer, offset, e))
        })
        .await
        .map_err(join_error)?
    }
}
