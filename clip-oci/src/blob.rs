//! Blocking readers over streamed registry blobs.
//!
//! Layer indexing and decompression are synchronous, CPU-bound passes that
//! run on blocking threads. [`BlobReader`] bridges them to the async HTTP
//! client: a pump task on the runtime forwards body chunks over a bounded
//! channel, and the reader pulls from that channel with `blocking_recv`.

use std::io::{self, Read};
use std::time::Duration;

use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::registry::{digest_hex, hex_encode, BlobResponse, ImageRef, RegistryClient};
use crate::OciError;

/// Chunks buffered between the pump task and the reader.
const CHANNEL_DEPTH: usize = 16;

/// Marker carried inside [`io::Error`]s that originate from the network
/// rather than from the bytes themselves.
#[derive(Debug, thiserror::Error)]
#[error("transport failure: {0}")]
pub struct TransportError(pub String);

/// Wrap `err` as an [`io::Error`] tagged with [`TransportError`].
pub fn transport_error(err: impl std::fmt::Display) -> io::Error {
    io::Error::other(TransportError(err.to_string()))
}

/// `true` when `err` was produced by [`transport_error`].
pub fn is_transport_error(err: &io::Error) -> bool {
    err.get_ref()
        .map(|inner| inner.is::<TransportError>())
        .unwrap_or(false)
}

/// Synchronous [`Read`] over a registry blob starting at some offset.
pub struct BlobReader {
    rx: mpsc::Receiver<io::Result<Vec<u8>>>,
    chunk: Vec<u8>,
    pos: usize,
    skip: u64,
    verify: Option<(Sha256, String)>,
    done: bool,
}

impl BlobReader {
    /// Open `digest` at `offset`.
    ///
    /// Must be called from a thread that is not driving `handle` (e.g. inside
    /// `spawn_blocking`). When `offset` is zero the full body is hashed and
    /// checked against `digest` once the stream ends.
    pub fn open(
        handle: &Handle,
        client: &RegistryClient,
        image_ref: &ImageRef,
        digest: &str,
        offset: u64,
        idle_timeout: Duration,
    ) -> io::Result<Self> {
        let opened = handle.block_on(async {
            tokio::time::timeout(idle_timeout, client.open_blob(image_ref, digest, offset)).await
        });
        let blob = match opened {
            Ok(Ok(blob)) => blob,
            Ok(Err(e)) => return Err(transport_error(e)),
            Err(_) => {
                return Err(transport_error(OciError::Timeout(format!(
                    "opening {} after {:?}",
                    digest, idle_timeout
                ))))
            }
        };

        let BlobResponse { response, skip } = blob;
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let label = digest.to_string();
        handle.spawn(async move {
            let mut stream = response.bytes_stream();
            loop {
                match tokio::time::timeout(idle_timeout, stream.next()).await {
                    Ok(Some(Ok(chunk))) => {
                        if tx.send(Ok(chunk.to_vec())).await.is_err() {
                            debug!(digest = %label, "blob reader dropped, stopping pump");
                            break;
                        }
                    }
                    Ok(Some(Err(e))) => {
                        warn!(digest = %label, error = %e, "blob stream failed");
                        let _ = tx.send(Err(transport_error(e))).await;
                        break;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        warn!(digest = %label, "blob stream stalled");
                        let _ = tx
                            .send(Err(transport_error(OciError::Timeout(format!(
                                "no data from {} for {:?}",
                                label, idle_timeout
                            )))))
                            .await;
                        break;
                    }
                }
            }
        });

        let verify = (offset == 0 && digest.starts_with("sha256:"))
            .then(|| (Sha256::new(), digest_hex(digest).to_string()));

        Ok(Self {
            rx,
            chunk: Vec::new(),
            pos: 0,
            skip,
            verify,
            done: false,
        })
    }

    /// Pull the next chunk, applying skip and hashing. `Ok(false)` at EOF.
    fn refill(&mut self) -> io::Result<bool> {
        loop {
            match self.rx.blocking_recv() {
                Some(Ok(chunk)) => {
                    if let Some((ref mut hasher, _)) = self.verify {
                        hasher.update(&chunk);
                    }
                    let start = usize::try_from(self.skip).unwrap_or(usize::MAX).min(chunk.len());
                    self.skip -= start as u64;
                    if start == chunk.len() {
                        continue;
                    }
                    self.chunk = chunk;
                    self.pos = start;
                    return Ok(true);
                }
                Some(Err(e)) => return Err(e),
                None => {
                    if self.skip > 0 {
                        return Err(transport_error(format!(
                            "blob ended {} bytes before the requested offset",
                            self.skip
                        )));
                    }
                    if let Some((hasher, expected)) = self.verify.take() {
                        let actual = hex_encode(&hasher.finalize());
                        if actual != expected {
                            return Err(transport_error(OciError::DigestMismatch {
                                expected,
                                actual,
                            }));
                        }
                    }
                    return Ok(false);
                }
            }
        }
    }
}

impl Read for BlobReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.done {
            return Ok(0);
        }
        if self.pos >= self.chunk.len() && !self.refill()? {
            self.done = true;
            return Ok(0);
        }
        let n = buf.len().min(self.chunk.len() - self.pos);
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
