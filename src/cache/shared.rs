//! Remote cache of decompressed layers shared between hosts.

use std::io;
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

use futures_util::stream::{self, Stream};
use reqwest::header::RANGE;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::error::{Error, Result};

pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Vec<u8>>> + Send + Sync>>;

const UPLOAD_CHUNK: usize = 256 * 1024;

/// A content-addressed store reachable by every host serving images.
///
/// Failures are reported as [`Error::CacheUnavailable`] and never fail a
/// read; the resolver moves on to the next tier.
#[async_trait::async_trait]
pub trait SharedCache: Send + Sync {
    /// `length` bytes at `offset` of the layer stored under `key`, or `None`
    /// on a miss.
    async fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>>;

    /// Upload a whole layer.
    async fn put_stream(&self, key: &str, body: ByteStream) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Stream a file in fixed-size chunks.
pub async fn file_stream(path: &Path) -> Result<ByteStream> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| Error::CacheUnavailable(format!("{}: {}", path.display(), e)))?;
    let chunks = stream::unfold(Some(file), |state| async move {
        let mut file = state?;
        let mut buf = vec![0u8; UPLOAD_CHUNK];
        match file.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(buf), Some(file)))
            }
            Err(e) => Some((Err(e), None)),
        }
    });
    Ok(Box::pin(chunks))
}

/// Shared cache over plain HTTP: `GET <base>/<key>` with a `Range` header and
/// `PUT <base>/<key>` with a streamed body.
pub struct HttpSharedCache {
    client: reqwest::Client,
    base_url: String,
    token: Option<SecretString>,
}

impl HttpSharedCache {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("shared cache client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    pub fn with_token(mut self, token: SecretString) -> Self {
        self.token = Some(token);
        self
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token.expose_secret()),
            None => req,
        }
    }
}

fn unavailable(e: impl std::fmt::Display) -> Error {
    Error::CacheUnavailable(e.to_string())
}

#[async_trait::async_trait]
impl SharedCache for HttpSharedCache {
    async fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        if length == 0 {
            return Ok(Some(Vec::new()));
        }
        let end = offset + length - 1;
        let resp = self
            .authorize(self.client.get(self.url(key)))
            .header(RANGE, format!("bytes={}-{}", offset, end))
            .send()
            .await
            .map_err(unavailable)?;

        match resp.status() {
            StatusCode::PARTIAL_CONTENT => {
                let body = resp.bytes().await.map_err(unavailable)?;
                Ok(Some(body.to_vec()))
            }
            StatusCode::OK => {
                // Server ignored the range.
                let body = resp.bytes().await.map_err(unavailable)?;
                let start = (offset as usize).min(body.len());
                let stop = (start + length as usize).min(body.len());
                Ok(Some(body[start..stop].to_vec()))
            }
            StatusCode::NOT_FOUND | StatusCode::RANGE_NOT_SATISFIABLE => {
                debug!(key, "shared cache miss");
                Ok(None)
            }
            status => Err(Error::CacheUnavailable(format!(
                "GET {}: {}",
                self.url(key),
                status
            ))),
        }
    }

    async fn put_stream(&self, key: &str, body: ByteStream) -> Result<()> {
        let resp = self
            .authorize(self.client.put(self.url(key)))
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await
            .map_err(unavailable)?;
        if !resp.status().is_success() {
            return Err(Error::CacheUnavailable(format!(
                "PUT {}: {}",
                self.url(key),
                resp.status()
            )));
        }
        debug!(key, "published layer to shared cache");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn range_hit_and_miss() {
        let server = MockServer::start_async().await;
        let hit = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/layers/abc")
                    .header("range", "bytes=2-5")
                    .header("authorization", "Bearer s3cret");
                then.status(206).body("2345");
            })
            .await;
        let miss = server
            .mock_async(|when, then| {
                when.method(GET).path("/layers/def");
                then.status(404);
            })
            .await;

        let cache = HttpSharedCache::new(server.url("/layers/"), Duration::from_secs(5))
            .unwrap()
            .with_token(SecretString::from("s3cret"));
        assert_eq!(cache.get_range("abc", 2, 4).await.unwrap(), Some(b"2345".to_vec()));
        assert_eq!(cache.get_range("def", 0, 4).await.unwrap(), None);
        hit.assert_async().await;
        miss.assert_async().await;
    }

    #[tokio::test]
    async fn full_body_is_sliced() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/abc");
                then.status(200).body("0123456789");
            })
            .await;
        let cache = HttpSharedCache::new(server.base_url(), Duration::from_secs(5)).unwrap();
        assert_eq!(cache.get_range("abc", 8, 4).await.unwrap(), Some(b"89".to_vec()));
    }

    #[tokio::test]
    async fn server_errors_are_cache_unavailable() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(PUT).path("/abc");
                then.status(500);
            })
            .await;
        let cache = HttpSharedCache::new(server.base_url(), Duration::from_secs(5)).unwrap();
        let body: ByteStream = Box::pin(stream::iter(vec![Ok(b"data".to_vec())]));
        assert!(matches!(
            cache.put_stream("abc", body).await,
            Err(Error::CacheUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn file_stream_yields_whole_file() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..UPLOAD_CHUNK * 2 + 17).map(|i| i as u8).collect();
        std::fs::write(tmp.path(), &data).unwrap();

        let chunks: Vec<_> = file_stream(tmp.path()).await.unwrap().collect().await;
        let joined: Vec<u8> = chunks.into_iter().flat_map(|c| c.unwrap()).collect();
        assert_eq!(joined, data);
    }
}
