//! Index and read an image served by a mock OCI distribution registry.
//!
//! ```bash
//! cargo test --test registry_indexing
//! ```

#[path = "common/fixtures.rs"]
mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;
use serde_json::json;

use clip::source::RegistryLayerSource;
use clip::{
    ArchiveMetadata, CacheManager, DiskCache, Error, ImageView, IndexOptions, ResolverOptions,
    StorageKind,
};
use clip_oci::auth::Anonymous;
use clip_oci::registry::hex_digest;
use clip_oci::OciClient;
use fixtures::{noise, LayerBuilder};

const TIMEOUT: Duration = Duration::from_secs(10);

struct Image {
    reference: String,
    layers: Vec<(String, Vec<u8>)>,
}

fn digest(data: &[u8]) -> String {
    format!("sha256:{}", hex_digest(data))
}

/// Serve a two-layer image as `127.0.0.1:<port>/library/demo:v1`.
async fn serve_image(server: &MockServer) -> Image {
    let layers: Vec<Vec<u8>> = vec![
        LayerBuilder::new()
            .file("bin/tool", &noise(600_000, 3))
            .file("etc/motd", b"welcome\n")
            .gzip(),
        LayerBuilder::new()
            .file("etc/motd", b"hello from the top layer\n")
            .symlink("usr/bin/tool", "/bin/tool")
            .gzip(),
    ];

    let config = serde_json::to_vec(&json!({
        "architecture": "amd64",
        "os": "linux",
        "config": {
            "Env": ["PATH=/usr/bin:/bin"],
            "Cmd": ["/bin/tool"],
            "WorkingDir": "/srv",
            "Labels": {"org.example.tier": "demo"}
        },
        "rootfs": {"type": "layers", "diff_ids": []}
    }))
    .unwrap();
    let config_digest = digest(&config);

    let layer_descriptors: Vec<_> = layers
        .iter()
        .map(|l| {
            json!({
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": digest(l),
                "size": l.len(),
            })
        })
        .collect();
    let manifest = json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": config_digest,
            "size": config.len(),
        },
        "layers": layer_descriptors,
    });

    server
        .mock_async(|when, then| {
            when.method(GET).path("/v2/library/demo/manifests/v1");
            then.status(200)
                .header("content-type", "application/vnd.oci.image.manifest.v1+json")
                .json_body(manifest);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path(format!("/v2/library/demo/blobs/{}", config_digest));
            then.status(200).body(config.clone());
        })
        .await;

    let mut served = Vec::new();
    for layer in layers {
        let d = digest(&layer);
        let body = layer.clone();
        server
            .mock_async(|when, then| {
                when.method(GET).path(format!("/v2/library/demo/blobs/{}", d));
                then.status(200).body(body);
            })
            .await;
        served.push((d, layer));
    }

    Image {
        reference: format!("127.0.0.1:{}/library/demo:v1", server.port()),
        layers: served,
    }
}

async fn index_from_registry(image: &Image) -> ArchiveMetadata {
    let client = OciClient::new(Arc::new(Anonymous)).unwrap();
    let source = RegistryLayerSource::resolve(&client, &image.reference, TIMEOUT)
        .await
        .unwrap();
    clip::index_image(Arc::new(source), IndexOptions::default())
        .await
        .unwrap()
}

fn mount(meta: ArchiveMetadata, cache_dir: &std::path::Path, options: ResolverOptions) -> ImageView {
    let source = clip::open_source(&meta.storage, None, TIMEOUT).unwrap();
    let cache = Arc::new(CacheManager::new(DiskCache::new(cache_dir)));
    ImageView::new(meta, source, cache, options)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn registry_image_indexes_and_records_its_origin() {
    let server = MockServer::start_async().await;
    let image = serve_image(&server).await;
    let meta = index_from_registry(&image).await;

    let storage = &meta.storage;
    assert_eq!(storage.kind, StorageKind::Oci);
    assert_eq!(storage.registry, format!("127.0.0.1:{}", server.port()));
    assert_eq!(storage.repository, "library/demo");
    assert_eq!(storage.reference, "v1");
    let digests: Vec<String> = image.layers.iter().map(|(d, _)| d.clone()).collect();
    assert_eq!(storage.layers, digests);

    for (d, blob) in &image.layers {
        let table = storage.layer(d).unwrap();
        assert_eq!(table.compressed_size, blob.len() as u64);
        assert!(table.content_hash.is_some());
    }

    let metadata = storage.image.as_ref().unwrap();
    assert_eq!(metadata.os, "linux");
    assert_eq!(metadata.architecture, "amd64");
    assert_eq!(metadata.cmd, vec!["/bin/tool".to_string()]);
    assert_eq!(metadata.working_dir.as_deref(), Some("/srv"));
    assert_eq!(metadata.labels.get("org.example.tier").map(String::as_str), Some("demo"));

    let motd = meta.index.resolve("/etc/motd").unwrap();
    assert_eq!(motd.remote.as_ref().unwrap().layer_digest, digests[1]);

    // The artifact survives a trip through its binary encoding.
    let decoded = ArchiveMetadata::from_bytes(&meta.to_bytes().unwrap()).unwrap();
    assert_eq!(decoded, meta);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reopened_registry_source_serves_reads() {
    let server = MockServer::start_async().await;
    let image = serve_image(&server).await;
    let meta = index_from_registry(&image).await;

    let tmp = tempfile::tempdir().unwrap();
    let view = mount(meta.clone(), tmp.path(), ResolverOptions::default());
    assert_eq!(
        view.read_all("/etc/motd").await.unwrap(),
        b"hello from the top layer\n"
    );
    assert_eq!(view.read_all("/bin/tool").await.unwrap(), noise(600_000, 3));
    assert_eq!(view.read_all("/usr/bin/tool").await.unwrap(), b"/bin/tool");

    let lazy = tempfile::tempdir().unwrap();
    let view = mount(
        meta,
        lazy.path(),
        ResolverOptions {
            checkpoint_reads: true,
            ..ResolverOptions::default()
        },
    );
    let node = view.resolve("/bin/tool").unwrap().clone();
    let tail = view.read(&node, 500_000, 100_000).await.unwrap();
    assert_eq!(tail, noise(600_000, 3)[500_000..].to_vec());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_blob_is_a_source_failure() {
    let server = MockServer::start_async().await;
    let image = serve_image(&server).await;
    let meta = index_from_registry(&image).await;

    // Point the artifact at a registry that no longer has the blobs.
    let top = image.layers[1].0.clone();
    let empty = MockServer::start_async().await;
    let gone = empty
        .mock_async(|when, then| {
            when.method(GET).path(format!("/v2/library/demo/blobs/{}", top));
            then.status(404);
        })
        .await;
    let mut moved = meta;
    moved.storage.registry = format!("127.0.0.1:{}", empty.port());

    let tmp = tempfile::tempdir().unwrap();
    let view = mount(moved, tmp.path(), ResolverOptions::default());
    let err = view.read_all("/etc/motd").await.unwrap_err();
    assert!(matches!(err, Error::SourceUnavailable(_)), "{err}");
    gone.assert_hits_async(1).await;
}
