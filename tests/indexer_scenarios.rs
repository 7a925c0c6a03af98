//! Layer merging, whiteouts and checkpoint placement, driven through
//! in-memory layers.
//!
//! ```bash
//! cargo test --test indexer_scenarios
//! ```

#[path = "common/fixtures.rs"]
mod fixtures;

use std::sync::Arc;

use sha2::{Digest, Sha256};

use clip::gzip;
use clip::index::{S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};
use clip::{
    ArchiveMetadata, CacheManager, DiskCache, Error, ImageView, IndexOptions, IndexProgress,
    LayerSource, MemoryLayerSource, NodeKind, ProgressStage, ResolverOptions, StorageKind,
};
use fixtures::{gzip as gz, noise, LayerBuilder};

const MIB: u64 = 1024 * 1024;

fn index(source: &MemoryLayerSource) -> ArchiveMetadata {
    clip::index_source(source, IndexOptions::default()).unwrap()
}

fn mount(meta: ArchiveMetadata, source: Arc<MemoryLayerSource>, cache_dir: &std::path::Path) -> ImageView {
    let cache = Arc::new(CacheManager::new(DiskCache::new(cache_dir)));
    ImageView::new(meta, source, cache, ResolverOptions::default())
}

// ──────────────────────────────────────────────────────────────────────────────
// Merging
// ──────────────────────────────────────────────────────────────────────────────

/// Scenario A: the same path in layers 0 and 2 resolves to layer 2.
#[tokio::test]
async fn uppermost_layer_wins() {
    let source = Arc::new(MemoryLayerSource::from_layers(vec![
        LayerBuilder::new().file("app/config.txt", b"host=localhost").gzip(),
        LayerBuilder::new().file("app/readme", b"docs").gzip(),
        LayerBuilder::new().file("app/config.txt", b"host=prod.com").gzip(),
    ]));
    let digests = source.layer_digests().unwrap();
    let meta = index(&source);

    let node = meta.index.resolve("/app/config.txt").unwrap();
    assert_eq!(node.remote.as_ref().unwrap().layer_digest, digests[2]);
    assert_eq!(node.attr.size, 13);

    let tmp = tempfile::tempdir().unwrap();
    let view = mount(meta, source, tmp.path());
    assert_eq!(view.read_all("/app/config.txt").await.unwrap(), b"host=prod.com");
    assert_eq!(view.read_all("app/readme").await.unwrap(), b"docs");
}

/// Scenario B: a whiteout in layer 1 deletes a layer-0 file.
#[test]
fn whiteout_deletes_lower_file() {
    let source = MemoryLayerSource::from_layers(vec![
        LayerBuilder::new()
            .file("app/secret.txt", b"hunter2")
            .file("app/keep.txt", b"ok")
            .gzip(),
        LayerBuilder::new().whiteout("app/secret.txt").gzip(),
    ]);
    let meta = index(&source);

    assert!(matches!(
        meta.index.resolve("/app/secret.txt"),
        Err(Error::NotFound(_))
    ));
    assert!(meta.index.resolve("/app/keep.txt").is_ok());
    assert!(!meta.index.iter().any(|n| n.path.contains(".wh.")));
}

#[test]
fn whiteout_of_directory_removes_subtree() {
    let source = MemoryLayerSource::from_layers(vec![
        LayerBuilder::new()
            .file("var/cache/apk/a", b"1")
            .file("var/cache/apk/b", b"2")
            .file("var/log/x", b"3")
            .gzip(),
        LayerBuilder::new().whiteout("var/cache").gzip(),
    ]);
    let meta = index(&source);

    assert!(!meta.index.contains("/var/cache"));
    assert!(!meta.index.contains("/var/cache/apk/a"));
    assert!(meta.index.contains("/var/log/x"));
    meta.index.validate().unwrap();
}

#[test]
fn opaque_whiteout_hides_only_lower_layers() {
    let source = MemoryLayerSource::from_layers(vec![
        LayerBuilder::new()
            .file("etc/a.conf", b"a")
            .file("etc/sub/b.conf", b"b")
            .file("etcetera", b"neighbour")
            .gzip(),
        LayerBuilder::new()
            .file("etc/before.conf", b"c")
            .opaque("etc")
            .file("etc/after.conf", b"d")
            .gzip(),
    ]);
    let meta = index(&source);

    assert!(meta.index.resolve("/etc").unwrap().is_dir());
    let children: Vec<&str> = meta
        .index
        .list_children("/etc")
        .iter()
        .map(|n| n.path.as_str())
        .collect();
    assert_eq!(children, vec!["/etc/after.conf", "/etc/before.conf"]);
    assert!(meta.index.contains("/etcetera"));
}

#[test]
fn missing_parents_are_synthesized() {
    let source = MemoryLayerSource::from_layers(vec![LayerBuilder::new()
        .file("usr/share/doc/pkg/README", b"hi")
        .gzip()]);
    let meta = index(&source);

    for dir in ["/", "/usr", "/usr/share", "/usr/share/doc", "/usr/share/doc/pkg"] {
        let node = meta.index.resolve(dir).unwrap();
        assert_eq!(node.attr.mode & S_IFMT, S_IFDIR, "{dir}");
        assert!(node.attr.nlink >= 2);
    }
    meta.index.validate().unwrap();
}

#[test]
fn runtime_directories_are_never_indexed() {
    let source = MemoryLayerSource::from_layers(vec![LayerBuilder::new()
        .file("proc/cpuinfo", b"cpu")
        .dir("sys/kernel")
        .char_device("dev/null")
        .dir("dev")
        .file("devices/list", b"kept")
        .file("usr/dev/x", b"kept")
        .gzip()]);
    let meta = index(&source);

    for gone in ["/proc", "/proc/cpuinfo", "/sys", "/sys/kernel", "/dev", "/dev/null"] {
        assert!(!meta.index.contains(gone), "{gone} should be excluded");
    }
    assert!(meta.index.contains("/devices/list"));
    assert!(meta.index.contains("/usr/dev/x"));
}

#[test]
fn file_replacing_directory_drops_its_subtree() {
    let source = MemoryLayerSource::from_layers(vec![
        LayerBuilder::new().file("opt/tool/bin/run", b"#!/bin/sh").gzip(),
        LayerBuilder::new().file("opt/tool", b"now a file").gzip(),
    ]);
    let meta = index(&source);

    let node = meta.index.resolve("/opt/tool").unwrap();
    assert_eq!(node.kind, NodeKind::File);
    assert!(!meta.index.contains("/opt/tool/bin"));
    assert!(!meta.index.contains("/opt/tool/bin/run"));
}

#[tokio::test]
async fn links_share_content() {
    let source = Arc::new(MemoryLayerSource::from_layers(vec![LayerBuilder::new()
        .file_mode("bin/busybox", b"ELF busybox", 0o755)
        .symlink("bin/sh", "busybox")
        .hardlink("bin/ls", "bin/busybox")
        .gzip()]));
    let meta = index(&source);

    let busybox = meta.index.resolve("/bin/busybox").unwrap().clone();
    let ls = meta.index.resolve("/bin/ls").unwrap().clone();
    let sh = meta.index.resolve("/bin/sh").unwrap().clone();

    assert_eq!(ls.remote, busybox.remote);
    assert_eq!(ls.attr.nlink, 2);
    assert_eq!(busybox.attr.nlink, 2);
    assert_eq!(ls.attr.mode, S_IFREG | 0o755);
    assert_eq!(
        sh.kind,
        NodeKind::Symlink {
            target: "busybox".to_string()
        }
    );
    assert_eq!(sh.attr.mode & S_IFMT, S_IFLNK);
    assert_eq!(sh.attr.size, 7);
    assert!(sh.remote.is_none());

    let tmp = tempfile::tempdir().unwrap();
    let view = mount(meta, source, tmp.path());
    assert_eq!(view.read_all("/bin/ls").await.unwrap(), b"ELF busybox");
    assert_eq!(view.read_all("/bin/sh").await.unwrap(), b"busybox");
}

#[test]
fn hard_link_survives_whiteout_of_target() {
    let source = MemoryLayerSource::from_layers(vec![
        LayerBuilder::new()
            .file("lib/libc.so", b"libc")
            .hardlink("lib/libc.so.6", "lib/libc.so")
            .gzip(),
        LayerBuilder::new().whiteout("lib/libc.so").gzip(),
    ]);
    let meta = index(&source);

    assert!(!meta.index.contains("/lib/libc.so"));
    let link = meta.index.resolve("/lib/libc.so.6").unwrap();
    assert_eq!(link.remote.as_ref().unwrap().length, 4);
}

#[test]
fn dangling_hard_link_is_skipped() {
    let source = MemoryLayerSource::from_layers(vec![LayerBuilder::new()
        .hardlink("a/link", "a/missing")
        .file("a/real", b"x")
        .gzip()]);
    let meta = index(&source);
    assert!(!meta.index.contains("/a/link"));
    assert!(meta.index.contains("/a/real"));
}

#[test]
fn long_names_survive() {
    let deep = format!("srv/{}/{}.txt", "d".repeat(90), "f".repeat(80));
    let source = MemoryLayerSource::from_layers(vec![LayerBuilder::new()
        .file(&deep, b"long")
        .gzip()]);
    let meta = index(&source);
    assert_eq!(meta.index.resolve(&deep).unwrap().attr.size, 4);
}

// ──────────────────────────────────────────────────────────────────────────────
// Layer metadata and checkpoints
// ──────────────────────────────────────────────────────────────────────────────

#[test]
fn layer_tables_record_sizes_and_content_hash() {
    let tar = LayerBuilder::new()
        .file("a", b"alpha")
        .file("b", &noise(100_000, 3))
        .tar();
    let compressed = gz(&tar);
    let source = MemoryLayerSource::from_layers(vec![compressed.clone()]);
    let meta = index(&source);

    let digest = &meta.storage.layers[0];
    let table = meta.storage.layer(digest).unwrap();
    let expected: String = Sha256::digest(&tar).iter().map(|b| format!("{b:02x}")).collect();
    assert_eq!(table.content_hash.as_deref(), Some(expected.as_str()));
    assert_eq!(table.uncompressed_size, tar.len() as u64);
    assert_eq!(table.compressed_size, compressed.len() as u64);
    assert_eq!(table.cache_key(), expected);
    assert_eq!(meta.storage.kind, StorageKind::Memory);
}

/// Scenario C: a 10 MiB layer with a 2 MiB interval.
#[tokio::test]
async fn checkpoints_bound_replay() {
    let body = noise(10 * MIB as usize, 11);
    let tar = LayerBuilder::new().file("blob.bin", &body).tar();
    let source = Arc::new(MemoryLayerSource::from_layers(vec![gz(&tar)]));
    let meta = index(&source);

    let digest = meta.storage.layers[0].clone();
    let table = meta.storage.layer(&digest).unwrap().clone();
    let n = table.checkpoints.len();
    assert!((4..=6).contains(&n), "got {n} checkpoints");
    assert!(table.is_monotonic());
    for pair in table.checkpoints.windows(2) {
        assert!(pair[1].uncompressed_offset - pair[0].uncompressed_offset <= 2 * MIB);
    }

    let target = 9 * MIB;
    let cp = table.locate(target);
    assert!(target - cp.uncompressed_offset <= 2 * MIB);

    let tmp = tempfile::tempdir().unwrap();
    let view = mount(meta, Arc::clone(&source), tmp.path());
    let got = view
        .resolver()
        .checkpoint_read(&digest, target, 4096)
        .await
        .unwrap();
    assert_eq!(got, &tar[target as usize..target as usize + 4096]);

    // Through the file node: the body starts after one 512-byte header.
    let node = view.resolve("/blob.bin").unwrap();
    assert_eq!(node.remote.as_ref().unwrap().offset, 512);
}

/// Uncompressed offsets where deflate blocks start, plus the end of stream.
fn block_starts(layer: &[u8]) -> Vec<u64> {
    use std::io::Read;

    let progress = gzip::DecodeProgress::new();
    let mut decoder = gzip::GzipDecoder::new(layer).track(progress.clone());
    let mut starts = vec![0];
    let mut buf = [0u8; 512];
    loop {
        let n = decoder.read(&mut buf).unwrap();
        if let Some(b) = progress.boundary_offset() {
            if b > *starts.last().unwrap() {
                starts.push(b);
            }
        }
        if n == 0 {
            break;
        }
    }
    starts.push(progress.total_out());
    starts
}

#[tokio::test]
async fn compressible_layers_bound_replay_by_block_length() {
    let body: Vec<u8> = (0..10 * MIB).map(|i| (i % 7) as u8).collect();
    let tar = LayerBuilder::new().file("pattern.bin", &body).tar();
    let layer = gz(&tar);
    let starts = block_starts(&layer);
    let longest = starts.windows(2).map(|w| w[1] - w[0]).max().unwrap();

    let source = Arc::new(MemoryLayerSource::from_layers(vec![layer]));
    let meta = index(&source);
    let digest = meta.storage.layers[0].clone();
    let table = meta.storage.layer(&digest).unwrap().clone();
    let interval = IndexOptions::default().checkpoint_interval;
    let bound = interval.max(longest);

    assert!(table.checkpoints.iter().any(|cp| !cp.is_stream_start()));
    let size = tar.len() as u64;
    let targets = (0..size).step_by(256 * 1024).chain([size - 1]);
    for target in targets {
        let replay = target - table.locate(target).uncompressed_offset;
        assert!(replay <= bound, "replay {replay} at {target} exceeds {bound}");
    }

    let target = 9 * MIB;
    let tmp = tempfile::tempdir().unwrap();
    let view = mount(meta, Arc::clone(&source), tmp.path());
    let got = view
        .resolver()
        .checkpoint_read(&digest, target, 4096)
        .await
        .unwrap();
    assert_eq!(got, &tar[target as usize..target as usize + 4096]);
}

#[test]
fn large_files_get_a_checkpoint_before_their_body() {
    let tar = LayerBuilder::new()
        .file("small", &noise(300 * 1024, 5))
        .file("big", &noise(700 * 1024, 6))
        .tar();
    let source = MemoryLayerSource::from_layers(vec![gz(&tar)]);
    let meta = index(&source);

    let big = meta.index.resolve("/big").unwrap();
    let start = big.remote.as_ref().unwrap().offset;
    let table = meta.storage.layer(&meta.storage.layers[0]).unwrap();
    let cp = table.locate(start);
    // Without the forced checkpoint the nearest one would be the stream start.
    assert!(!cp.is_stream_start());
    assert!(start - cp.uncompressed_offset <= 128 * 1024);
}

#[test]
fn every_checkpoint_resumes_to_the_same_bytes() {
    let mut builder = LayerBuilder::new();
    for i in 0..40 {
        let text = format!("line {i} of a fairly repetitive config file\n").repeat(400 + i * 37);
        builder = builder.file(&format!("etc/conf.d/{i:02}.conf"), text.as_bytes());
        builder = builder.file(&format!("var/lib/{i:02}.bin"), &noise(20_000 + i * 911, i as u64));
    }
    let tar = builder.tar();
    let compressed = gz(&tar);
    let source = MemoryLayerSource::from_layers(vec![compressed.clone()]);
    let options = IndexOptions {
        checkpoint_interval: 64 * 1024,
        ..IndexOptions::default()
    };
    let meta = clip::index_source(&source, options).unwrap();
    let table = meta.storage.layer(&meta.storage.layers[0]).unwrap();
    assert!(table.checkpoints.len() > 5);

    for cp in &table.checkpoints {
        let start = cp.uncompressed_offset as usize;
        let len = 1000.min(tar.len() - start);
        let input = &compressed[cp.compressed_offset as usize..];
        let got = gzip::read_at(input, cp, cp.uncompressed_offset, len).unwrap();
        assert_eq!(got, &tar[start..start + len]);
    }

    // Every file reads back identically from its nearest checkpoint.
    for node in meta.index.iter().filter(|n| n.kind == NodeKind::File) {
        let remote = node.remote.as_ref().unwrap();
        let cp = table.locate(remote.offset);
        let input = &compressed[cp.compressed_offset as usize..];
        let got = gzip::read_at(input, &cp, remote.offset, remote.length as usize).unwrap();
        let (s, e) = (remote.offset as usize, (remote.offset + remote.length) as usize);
        assert_eq!(got, &tar[s..e], "{}", node.path);
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Failures and progress
// ──────────────────────────────────────────────────────────────────────────────

#[test]
fn truncated_layer_is_malformed() {
    let compressed = LayerBuilder::new().file("x", &noise(200_000, 9)).gzip();
    let cut = compressed[..compressed.len() / 2].to_vec();
    let source = MemoryLayerSource::from_layers(vec![cut]);
    let err = clip::index_source(&source, IndexOptions::default()).unwrap_err();
    assert!(matches!(err, Error::MalformedInput { .. }), "{err}");
}

#[test]
fn non_gzip_layer_is_malformed() {
    let source = MemoryLayerSource::from_layers(vec![b"definitely not gzip".to_vec()]);
    let err = clip::index_source(&source, IndexOptions::default()).unwrap_err();
    match err {
        Error::MalformedInput { layer, offset, .. } => {
            assert!(layer.starts_with("sha256:"));
            assert_eq!(offset, 0);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn offline_source_is_unavailable() {
    let source = MemoryLayerSource::from_layers(vec![LayerBuilder::new().file("a", b"a").gzip()]);
    source.set_offline(true);
    let err = clip::index_source(&source, IndexOptions::default()).unwrap_err();
    assert!(matches!(err, Error::SourceUnavailable(_)));
}

#[test]
fn progress_reports_each_layer() {
    let source = MemoryLayerSource::from_layers(vec![
        LayerBuilder::new().file("a", b"a").file("b", b"b").gzip(),
        LayerBuilder::new().file("c", b"c").gzip(),
    ]);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<IndexProgress>();
    let options = IndexOptions {
        progress: Some(tx),
        ..IndexOptions::default()
    };
    clip::index_source(&source, options).unwrap();

    let mut events = Vec::new();
    while let Ok(e) = rx.try_recv() {
        events.push((e.layer_index, e.stage, e.entries, e.total_layers));
    }
    assert_eq!(
        events,
        vec![
            (0, ProgressStage::Starting, 0, 2),
            (0, ProgressStage::Completed, 2, 2),
            (1, ProgressStage::Starting, 0, 2),
            (1, ProgressStage::Completed, 1, 2),
        ]
    );
}

#[test]
fn artifact_survives_a_round_trip() {
    let source = MemoryLayerSource::from_layers(vec![
        LayerBuilder::new().file("etc/os-release", b"ID=test").gzip(),
        LayerBuilder::new().symlink("etc/issue", "os-release").gzip(),
    ]);
    let meta = index(&source);

    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("image.clip");
    meta.write_to(&path).unwrap();
    let loaded = ArchiveMetadata::load(&path).unwrap();
    assert_eq!(loaded, meta);
}
