//! Streaming indexer for gzip-compressed tar layers.
//!
//! Layers are applied bottom to top onto one [`PathIndex`]. While a layer is
//! decoded, the decoder's block boundaries are sampled into a checkpoint
//! table so later reads can start decompression close to any file.

use std::cell::Cell;
use std::collections::HashSet;
use std::io::{self, Read};
use std::rc::Rc;

use sha2::{Digest, Sha256};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use clip_oci::is_transport_error;
use clip_oci::registry::hex_encode;

use crate::checkpoint::{
    LayerCheckpointIndex, DEFAULT_CHECKPOINT_INTERVAL, DEFAULT_LARGE_FILE_THRESHOLD,
};
use crate::error::{Error, Result};
use crate::gzip::{DecodeProgress, GzipDecoder};
use crate::index::path::{self, is_within};
use crate::index::{Attr, Node, NodeKind, PathIndex, RemoteRef, Timestamp, S_IFDIR, S_IFLNK, S_IFREG};
use crate::source::LayerSource;

/// Runtime directories never taken from image layers.
pub const RESERVED_DIRS: [&str; 3] = ["/proc", "/sys", "/dev"];

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";
const SKIP_CHUNK: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Options and progress
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// Uncompressed bytes between checkpoints.
    pub checkpoint_interval: u64,
    /// Regular files above this size get a checkpoint before their body.
    pub large_file_threshold: u64,
    pub progress: Option<UnboundedSender<IndexProgress>>,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            large_file_threshold: DEFAULT_LARGE_FILE_THRESHOLD,
            progress: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStage {
    Starting,
    Completed,
}

/// Emitted when a layer starts and finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexProgress {
    pub layer_index: usize,
    pub total_layers: usize,
    pub digest: String,
    pub stage: ProgressStage,
    /// Tar entries seen so far in this layer.
    pub entries: u64,
}

/// Output of a full indexing pass.
#[derive(Debug, Clone)]
pub struct IndexedImage {
    pub index: PathIndex,
    /// One table per layer, bottom first.
    pub layers: Vec<LayerCheckpointIndex>,
}

// ---------------------------------------------------------------------------
// Entry classification
// ---------------------------------------------------------------------------

/// What a tar entry means for the merged tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryClass {
    File,
    Directory,
    Symlink { target: String },
    HardLink { target: String },
    /// `.wh.<name>`: delete `<dir>/<name>` from lower layers.
    Whiteout { victim: String },
    /// `.wh..wh..opq`: hide everything lower layers put in `dir`.
    OpaqueWhiteout { dir: String },
    Unsupported(tar::EntryType),
}

/// Classify an entry at the normalized `path`.
pub fn classify_entry(
    path: &str,
    raw_path: &[u8],
    entry_type: tar::EntryType,
    link: Option<&[u8]>,
) -> EntryClass {
    let name = path::file_name(path);
    let dir = path::parent(path).unwrap_or("/");
    if name == OPAQUE_WHITEOUT {
        return EntryClass::OpaqueWhiteout {
            dir: dir.to_string(),
        };
    }
    if let Some(victim) = name.strip_prefix(WHITEOUT_PREFIX) {
        if !victim.is_empty() {
            return EntryClass::Whiteout {
                victim: path::join(dir, victim),
            };
        }
    }

    let link_target = || String::from_utf8_lossy(link.unwrap_or_default()).into_owned();
    match entry_type {
        tar::EntryType::Directory => EntryClass::Directory,
        tar::EntryType::Regular | tar::EntryType::Continuous if raw_path.ends_with(b"/") => {
            EntryClass::Directory
        }
        tar::EntryType::Regular | tar::EntryType::Continuous => EntryClass::File,
        tar::EntryType::Symlink => EntryClass::Symlink {
            target: link_target(),
        },
        tar::EntryType::Link => EntryClass::HardLink {
            target: path::normalize(&link_target()),
        },
        other => EntryClass::Unsupported(other),
    }
}

fn is_reserved(path: &str) -> bool {
    RESERVED_DIRS.iter().any(|dir| is_within(path, dir))
}

// ---------------------------------------------------------------------------
// Stream adapters
// ---------------------------------------------------------------------------

/// Remembers whether the compressed source itself failed.
struct SourceGuard {
    inner: Box<dyn Read + Send>,
    failed: Rc<Cell<bool>>,
}

impl Read for SourceGuard {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).inspect_err(|e| {
            if e.kind() != io::ErrorKind::Interrupted {
                self.failed.set(true);
            }
        })
    }
}

/// SHA-256 over everything read through it.
struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    count: u64,
}

impl<R: Read> HashingReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            count: 0,
        }
    }

    fn finish(self) -> (String, u64) {
        (hex_encode(&self.hasher.finalize()), self.count)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }
}

// ---------------------------------------------------------------------------
// Indexer
// ---------------------------------------------------------------------------

/// Builds the merged index and per-layer checkpoint tables.
pub struct TarLayerIndexer {
    options: IndexOptions,
}

/// Per-layer bookkeeping.
struct LayerPass<'a> {
    digest: &'a str,
    options: &'a IndexOptions,
    progress: Rc<DecodeProgress>,
    table: LayerCheckpointIndex,
    last_checkpoint: u64,
    /// Paths this layer created or touched, with their ancestors. Whiteouts
    /// in this layer never remove them.
    touched: HashSet<String>,
    entries: u64,
}

impl LayerPass<'_> {
    fn touch(&mut self, path: &str) {
        let mut cur = Some(path);
        while let Some(p) = cur {
            if !self.touched.insert(p.to_string()) {
                break;
            }
            cur = path::parent(p);
        }
    }

    /// Record the latest block boundary if enough output has gone by, or
    /// unconditionally (`force`) when a large body is about to start.
    ///
    /// Only block boundaries can be recorded, so the gap between checkpoints
    /// is at most the interval or the longest deflate block, whichever is
    /// larger.
    fn maybe_checkpoint(&mut self, force: bool) {
        let Some(boundary) = self.progress.boundary_offset() else {
            return;
        };
        if boundary <= self.last_checkpoint {
            return;
        }
        // Output grows by at most one chunk between calls; triggering a chunk
        // early keeps consecutive checkpoints within the interval.
        let produced = self.progress.total_out() - self.last_checkpoint + SKIP_CHUNK as u64;
        if !force && produced < self.options.checkpoint_interval {
            return;
        }
        if let Some(cp) = self.progress.boundary() {
            debug!(
                layer = self.digest,
                compressed = cp.compressed_offset,
                uncompressed = cp.uncompressed_offset,
                force,
                "checkpoint",
            );
            if self.table.push(cp) {
                self.last_checkpoint = boundary;
            }
        }
    }
}

impl TarLayerIndexer {
    pub fn new(options: IndexOptions) -> Self {
        Self { options }
    }

    /// Index every layer of `source`, bottom first.
    ///
    /// Any malformed or unreadable layer aborts the whole pass.
    pub fn index_source(&self, source: &dyn LayerSource) -> Result<IndexedImage> {
        let digests = source.layer_digests()?;
        let mut index = PathIndex::with_root(Attr::synthesized_dir(Timestamp::default()));
        let mut layers = Vec::with_capacity(digests.len());

        for (i, digest) in digests.iter().enumerate() {
            self.emit(i, digests.len(), digest, ProgressStage::Starting, 0);
            info!(layer = i, total = digests.len(), digest = %digest, "indexing layer");
            let reader = source.open_compressed(digest)?;
            let (table, entries) = self.index_layer(&mut index, digest, reader)?;
            info!(
                layer = i,
                digest = %digest,
                entries,
                checkpoints = table.checkpoints.len(),
                compressed = table.compressed_size,
                uncompressed = table.uncompressed_size,
                "layer indexed",
            );
            self.emit(i, digests.len(), digest, ProgressStage::Completed, entries);
            layers.push(table);
        }

        Ok(IndexedImage { index, layers })
    }

    fn emit(&self, layer_index: usize, total: usize, digest: &str, stage: ProgressStage, entries: u64) {
        if let Some(tx) = &self.options.progress {
            // The receiver may be gone; progress is advisory.
            let _ = tx.send(IndexProgress {
                layer_index,
                total_layers: total,
                digest: digest.to_string(),
                stage,
                entries,
            });
        }
    }

    /// Apply one compressed layer to `index`.
    pub fn index_layer(
        &self,
        index: &mut PathIndex,
        digest: &str,
        reader: Box<dyn Read + Send>,
    ) -> Result<(LayerCheckpointIndex, u64)> {
        let failed = Rc::new(Cell::new(false));
        let progress = DecodeProgress::new();
        let guard = SourceGuard {
            inner: reader,
            failed: Rc::clone(&failed),
        };
        let decoder = GzipDecoder::new(guard).track(Rc::clone(&progress));
        let mut archive = tar::Archive::new(HashingReader::new(decoder));

        let mut pass = LayerPass {
            digest,
            options: &self.options,
            progress: Rc::clone(&progress),
            table: LayerCheckpointIndex::new(digest),
            last_checkpoint: 0,
            touched: HashSet::new(),
            entries: 0,
        };

        let fail = |e: io::Error| -> Error {
            if failed.get() || is_transport_error(&e) {
                Error::SourceUnavailable(format!("{}: {}", digest, e))
            } else {
                Error::malformed(digest, progress.total_out(), e.to_string())
            }
        };

        for entry in archive.entries().map_err(fail)? {
            let mut entry = entry.map_err(fail)?;
            pass.entries += 1;
            apply_entry(index, &mut pass, &mut entry).map_err(|e| match e {
                Error::Io(io) => fail(io),
                other => other,
            })?;
        }

        // Trailing tar padding and the gzip trailer still count toward the
        // content hash and must verify.
        let mut rest = archive.into_inner();
        io::copy(&mut rest, &mut io::sink()).map_err(fail)?;
        let (hash, total) = rest.finish();

        let mut table = pass.table;
        table.content_hash = Some(hash);
        table.uncompressed_size = total;
        table.compressed_size = progress.compressed_in();
        Ok((table, pass.entries))
    }
}

// ---------------------------------------------------------------------------
// Entry handling
// ---------------------------------------------------------------------------

fn parse_pax_time(raw: &str) -> Option<Timestamp> {
    let (secs, frac) = match raw.split_once('.') {
        Some((s, f)) => (s, f),
        None => (raw, ""),
    };
    let secs: i64 = secs.parse().ok()?;
    let digits: String = frac.chars().take(9).collect();
    let nanos = if digits.is_empty() {
        0
    } else {
        format!("{:0<9}", digits).parse().ok()?
    };
    Some(Timestamp::new(secs, nanos))
}

/// Permission bits, owner and times of an entry (PAX values win).
fn entry_attr<R: Read>(entry: &mut tar::Entry<'_, R>, file_type: u32, size: u64) -> io::Result<Attr> {
    let header = entry.header();
    let mut uid = header.uid()? as u32;
    let mut gid = header.gid()? as u32;
    let mut mtime = Timestamp::new(header.mtime()? as i64, 0);
    let mode = header.mode()? & 0o7777;
    let mut atime = None;
    let mut ctime = None;

    if let Some(pax) = entry.pax_extensions()? {
        for ext in pax {
            let ext = ext?;
            let (Ok(key), Ok(value)) = (ext.key(), ext.value()) else {
                continue;
            };
            match key {
                "mtime" => mtime = parse_pax_time(value).unwrap_or(mtime),
                "atime" => atime = parse_pax_time(value),
                "ctime" => ctime = parse_pax_time(value),
                "uid" => uid = value.parse().unwrap_or(uid),
                "gid" => gid = value.parse().unwrap_or(gid),
                _ => {}
            }
        }
    }

    Ok(Attr {
        mode: file_type | mode,
        uid,
        gid,
        size,
        atime: atime.unwrap_or(mtime),
        mtime,
        ctime: ctime.unwrap_or(mtime),
        nlink: if file_type == S_IFDIR { 2 } else { 1 },
    })
}

fn apply_entry<R: Read>(
    index: &mut PathIndex,
    pass: &mut LayerPass<'_>,
    entry: &mut tar::Entry<'_, R>,
) -> Result<()> {
    let raw_path = entry.path_bytes().into_owned();
    let path = match std::str::from_utf8(&raw_path) {
        Ok(p) => path::normalize(p),
        Err(_) => {
            let lossy = String::from_utf8_lossy(&raw_path).into_owned();
            warn!(layer = pass.digest, path = %lossy, "non UTF-8 path, using lossy name");
            path::normalize(&lossy)
        }
    };
    let link = entry.link_name_bytes().map(|l| l.into_owned());
    let class = classify_entry(&path, &raw_path, entry.header().entry_type(), link.as_deref());

    if is_reserved(&path) {
        debug!(layer = pass.digest, %path, "skipping runtime directory entry");
        return Ok(());
    }

    match class {
        EntryClass::Whiteout { victim } => {
            if is_reserved(&victim) {
                return Ok(());
            }
            let removed = index.remove_subtree(&victim, Some(&pass.touched));
            debug!(layer = pass.digest, %victim, removed, "whiteout");
        }
        EntryClass::OpaqueWhiteout { dir } => {
            let template = Attr::synthesized_dir(Timestamp::new(entry.header().mtime()? as i64, 0));
            for created in index.ensure_ancestors(&path, &template) {
                pass.touch(&created);
            }
            let removed = index.remove_descendants(&dir, Some(&pass.touched));
            pass.touch(&dir);
            debug!(layer = pass.digest, %dir, removed, "opaque whiteout");
        }
        EntryClass::Directory => {
            let attr = entry_attr(entry, S_IFDIR, 0)?;
            ensure_parents(index, pass, &path, &attr);
            if path == "/" {
                if let Some(root) = index.get_mut("/") {
                    root.attr = attr;
                }
            } else {
                index.insert(Node::directory(path.clone(), attr));
            }
            pass.touch(&path);
        }
        EntryClass::Symlink { target } => {
            let attr = entry_attr(entry, S_IFLNK, target.len() as u64)?;
            ensure_parents(index, pass, &path, &attr);
            index.insert(Node {
                path: path.clone(),
                kind: NodeKind::Symlink { target },
                attr,
                remote: None,
            });
            pass.touch(&path);
        }
        EntryClass::HardLink { target } => {
            let Some(target_node) = index.get_mut(&target).filter(|n| n.has_content()) else {
                warn!(layer = pass.digest, %path, %target, "hard link target missing, skipping");
                return Ok(());
            };
            target_node.attr.nlink += 1;
            let attr = target_node.attr.clone();
            let remote = target_node.remote.clone();
            ensure_parents(index, pass, &path, &attr);
            index.insert(Node {
                path: path.clone(),
                kind: NodeKind::HardLink { target },
                attr,
                remote,
            });
            pass.touch(&path);
        }
        EntryClass::File => {
            let size = entry.size();
            let offset = entry.raw_file_position();
            let attr = entry_attr(entry, S_IFREG, size)?;
            ensure_parents(index, pass, &path, &attr);

            pass.maybe_checkpoint(size > pass.options.large_file_threshold);
            skip_body(pass, entry, size, offset)?;

            index.insert(Node {
                path: path.clone(),
                kind: NodeKind::File,
                attr,
                remote: Some(RemoteRef {
                    layer_digest: pass.digest.to_string(),
                    offset,
                    length: size,
                }),
            });
            pass.touch(&path);
        }
        EntryClass::Unsupported(kind) => {
            debug!(layer = pass.digest, %path, ?kind, "skipping unsupported entry");
        }
    }
    Ok(())
}

fn ensure_parents(index: &mut PathIndex, pass: &mut LayerPass<'_>, path: &str, attr: &Attr) {
    let template = Attr::synthesized_dir(attr.mtime);
    let template = Attr {
        atime: attr.atime,
        ctime: attr.ctime,
        ..template
    };
    for created in index.ensure_ancestors(path, &template) {
        pass.touch(&created);
    }
}

/// Consume exactly `size` body bytes, checkpointing along the way.
fn skip_body<R: Read>(
    pass: &mut LayerPass<'_>,
    entry: &mut tar::Entry<'_, R>,
    size: u64,
    offset: u64,
) -> Result<()> {
    let mut buf = vec![0u8; SKIP_CHUNK.min(size as usize)];
    let mut remaining = size;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = entry.read(&mut buf[..want])?;
        if n == 0 {
            return Err(Error::malformed(
                pass.digest,
                offset + (size - remaining),
                format!("file body ends {} bytes early", remaining),
            ));
        }
        remaining -= n as u64;
        pass.maybe_checkpoint(false);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tar::EntryType;

    #[test]
    fn classifies_whiteouts_before_types() {
        assert_eq!(
            classify_entry("/app/.wh.secret.txt", b"app/.wh.secret.txt", EntryType::Regular, None),
            EntryClass::Whiteout {
                victim: "/app/secret.txt".into()
            }
        );
        assert_eq!(
            classify_entry("/app/.wh..wh..opq", b"app/.wh..wh..opq", EntryType::Regular, None),
            EntryClass::OpaqueWhiteout { dir: "/app".into() }
        );
        assert_eq!(
            classify_entry("/.wh.top", b".wh.top", EntryType::Regular, None),
            EntryClass::Whiteout {
                victim: "/top".into()
            }
        );
    }

    #[test]
    fn classifies_types() {
        assert_eq!(
            classify_entry("/etc", b"etc/", EntryType::Regular, None),
            EntryClass::Directory
        );
        assert_eq!(
            classify_entry("/bin/sh", b"bin/sh", EntryType::Symlink, Some(b"busybox")),
            EntryClass::Symlink {
                target: "busybox".into()
            }
        );
        assert_eq!(
            classify_entry("/bin/ls", b"bin/ls", EntryType::Link, Some(b"./bin/busybox")),
            EntryClass::HardLink {
                target: "/bin/busybox".into()
            }
        );
        assert_eq!(
            classify_entry("/dev/null", b"dev/null", EntryType::Char, None),
            EntryClass::Unsupported(EntryType::Char)
        );
    }

    #[test]
    fn reserved_dirs_match_subtrees_only() {
        assert!(is_reserved("/proc"));
        assert!(is_reserved("/sys/kernel/x"));
        assert!(is_reserved("/dev/null"));
        assert!(!is_reserved("/device"));
        assert!(!is_reserved("/usr/dev"));
    }

    #[test]
    fn pax_times_keep_nanoseconds() {
        assert_eq!(parse_pax_time("1700000000.123456789"), Some(Timestamp::new(1_700_000_000, 123_456_789)));
        assert_eq!(parse_pax_time("12.5"), Some(Timestamp::new(12, 500_000_000)));
        assert_eq!(parse_pax_time("12.1234567891"), Some(Timestamp::new(12, 123_456_789)));
        assert_eq!(parse_pax_time("42"), Some(Timestamp::new(42, 0)));
        assert_eq!(parse_pax_time("nope"), None);
    }
}
