//! The persisted index artifact.
//!
//! Layout: a fixed 54-byte header followed by two postcard-encoded sections,
//! the [`PathIndex`] and the [`StorageDescriptor`]. The artifact holds no file
//! content and no credentials.
//!
//! ```text
//! 0   magic        89 43 4C 49 50 0D 0A 1A 0A
//! 9   version      u8
//! 10  index pos    u64 LE
//! 18  index len    u64 LE
//! 26  storage pos  u64 LE
//! 34  storage len  u64 LE
//! 42  kind tag     12 bytes, ASCII, zero padded
//! ```

use std::collections::BTreeMap;
use std::io::{Cursor, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::checkpoint::LayerCheckpointIndex;
use crate::error::{Error, Result};
use crate::index::PathIndex;

pub const MAGIC: [u8; 9] = [0x89, 0x43, 0x4C, 0x49, 0x50, 0x0D, 0x0A, 0x1A, 0x0A];
pub const FORMAT_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 54;
const KIND_TAG_LEN: usize = 12;

// ---------------------------------------------------------------------------
// Storage descriptor
// ---------------------------------------------------------------------------

/// Where an image's layers are fetched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageKind {
    /// A registry speaking the OCI distribution API.
    Oci,
    /// An OCI image-layout directory on local disk.
    OciLayout,
    /// In-process layers; not reloadable from disk.
    Memory,
}

impl StorageKind {
    pub fn tag(self) -> &'static str {
        match self {
            StorageKind::Oci => "oci",
            StorageKind::OciLayout => "oci-layout",
            StorageKind::Memory => "memory",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "oci" => Some(StorageKind::Oci),
            "oci-layout" => Some(StorageKind::OciLayout),
            "memory" => Some(StorageKind::Memory),
            _ => None,
        }
    }
}

/// Runtime settings carried over from the image config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub os: String,
    pub architecture: String,
    pub variant: Option<String>,
    pub env: Vec<String>,
    pub cmd: Vec<String>,
    pub entrypoint: Vec<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl From<&clip_oci::ImageConfig> for ImageMetadata {
    fn from(cfg: &clip_oci::ImageConfig) -> Self {
        let container = cfg.config.clone().unwrap_or_default();
        Self {
            os: cfg.os.clone(),
            architecture: cfg.architecture.clone(),
            variant: cfg.variant.clone(),
            env: container.env.unwrap_or_default(),
            cmd: container.cmd.unwrap_or_default(),
            entrypoint: container.entrypoint.unwrap_or_default(),
            working_dir: container.working_dir.filter(|w| !w.is_empty()),
            user: container.user.filter(|u| !u.is_empty()),
            labels: container.labels.unwrap_or_default().into_iter().collect(),
        }
    }
}

/// Layer locations and checkpoint tables for one image.
///
/// For [`StorageKind::OciLayout`] `repository` holds the layout directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDescriptor {
    pub kind: StorageKind,
    pub registry: String,
    pub repository: String,
    pub reference: String,
    /// Bottom layer first.
    pub layers: Vec<String>,
    pub checkpoints: BTreeMap<String, LayerCheckpointIndex>,
    pub image: Option<ImageMetadata>,
}

impl StorageDescriptor {
    pub fn layer(&self, digest: &str) -> Result<&LayerCheckpointIndex> {
        self.checkpoints
            .get(digest)
            .ok_or_else(|| Error::NotFound(format!("layer {}", digest)))
    }

    fn validate(&self) -> Result<()> {
        if let Some(stray) = self.checkpoints.keys().find(|k| !self.layers.contains(k)) {
            return Err(Error::InvariantViolation(format!(
                "checkpoint table for {} which is not a layer",
                stray
            )));
        }
        for digest in &self.layers {
            let table = self.checkpoints.get(digest).ok_or_else(|| {
                Error::InvariantViolation(format!("no checkpoint table for {}", digest))
            })?;
            if table.layer_digest != *digest || !table.is_monotonic() {
                return Err(Error::InvariantViolation(format!(
                    "checkpoint table for {} is inconsistent",
                    digest
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveHeader {
    pub version: u8,
    pub index_offset: u64,
    pub index_len: u64,
    pub storage_offset: u64,
    pub storage_len: u64,
    pub kind: StorageKind,
}

impl ArchiveHeader {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(HEADER_LEN);
        out.extend_from_slice(&MAGIC);
        out.push(self.version);
        for v in [
            self.index_offset,
            self.index_len,
            self.storage_offset,
            self.storage_len,
        ] {
            out.write_u64::<LittleEndian>(v)?;
        }
        let mut tag = [0u8; KIND_TAG_LEN];
        let raw = self.kind.tag().as_bytes();
        tag[..raw.len()].copy_from_slice(raw);
        out.extend_from_slice(&tag);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::Artifact(format!(
                "file too short for header ({} bytes)",
                bytes.len()
            )));
        }
        if bytes[..MAGIC.len()] != MAGIC {
            return Err(Error::Artifact("bad magic".to_string()));
        }
        let version = bytes[9];
        if version != FORMAT_VERSION {
            return Err(Error::Artifact(format!("unsupported format version {}", version)));
        }
        let mut cur = Cursor::new(&bytes[10..42]);
        let index_offset = cur.read_u64::<LittleEndian>()?;
        let index_len = cur.read_u64::<LittleEndian>()?;
        let storage_offset = cur.read_u64::<LittleEndian>()?;
        let storage_len = cur.read_u64::<LittleEndian>()?;

        let tag_bytes = &bytes[42..HEADER_LEN];
        let end = tag_bytes.iter().position(|&b| b == 0).unwrap_or(KIND_TAG_LEN);
        let tag = std::str::from_utf8(&tag_bytes[..end])
            .map_err(|_| Error::Artifact("storage kind tag is not ASCII".to_string()))?;
        let kind = StorageKind::from_tag(tag)
            .ok_or_else(|| Error::Artifact(format!("unknown storage kind {:?}", tag)))?;

        Ok(Self {
            version,
            index_offset,
            index_len,
            storage_offset,
            storage_len,
            kind,
        })
    }
}

// ---------------------------------------------------------------------------
// ArchiveMetadata
// ---------------------------------------------------------------------------

/// Everything needed to serve an image: the merged tree plus layer storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveMetadata {
    pub index: PathIndex,
    pub storage: StorageDescriptor,
}

fn section<'a>(bytes: &'a [u8], offset: u64, len: u64, name: &str) -> Result<&'a [u8]> {
    let start = usize::try_from(offset).ok();
    let end = start.and_then(|s| usize::try_from(len).ok().and_then(|l| s.checked_add(l)));
    match (start, end) {
        (Some(s), Some(e)) if s >= HEADER_LEN && e <= bytes.len() => Ok(&bytes[s..e]),
        _ => Err(Error::Artifact(format!("{} section out of bounds", name))),
    }
}

impl ArchiveMetadata {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let index = postcard::to_allocvec(&self.index)?;
        let storage = postcard::to_allocvec(&self.storage)?;
        let header = ArchiveHeader {
            version: FORMAT_VERSION,
            index_offset: HEADER_LEN as u64,
            index_len: index.len() as u64,
            storage_offset: (HEADER_LEN + index.len()) as u64,
            storage_len: storage.len() as u64,
            kind: self.storage.kind,
        };
        let mut out = header.encode()?;
        out.reserve(index.len() + storage.len());
        out.extend_from_slice(&index);
        out.extend_from_slice(&storage);
        Ok(out)
    }

    /// Decode and validate an artifact.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header = ArchiveHeader::decode(bytes)?;
        let index: PathIndex = postcard::from_bytes(section(
            bytes,
            header.index_offset,
            header.index_len,
            "index",
        )?)?;
        let storage: StorageDescriptor = postcard::from_bytes(section(
            bytes,
            header.storage_offset,
            header.storage_len,
            "storage",
        )?)?;
        if storage.kind != header.kind {
            return Err(Error::Artifact(
                "header kind disagrees with storage section".to_string(),
            ));
        }

        let meta = Self { index, storage };
        meta.validate()?;
        Ok(meta)
    }

    /// Structural checks run on every load.
    pub fn validate(&self) -> Result<()> {
        self.index.validate()?;
        self.storage.validate()?;
        for node in self.index.iter() {
            if let Some(remote) = &node.remote {
                if !self.storage.checkpoints.contains_key(&remote.layer_digest) {
                    return Err(Error::InvariantViolation(format!(
                        "{} references unknown layer {}",
                        node.path, remote.layer_digest
                    )));
                }
            }
        }
        Ok(())
    }

    /// Write atomically: a temp file in the target directory, then rename.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes()?;
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| Error::Io(e.error))?;
        info!(
            path = %path.display(),
            bytes = bytes.len(),
            nodes = self.index.len(),
            layers = self.storage.layers.len(),
            "wrote index artifact",
        );
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        debug!(path = %path.display(), bytes = bytes.len(), "loading index artifact");
        Self::from_bytes(&bytes)
    }
}
