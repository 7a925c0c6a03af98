use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{OciError, Result};

// ---------------------------------------------------------------------------
// OCI Image Manifest
// ---------------------------------------------------------------------------

/// An OCI image manifest (application/vnd.oci.image.manifest.v1+json or
/// application/vnd.docker.distribution.manifest.v2+json).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(rename = "mediaType", default)]
    pub media_type: String,

    pub config: Descriptor,

    pub layers: Vec<Descriptor>,
}

impl OciManifest {
    /// Reject manifests whose layers are not gzip-compressed tarballs; the
    /// checkpoint index only understands gzip framing.
    pub fn ensure_gzip_layers(&self) -> Result<()> {
        for layer in &self.layers {
            if layer_compression(&layer.media_type) != LayerCompression::Gzip {
                return Err(OciError::UnsupportedMediaType(format!(
                    "{} ({})",
                    layer.media_type, layer.digest
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// A content-addressable descriptor used in both manifests and image indexes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,

    pub digest: String,

    pub size: u64,

    #[serde(default)]
    pub platform: Option<Platform>,

    #[serde(default)]
    pub annotations: Option<HashMap<String, String>>,
}

/// Annotation naming a manifest inside an OCI image layout's `index.json`.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

impl Descriptor {
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

/// Target platform for a manifest inside an image index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default)]
    pub variant: Option<String>,
}

impl Platform {
    /// Build a `Platform` matching the current host.
    pub fn host() -> Self {
        Self {
            architecture: host_arch().to_string(),
            os: "linux".to_string(),
            variant: None,
        }
    }

    /// Parse `os/arch[/variant]`, e.g. `linux/arm64/v8`.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut parts = raw.split('/');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(os), Some(arch), variant, None) if !os.is_empty() && !arch.is_empty() => {
                Ok(Self {
                    architecture: arch.to_string(),
                    os: os.to_string(),
                    variant: variant.map(str::to_string),
                })
            }
            _ => Err(OciError::Manifest(format!("invalid platform: {raw}"))),
        }
    }
}

/// Map Rust `std::env::consts::ARCH` values to OCI / Docker platform strings.
fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "arm",
        "s390x" => "s390x",
        "powerpc64" => "ppc64le",
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Image Index (fat manifest)
// ---------------------------------------------------------------------------

/// An OCI image index (application/vnd.oci.image.index.v1+json or
/// application/vnd.docker.distribution.manifest.list.v2+json).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageIndex {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    pub manifests: Vec<Descriptor>,
}

impl ImageIndex {
    /// Select the descriptor whose platform matches the given target.
    pub fn select_platform(&self, target: &Platform) -> Result<&Descriptor> {
        self.manifests
            .iter()
            .find(|d| match d.platform {
                Some(ref p) => {
                    p.architecture == target.architecture
                        && p.os == target.os
                        && (target.variant.is_none() || p.variant == target.variant)
                }
                None => false,
            })
            .ok_or_else(|| {
                OciError::Manifest(format!(
                    "no manifest found for platform {}/{}",
                    target.os, target.architecture,
                ))
            })
    }
}

// ---------------------------------------------------------------------------
// Image Config
// ---------------------------------------------------------------------------

/// Top-level image configuration blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub architecture: String,

    #[serde(default)]
    pub os: String,

    #[serde(default)]
    pub variant: Option<String>,

    #[serde(default)]
    pub created: Option<String>,

    #[serde(default)]
    pub author: Option<String>,

    #[serde(default)]
    pub config: Option<ContainerConfig>,

    #[serde(default)]
    pub rootfs: Option<RootFs>,
}

impl ImageConfig {
    /// Uncompressed-content digest of layer `i` (bottom-up), if recorded.
    pub fn diff_id(&self, i: usize) -> Option<&str> {
        self.rootfs
            .as_ref()
            .and_then(|r| r.diff_ids.get(i))
            .map(String::as_str)
    }
}

/// Container runtime configuration extracted from the image config blob.
///
/// Docker writes `null` for unset lists, hence the `Option`s.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(rename = "Env", default)]
    pub env: Option<Vec<String>>,

    #[serde(rename = "Cmd", default)]
    pub cmd: Option<Vec<String>>,

    #[serde(rename = "Entrypoint", default)]
    pub entrypoint: Option<Vec<String>>,

    #[serde(rename = "WorkingDir", default)]
    pub working_dir: Option<String>,

    #[serde(rename = "User", default)]
    pub user: Option<String>,

    #[serde(rename = "Labels", default)]
    pub labels: Option<HashMap<String, String>>,

    #[serde(rename = "StopSignal", default)]
    pub stop_signal: Option<String>,
}

/// The `rootfs` section listing uncompressed layer digests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type", default)]
    pub kind: String,

    #[serde(default)]
    pub diff_ids: Vec<String>,
}

// ---------------------------------------------------------------------------
// Media type constants
// ---------------------------------------------------------------------------

pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const MEDIA_TYPE_DOCKER_LAYER_GZIP: &str =
    "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Returns `true` when `media_type` is an image index / manifest list.
pub fn is_index_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_INDEX || media_type == MEDIA_TYPE_DOCKER_MANIFEST_LIST
}

/// Returns `true` when `media_type` is a single image manifest.
pub fn is_manifest_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_MANIFEST || media_type == MEDIA_TYPE_DOCKER_MANIFEST
}

/// Compression applied to a layer blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerCompression {
    Gzip,
    Zstd,
    None,
}

/// Classify a layer media type by its compression.
pub fn layer_compression(media_type: &str) -> LayerCompression {
    if media_type == MEDIA_TYPE_DOCKER_LAYER_GZIP || media_type.ends_with("+gzip") {
        LayerCompression::Gzip
    } else if media_type.ends_with("+zstd") {
        LayerCompression::Zstd
    } else {
        LayerCompression::None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
