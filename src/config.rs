//! Runtime configuration: a YAML file plus `CLIP_*` environment overrides.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clip_oci::Platform;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::cache::{CacheManager, DiskCache, HttpSharedCache};
use crate::checkpoint::{DEFAULT_CHECKPOINT_INTERVAL, DEFAULT_LARGE_FILE_THRESHOLD};
use crate::error::{Error, Result};
use crate::indexer::IndexOptions;
use crate::resolver::ResolverOptions;

#[derive(Debug, Deserialize)]
pub struct ClipConfig {
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,
    #[serde(default = "default_large_file_threshold")]
    pub large_file_threshold: u64,
    /// Human-readable duration, e.g. `30s` or `2m`.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout: String,
    #[serde(default)]
    pub checkpoint_reads: bool,
    #[serde(default)]
    pub shared_cache_url: Option<String>,
    /// `os/arch[/variant]`; defaults to the host.
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    /// Only ever taken from the environment.
    #[serde(skip)]
    pub shared_cache_token: Option<SecretString>,
}

fn default_cache_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".cache").join("clip"),
        None => std::env::temp_dir().join("clip-cache"),
    }
}

fn default_checkpoint_interval() -> u64 {
    DEFAULT_CHECKPOINT_INTERVAL
}

fn default_large_file_threshold() -> u64 {
    DEFAULT_LARGE_FILE_THRESHOLD
}

fn default_fetch_timeout() -> String {
    "30s".to_string()
}

impl Default for ClipConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            checkpoint_interval: default_checkpoint_interval(),
            large_file_threshold: default_large_file_threshold(),
            fetch_timeout: default_fetch_timeout(),
            checkpoint_reads: false,
            shared_cache_url: None,
            platform: None,
            log_file: None,
            shared_cache_token: None,
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl ClipConfig {
    /// Parse a YAML (or JSON) config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        let config: ClipConfig = serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// The file at `path` if given, defaults otherwise, then the
    /// environment on top.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load(p)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `CLIP_CACHE_DIR`, `CLIP_SHARED_CACHE_URL`,
    /// `CLIP_CHECKPOINT_READS` and `CLIP_SHARED_CACHE_TOKEN` from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("CLIP_CACHE_DIR").filter(|v| !v.is_empty()) {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(url) = lookup("CLIP_SHARED_CACHE_URL") {
            self.shared_cache_url = Some(url).filter(|u| !u.is_empty());
        }
        if let Some(raw) = lookup("CLIP_CHECKPOINT_READS") {
            self.checkpoint_reads = parse_flag(&raw).ok_or_else(|| {
                Error::Config(format!("CLIP_CHECKPOINT_READS: expected a boolean, got {:?}", raw))
            })?;
        }
        if let Some(token) = lookup("CLIP_SHARED_CACHE_TOKEN").filter(|v| !v.is_empty()) {
            self.shared_cache_token = Some(SecretString::from(token));
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.checkpoint_interval == 0 {
            return Err(Error::Config("checkpoint_interval must be positive".to_string()));
        }
        self.fetch_timeout()?;
        self.platform()?;
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Result<Duration> {
        humantime::parse_duration(&self.fetch_timeout)
            .map_err(|e| Error::Config(format!("fetch_timeout {:?}: {}", self.fetch_timeout, e)))
    }

    pub fn platform(&self) -> Result<Platform> {
        match &self.platform {
            Some(raw) => Platform::parse(raw).map_err(|e| Error::Config(e.to_string())),
            None => Ok(Platform::host()),
        }
    }

    pub fn index_options(&self) -> IndexOptions {
        IndexOptions {
            checkpoint_interval: self.checkpoint_interval,
            large_file_threshold: self.large_file_threshold,
            progress: None,
        }
    }

    pub fn resolver_options(&self) -> Result<ResolverOptions> {
        Ok(ResolverOptions {
            checkpoint_reads: self.checkpoint_reads,
            fetch_timeout: self.fetch_timeout()?,
        })
    }

    /// Disk tier under `cache_dir`, plus the HTTP shared tier when a URL is
    /// configured.
    pub fn cache_manager(&self) -> Result<CacheManager> {
        let mut manager = CacheManager::new(DiskCache::new(&self.cache_dir));
        if let Some(url) = &self.shared_cache_url {
            let mut shared = HttpSharedCache::new(url.clone(), self.fetch_timeout()?)?;
            if let Some(token) = &self.shared_cache_token {
                shared = shared.with_token(SecretString::from(token.expose_secret().to_string()));
            }
            manager = manager.with_shared(Arc::new(shared));
        }
        Ok(manager)
    }
}
