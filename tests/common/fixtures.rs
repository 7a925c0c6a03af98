//! Builders for gzip tar layers used across the integration tests.

#![allow(dead_code)]

use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Builder, EntryType, Header};

pub const MTIME: u64 = 1_700_000_000;

pub struct LayerBuilder {
    builder: Builder<Vec<u8>>,
}

fn rel(path: &str) -> &str {
    path.trim_start_matches('/')
}

fn header(kind: EntryType, mode: u32, size: u64) -> Header {
    let mut h = Header::new_gnu();
    h.set_entry_type(kind);
    h.set_mode(mode);
    h.set_size(size);
    h.set_mtime(MTIME);
    h.set_uid(0);
    h.set_gid(0);
    h
}

impl Default for LayerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LayerBuilder {
    pub fn new() -> Self {
        Self {
            builder: Builder::new(Vec::new()),
        }
    }

    pub fn file(self, path: &str, data: &[u8]) -> Self {
        self.file_mode(path, data, 0o644)
    }

    pub fn file_mode(mut self, path: &str, data: &[u8], mode: u32) -> Self {
        let mut h = header(EntryType::Regular, mode, data.len() as u64);
        self.builder.append_data(&mut h, rel(path), data).unwrap();
        self
    }

    pub fn dir(mut self, path: &str) -> Self {
        let mut h = header(EntryType::Directory, 0o755, 0);
        let name = format!("{}/", rel(path).trim_end_matches('/'));
        self.builder.append_data(&mut h, name, std::io::empty()).unwrap();
        self
    }

    pub fn symlink(mut self, path: &str, target: &str) -> Self {
        let mut h = header(EntryType::Symlink, 0o777, 0);
        self.builder.append_link(&mut h, rel(path), target).unwrap();
        self
    }

    pub fn hardlink(mut self, path: &str, target: &str) -> Self {
        let mut h = header(EntryType::Link, 0o644, 0);
        self.builder.append_link(&mut h, rel(path), rel(target)).unwrap();
        self
    }

    pub fn char_device(mut self, path: &str) -> Self {
        let mut h = header(EntryType::Char, 0o666, 0);
        self.builder.append_data(&mut h, rel(path), std::io::empty()).unwrap();
        self
    }

    /// `.wh.<name>` marker deleting `path` from lower layers.
    pub fn whiteout(self, path: &str) -> Self {
        let path = rel(path);
        let marker = match path.rsplit_once('/') {
            Some((dir, name)) => format!("{}/.wh.{}", dir, name),
            None => format!(".wh.{}", path),
        };
        self.file(&marker, b"")
    }

    /// `.wh..wh..opq` marker hiding lower-layer contents of `dir`.
    pub fn opaque(self, dir: &str) -> Self {
        let dir = rel(dir).trim_end_matches('/');
        self.file(&format!("{}/.wh..wh..opq", dir), b"")
    }

    pub fn tar(self) -> Vec<u8> {
        self.builder.into_inner().unwrap()
    }

    pub fn gzip(self) -> Vec<u8> {
        gzip(&self.tar())
    }
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

/// Deterministic incompressible bytes.
pub fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut x = seed | 1;
    let mut out = Vec::with_capacity(len + 8);
    while out.len() < len {
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        out.extend_from_slice(&x.to_le_bytes());
    }
    out.truncate(len);
    out
}
