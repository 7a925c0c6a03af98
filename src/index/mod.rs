//! The merged path index of an image.
//!
//! A [`PathIndex`] maps every normalized path of the flattened image to a
//! [`Node`]. Regular files (and hard links) carry a [`RemoteRef`] that points
//! into the *uncompressed* stream of the layer that supplied them; the index
//! itself never holds file content.

pub mod path;

use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const S_IFMT: u32 = 0o170000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFLNK: u32 = 0o120000;

/// Seconds plus nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    pub secs: i64,
    pub nanos: u32,
}

impl Timestamp {
    pub fn new(secs: i64, nanos: u32) -> Self {
        Self { secs, nanos }
    }
}

/// POSIX-style attributes. `mode` includes the file-type bits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attr {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
    pub nlink: u32,
}

impl Attr {
    /// Attributes of a directory synthesized to complete a path chain.
    pub fn synthesized_dir(time: Timestamp) -> Self {
        Self {
            mode: S_IFDIR | 0o755,
            uid: 0,
            gid: 0,
            size: 0,
            atime: time,
            mtime: time,
            ctime: time,
            nlink: 2,
        }
    }

    pub fn file_type(&self) -> u32 {
        self.mode & S_IFMT
    }

    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }
}

/// Where a file's bytes live: a range of a layer's decompressed stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRef {
    pub layer_digest: String,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    File,
    Directory,
    Symlink { target: String },
    HardLink { target: String },
}

/// One entry of the merged image tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub path: String,
    pub kind: NodeKind,
    pub attr: Attr,
    pub remote: Option<RemoteRef>,
}

impl Node {
    pub fn directory(path: impl Into<String>, attr: Attr) -> Self {
        Self {
            path: path.into(),
            kind: NodeKind::Directory,
            attr,
            remote: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory)
    }

    /// `true` for nodes whose content is served from a layer.
    pub fn has_content(&self) -> bool {
        matches!(self.kind, NodeKind::File | NodeKind::HardLink { .. })
    }

    fn check(&self) -> Result<()> {
        let violation = |what: &str| {
            Err(Error::InvariantViolation(format!("{}: {}", self.path, what)))
        };
        match (&self.kind, &self.remote) {
            (NodeKind::File | NodeKind::HardLink { .. }, None) => {
                return violation("regular file without a remote reference")
            }
            (NodeKind::Directory | NodeKind::Symlink { .. }, Some(_)) => {
                return violation("non-regular node carries a remote reference")
            }
            _ => {}
        }
        if let Some(remote) = &self.remote {
            if remote.length != self.attr.size {
                return violation("remote length differs from size");
            }
        }
        let min_links = if self.is_dir() { 2 } else { 1 };
        if self.attr.nlink < min_links {
            return violation("link count too low");
        }
        Ok(())
    }
}

/// Ordered mapping from normalized path to [`Node`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathIndex {
    nodes: BTreeMap<String, Node>,
}

impl PathIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// An index holding only the root directory.
    pub fn with_root(attr: Attr) -> Self {
        let mut index = Self::new();
        index.nodes.insert("/".to_string(), Node::directory("/", attr));
        index
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&Node> {
        self.nodes.get(path)
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut Node> {
        self.nodes.get_mut(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.nodes.contains_key(path)
    }

    /// Look up `path` after normalizing it.
    pub fn resolve(&self, path: &str) -> Result<&Node> {
        let key = path::normalize(path);
        self.nodes.get(&key).ok_or(Error::NotFound(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Insert `node`, replacing whatever was at its path.
    ///
    /// When a directory is replaced by a non-directory its whole subtree goes
    /// with it. Returns the replaced node.
    pub fn insert(&mut self, node: Node) -> Option<Node> {
        let replaced_dir = self.nodes.get(&node.path).map(Node::is_dir).unwrap_or(false);
        if replaced_dir && !node.is_dir() {
            self.remove_descendants(&node.path, None);
        }
        self.nodes.insert(node.path.clone(), node)
    }

    /// Make sure every proper ancestor of `path` exists as a directory.
    ///
    /// Missing ancestors, and ancestors that are currently non-directories,
    /// become directories with `template` attributes. Returns the paths that
    /// were created or replaced. Calling it twice is a no-op the second time.
    pub fn ensure_ancestors(&mut self, path: &str, template: &Attr) -> Vec<String> {
        let mut created = Vec::new();
        for ancestor in path::ancestors(path) {
            match self.nodes.get(ancestor) {
                Some(node) if node.is_dir() => {}
                _ => {
                    self.nodes.insert(
                        ancestor.to_string(),
                        Node::directory(ancestor, template.clone()),
                    );
                    created.push(ancestor.to_string());
                }
            }
        }
        created
    }

    /// Remove `path` and everything beneath it, except paths in `keep`.
    /// Returns the number of nodes removed.
    pub fn remove_subtree(&mut self, path: &str, keep: Option<&HashSet<String>>) -> usize {
        let mut removed = self.remove_descendants(path, keep);
        let kept = keep.map(|k| k.contains(path)).unwrap_or(false);
        if path != "/" && !kept && self.nodes.remove(path).is_some() {
            removed += 1;
        }
        removed
    }

    /// Remove every node strictly beneath `dir`, except paths in `keep`.
    pub fn remove_descendants(&mut self, dir: &str, keep: Option<&HashSet<String>>) -> usize {
        let prefix = if dir == "/" { "/".to_string() } else { format!("{}/", dir) };
        let doomed: Vec<String> = self
            .nodes
            .range::<String, _>((Bound::Excluded(&prefix), Bound::Unbounded))
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(&prefix))
            .filter(|k| keep.map(|set| !set.contains(*k)).unwrap_or(true))
            .cloned()
            .collect();
        for key in &doomed {
            self.nodes.remove(key);
        }
        doomed.len()
    }

    /// Direct children of `dir`, in path order.
    pub fn list_children(&self, dir: &str) -> Vec<&Node> {
        let prefix = if dir == "/" { "/".to_string() } else { format!("{}/", dir) };
        let mut out = Vec::new();
        let mut lower = Bound::Excluded(prefix.clone());
        while let Some((key, node)) = self
            .nodes
            .range::<String, _>((lower.clone(), Bound::Unbounded))
            .next()
        {
            if !key.starts_with(&prefix) {
                break;
            }
            match key[prefix.len()..].find('/') {
                Some(slash) => {
                    // '0' sorts right after '/', so this skips the child's subtree.
                    let child = &key[..prefix.len() + slash];
                    lower = Bound::Included(format!("{}0", child));
                }
                None => {
                    out.push(node);
                    lower = Bound::Excluded(key.clone());
                }
            }
        }
        out
    }

    /// Check the structural rules every loaded index must satisfy.
    pub fn validate(&self) -> Result<()> {
        match self.nodes.get("/") {
            Some(root) if root.is_dir() => {}
            _ => return Err(Error::InvariantViolation("missing root directory".to_string())),
        }
        for (key, node) in &self.nodes {
            if *key != node.path || path::normalize(key) != *key {
                return Err(Error::InvariantViolation(format!(
                    "key {} does not match node path {}",
                    key, node.path
                )));
            }
            node.check()?;
            if let Some(parent) = path::parent(key) {
                match self.nodes.get(parent) {
                    Some(p) if p.is_dir() => {}
                    _ => {
                        return Err(Error::InvariantViolation(format!(
                            "{}: parent {} is not a directory",
                            key, parent
                        )))
                    }
                }
            }
        }
        Ok(())
    }
}
