//! Slash-path helpers for index keys.
//!
//! Keys are absolute, `/`-separated, free of `.`/`..` components and carry no
//! trailing slash; the root is `/`.

/// Normalize a raw archive or lookup path into an index key.
///
/// `..` never climbs above the root, so `../../etc` becomes `/etc`.
pub fn normalize(raw: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for comp in raw.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return "/".to_string();
    }
    let mut out = String::with_capacity(raw.len() + 1);
    for p in parts {
        out.push('/');
        out.push_str(p);
    }
    out
}

/// Parent directory of a normalized path; `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(i) => Some(&path[..i]),
        None => None,
    }
}

/// Final component of a normalized path (`""` for the root).
pub fn file_name(path: &str) -> &str {
    path.rfind('/').map(|i| &path[i + 1..]).unwrap_or(path)
}

/// Append `name` to the normalized directory `dir`.
pub fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Proper ancestors of a normalized path, root first.
pub fn ancestors(path: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut cur = parent(path);
    while let Some(p) = cur {
        out.push(p);
        cur = parent(p);
    }
    out.reverse();
    out
}

/// `true` when `path` equals `dir` or lies beneath it.
pub fn is_within(path: &str, dir: &str) -> bool {
    if dir == "/" {
        return true;
    }
    path == dir || (path.starts_with(dir) && path.as_bytes().get(dir.len()) == Some(&b'/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_cleans_components() {
        assert_eq!(normalize("./etc/passwd"), "/etc/passwd");
        assert_eq!(normalize("usr/lib/"), "/usr/lib");
        assert_eq!(normalize("/a//b/./c/../d"), "/a/b/d");
        assert_eq!(normalize("../../etc"), "/etc");
        assert_eq!(normalize("."), "/");
        assert_eq!(normalize(""), "/");
    }

    #[test]
    fn parent_and_name() {
        assert_eq!(parent("/"), None);
        assert_eq!(parent("/a"), Some("/"));
        assert_eq!(parent("/a/b/c"), Some("/a/b"));
        assert_eq!(file_name("/a/b/c"), "c");
        assert_eq!(file_name("/"), "");
        assert_eq!(join("/", "x"), "/x");
        assert_eq!(join("/a", "x"), "/a/x");
    }

    #[test]
    fn ancestors_are_root_first() {
        assert_eq!(ancestors("/a/b/c"), vec!["/", "/a", "/a/b"]);
        assert!(ancestors("/").is_empty());
    }

    #[test]
    fn within_respects_component_boundaries() {
        assert!(is_within("/proc/1/maps", "/proc"));
        assert!(is_within("/proc", "/proc"));
        assert!(!is_within("/process", "/proc"));
        assert!(is_within("/anything", "/"));
    }
}
