//! Virtual path algebra shared by the resolver, the directory cache and
//! policy path scoping.
//!
//! Virtual paths are absolute, `/`-separated, with no `.`/`..` segments and
//! no duplicate separators. A trailing slash is meaningful only to callers
//! that distinguish directories (the cache always re-adds one).

/// Normalize an incoming virtual path: force a leading slash, collapse
/// duplicate separators, drop `.` segments and reject traversal.
pub fn normalize(input: &str) -> Result<String, anyhow::Error> {
    let mut out = String::with_capacity(input.len() + 1);
    out.push('/');

    for segment in input.split('/') {
        match segment {
            "" | "." => {}
            ".." => return Err(anyhow::anyhow!("path traversal is not allowed: {input}")),
            seg => {
                if !out.ends_with('/') {
                    out.push('/');
                }
                out.push_str(seg);
            }
        }
    }

    if out.len() > 1 && input.ends_with('/') {
        out.push('/');
    }
    Ok(out)
}

/// Directory form: normalized with a guaranteed trailing slash.
pub fn normalize_dir(input: &str) -> Result<String, anyhow::Error> {
    let mut path = normalize(input)?;
    if !path.ends_with('/') {
        path.push('/');
    }
    Ok(path)
}

pub fn is_dir_path(path: &str) -> bool {
    path.ends_with('/')
}

fn trimmed(path: &str) -> &str {
    let t = path.trim_end_matches('/');
    if t.is_empty() { "/" } else { t }
}

/// True when `prefix` is `path` itself or a path-segment ancestor of it.
pub fn is_ancestor_or_equal(prefix: &str, path: &str) -> bool {
    let prefix = trimmed(prefix);
    let path = trimmed(path);
    if prefix == "/" {
        return true;
    }
    path == prefix || path.starts_with(prefix) && path.as_bytes()[prefix.len()] == b'/'
}

/// True when `prefix` is a strict segment ancestor of `path`.
pub fn is_strict_ancestor(prefix: &str, path: &str) -> bool {
    trimmed(prefix) != trimmed(path) && is_ancestor_or_equal(prefix, path)
}

/// Parent directory, stopping at the root.
pub fn parent(path: &str) -> Option<String> {
    let t = trimmed(path);
    if t == "/" {
        return None;
    }
    match t.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(idx) => Some(t[..idx].to_string()),
        None => None,
    }
}

/// The path itself followed by every ancestor up to and including `/`.
pub fn ancestor_chain(path: &str) -> Vec<String> {
    let mut chain = vec![trimmed(path).to_string()];
    let mut current = trimmed(path).to_string();
    while let Some(p) = parent(&current) {
        chain.push(p.clone());
        current = p;
    }
    chain
}

/// Strip a mount prefix from a virtual path, yielding the driver sub-path.
/// Returns None when `mount_path` is not an ancestor-or-equal of `path`.
pub fn strip_mount_prefix(mount_path: &str, path: &str) -> Option<String> {
    if !is_ancestor_or_equal(mount_path, path) {
        return None;
    }
    let rest = &trimmed(path)[trimmed(mount_path).len()..];
    let mut sub = String::from("/");
    sub.push_str(rest.trim_start_matches('/'));
    if is_dir_path(path) && sub.len() > 1 {
        sub.push('/');
    }
    Some(sub)
}

/// Join a parent directory and a child name.
pub fn join(dir: &str, name: &str) -> String {
    let base = trimmed(dir);
    if base == "/" {
        format!("/{name}")
    } else {
        format!("{base}/{name}")
    }
}

/// Final path segment, if any.
pub fn file_name(path: &str) -> Option<&str> {
    let t = trimmed(path);
    if t == "/" {
        return None;
    }
    t.rsplit('/').next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_and_anchors() {
        assert_eq!(normalize("a/b").unwrap(), "/a/b");
        assert_eq!(normalize("//a///b/").unwrap(), "/a/b/");
        assert_eq!(normalize("/a/./b").unwrap(), "/a/b");
        assert_eq!(normalize("").unwrap(), "/");
        assert_eq!(normalize("/").unwrap(), "/");
        assert!(normalize("/a/../b").is_err());
    }

    #[test]
    fn ancestor_checks_respect_segment_boundaries() {
        assert!(is_ancestor_or_equal("/team", "/team/docs"));
        assert!(is_ancestor_or_equal("/team", "/team"));
        assert!(!is_ancestor_or_equal("/team", "/teammate"));
        assert!(is_ancestor_or_equal("/", "/anything"));
        assert!(is_strict_ancestor("/team", "/team/docs"));
        assert!(!is_strict_ancestor("/team", "/team"));
    }

    #[test]
    fn ancestor_chain_walks_to_root() {
        assert_eq!(
            ancestor_chain("/a/b/c"),
            vec!["/a/b/c", "/a/b", "/a", "/"]
        );
        assert_eq!(ancestor_chain("/"), vec!["/"]);
    }

    #[test]
    fn strip_mount_prefix_yields_sub_path() {
        assert_eq!(strip_mount_prefix("/mnt", "/mnt/a/b").unwrap(), "/a/b");
        assert_eq!(strip_mount_prefix("/mnt", "/mnt").unwrap(), "/");
        assert_eq!(strip_mount_prefix("/", "/a").unwrap(), "/a");
        assert_eq!(strip_mount_prefix("/mnt", "/mnt/a/").unwrap(), "/a/");
        assert!(strip_mount_prefix("/mnt", "/other").is_none());
    }

    #[test]
    fn join_and_file_name() {
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a/", "b"), "/a/b");
        assert_eq!(file_name("/a/b.txt"), Some("b.txt"));
        assert_eq!(file_name("/"), None);
    }
}
