//! Engine-relative paths.
//!
//! Every path the sync core stores or passes around is relative to the
//! engine root, uses `/` as separator and starts with `/` (the root itself
//! is `/`). Conversion to and from absolute filesystem paths happens only
//! here.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

pub const ROOT: &str = "/";

#[derive(Debug, Error)]
pub enum PathError {
    #[error("path is empty")]
    Empty,
    #[error("path contains unsupported component")]
    UnsupportedComponent,
    #[error("path is outside the engine root: {0}")]
    OutsideRoot(PathBuf),
    #[error("path is not valid unicode: {0}")]
    NotUnicode(PathBuf),
}

pub fn to_absolute(root: &Path, local_path: &str) -> Result<PathBuf, PathError> {
    if local_path.is_empty() {
        return Err(PathError::Empty);
    }

    let mut out = root.to_path_buf();
    for component in Path::new(local_path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    Ok(out)
}

pub fn to_local(root: &Path, absolute: &Path) -> Result<String, PathError> {
    let relative = absolute
        .strip_prefix(root)
        .map_err(|_| PathError::OutsideRoot(absolute.to_path_buf()))?;
    let mut out = String::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                let part = part
                    .to_str()
                    .ok_or_else(|| PathError::NotUnicode(absolute.to_path_buf()))?;
                out.push('/');
                out.push_str(part);
            }
            Component::CurDir => continue,
            _ => return Err(PathError::UnsupportedComponent),
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

pub fn join(parent: &str, name: &str) -> String {
    if parent == ROOT || parent.is_empty() {
        format!("/{name}")
    } else {
        format!("{}/{name}", parent.trim_end_matches('/'))
    }
}

/// `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path == ROOT {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT),
        Some(idx) => Some(&path[..idx]),
        None => Some(ROOT),
    }
}

pub fn name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

pub fn depth(path: &str) -> i64 {
    if path == ROOT {
        0
    } else {
        path.matches('/').count() as i64
    }
}

pub fn is_same_or_descendant(path: &str, ancestor: &str) -> bool {
    if ancestor == ROOT {
        return true;
    }
    path == ancestor
        || path
            .strip_prefix(ancestor)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Rewrites `path` from under `from` to under `to`.
pub fn rebase(path: &str, from: &str, to: &str) -> Option<String> {
    if path == from {
        return Some(to.to_string());
    }
    let rest = path.strip_prefix(from)?.strip_prefix('/')?;
    Some(join(to, rest))
}

/// LIKE pattern matching strict descendants, with `%`/`_` escaped by `\`.
pub(crate) fn descendants_pattern(path: &str) -> String {
    let mut escaped = String::with_capacity(path.len() + 2);
    for ch in path.trim_end_matches('/').chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push_str("/%");
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_local_path_under_root() {
        let root = PathBuf::from("/sync");
        assert_eq!(
            to_absolute(&root, "/Docs/A.txt").unwrap(),
            PathBuf::from("/sync/Docs/A.txt")
        );
        assert_eq!(to_absolute(&root, "/").unwrap(), root);
        assert_eq!(
            to_local(&root, Path::new("/sync/Docs/A.txt")).unwrap(),
            "/Docs/A.txt"
        );
        assert_eq!(to_local(&root, Path::new("/sync")).unwrap(), "/");
    }

    #[test]
    fn rejects_escaping_paths() {
        let root = PathBuf::from("/sync");
        assert!(matches!(
            to_absolute(&root, "/../secret"),
            Err(PathError::UnsupportedComponent)
        ));
        assert!(matches!(
            to_local(&root, Path::new("/elsewhere/file")),
            Err(PathError::OutsideRoot(_))
        ));
    }

    #[test]
    fn parent_name_depth() {
        assert_eq!(parent("/a/b/c.txt"), Some("/a/b"));
        assert_eq!(parent("/a"), Some("/"));
        assert_eq!(parent("/"), None);
        assert_eq!(name("/a/b/c.txt"), "c.txt");
        assert_eq!(depth("/"), 0);
        assert_eq!(depth("/a/b/c.txt"), 3);
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
    }

    #[test]
    fn descendant_checks_respect_boundaries() {
        assert!(is_same_or_descendant("/a/b", "/a"));
        assert!(!is_same_or_descendant("/ab", "/a"));
        assert_eq!(rebase("/a/b/c", "/a/b", "/x"), Some("/x/c".to_string()));
        assert_eq!(rebase("/a/bc", "/a/b", "/x"), None);
        assert_eq!(descendants_pattern("/a_b"), "/a\\_b/%");
    }
}
