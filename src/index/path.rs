use super::error::{IndexError, IndexResult};
use std::path::{Component, Path, PathBuf};

const MAX_PATH_LENGTH: usize = 4096;

/// Canonical key for an archive member name: no leading `./`, no trailing `/`.
pub fn normalize_entry_name(name: &str) -> String {
    let mut name = name;
    while let Some(rest) = name.strip_prefix("./") {
        name = rest;
    }
    let name = name.trim_end_matches('/');
    if name == "." { String::new() } else { name.to_string() }
}

/// Last path segment
pub fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// True for keys that sit directly under the archive root
pub fn is_root_level(key: &str) -> bool {
    let key = key.strip_prefix("./").unwrap_or(key);
    !key.is_empty() && !key.contains('/')
}

/// True when `candidate` is exactly one segment below `parent`.
///
/// Matches on segment boundaries: `a/bc` is not a child of `a/b`, and
/// `a/b/c/d` is not a child of `a/b`.
pub fn is_direct_child(parent: &str, candidate: &str) -> bool {
    candidate
        .strip_prefix(parent)
        .and_then(|rest| rest.strip_prefix('/'))
        .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
}

/// Proper ancestors of a normalized key, outermost first: `a/b/c` yields `a`, `a/b`
pub fn ancestors(key: &str) -> impl Iterator<Item = &str> {
    key.match_indices('/').map(move |(i, _)| &key[..i]).filter(|dir| !dir.is_empty())
}

/// Half-open key range `[parent/, parent0)` covering every descendant of `parent`
/// in byte-ordered key space (`0` sorts right after `/`).
pub fn descendant_range(parent: &str) -> (String, String) {
    (format!("{}/", parent), format!("{}0", parent))
}

/// Validate a member path from a downloaded bundle and return it relative to the
/// extraction directory. Absolute paths and `..` components are rejected.
pub fn sanitize_relative(path: &Path) -> IndexResult<PathBuf> {
    if path.as_os_str().len() > MAX_PATH_LENGTH {
        return Err(IndexError::InvalidPath(format!("path too long: {}", path.display())));
    }

    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(IndexError::InvalidPath(format!(
                    "path escapes destination: {}",
                    path.display()
                )));
            }
        }
    }
    Ok(out)
}
