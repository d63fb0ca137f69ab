use crate::error::{Result, SyncError};
use std::path::{Component, Path, PathBuf};

/// Normalize a relative path into the form used as a hash key
///
/// - Separators become `/`
/// - Leading `./` and `/` are stripped
/// - Directories end with exactly one `/`, files never do
pub fn normalize(path: &str, is_dir: bool) -> String {
    let normalized = path.replace('\\', "/");

    // Empty and "." segments drop out, which also collapses "a//b" and "./a"
    let mut out = String::with_capacity(normalized.len() + 1);
    for segment in normalized.split('/').filter(|s| !s.is_empty() && *s != ".") {
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(segment);
    }

    if is_dir && !out.is_empty() {
        out.push('/');
    }
    out
}

/// Convert an absolute path under `root` into a normalized relative key
pub fn relative(root: &Path, absolute: &Path, is_dir: bool) -> Result<String> {
    let stripped = absolute
        .strip_prefix(root)
        .map_err(|_| SyncError::InvalidPath {
            path: absolute.to_path_buf(),
        })?;

    let as_str = stripped.to_str().ok_or_else(|| SyncError::InvalidPath {
        path: absolute.to_path_buf(),
    })?;

    Ok(normalize(as_str, is_dir))
}

/// Convert a normalized relative key back into an absolute path under `root`
///
/// Keys that try to escape the root (`..`, absolute components) are rejected.
pub fn absolute(root: &Path, key: &str) -> Result<PathBuf> {
    let mut path = root.to_path_buf();
    for segment in key.split('/').filter(|s| !s.is_empty()) {
        match Path::new(segment).components().next() {
            Some(Component::Normal(part)) => path.push(part),
            _ => {
                return Err(SyncError::InvalidPath {
                    path: PathBuf::from(key),
                })
            }
        }
    }
    Ok(path)
}

/// Whether a hash key names a directory
pub fn is_dir_key(key: &str) -> bool {
    key.ends_with('/')
}

/// All ancestor directory keys of `key`, outermost first ("a/b/c" -> ["a/", "a/b/"])
pub fn ancestors(key: &str) -> Vec<String> {
    let trimmed = key.trim_end_matches('/');
    let mut dirs = Vec::new();
    for (idx, ch) in trimmed.char_indices() {
        if ch == '/' {
            dirs.push(format!("{}/", &trimmed[..idx]));
        }
    }
    dirs
}

/// Whether `key` is `prefix` itself or lies under it
pub fn is_under(key: &str, prefix: &str) -> bool {
    key.starts_with(prefix)
}
