use crate::error::{Result, SyncError};
use std::io::Write;
use std::path::Path;

/// Write `contents` to `path` atomically
///
/// The data goes to a temporary file in the same directory which is then
/// renamed over the target, so readers see either the old or the new file,
/// never a partial one.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path.parent().ok_or_else(|| SyncError::InvalidPath {
        path: path.to_path_buf(),
    })?;
    std::fs::create_dir_all(parent)?;

    let mut temp = tempfile::Builder::new()
        .prefix(".tmp")
        .tempfile_in(parent)
        .map_err(|e| SyncError::WriteError {
            path: path.to_path_buf(),
            source: e,
        })?;

    temp.write_all(contents)
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|e| SyncError::WriteError {
            path: path.to_path_buf(),
            source: e,
        })?;

    temp.persist(path).map_err(|e| SyncError::WriteError {
        path: path.to_path_buf(),
        source: e.error,
    })?;

    Ok(())
}

/// Unix permission bits of a file, if the platform has them
#[cfg(unix)]
pub fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
pub fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    if metadata.is_dir() {
        0o755
    } else if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Apply unix permission bits to a path (no-op elsewhere)
#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if mode == 0 {
        return Ok(());
    }
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777))?;
    Ok(())
}

#[cfg(not(unix))]
pub fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
