// Dev lock: one long-running watch process per directory
//
// The lock file is created with exclusive-create semantics and names the
// owning pid. A lock whose pid is gone is stale and may be taken over.

use crate::directory::DEV_LOCK_FILE;
use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Contents of the lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    NotRunning,
    Running(LockInfo),
}

impl LockStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, LockStatus::Running(_))
    }
}

/// Held dev lock; released on drop
///
/// Not `Clone`: exactly one owner may release it.
#[derive(Debug)]
pub struct DevLock {
    path: PathBuf,
    info: LockInfo,
}

pub fn lock_path(root: &Path) -> PathBuf {
    root.join(DEV_LOCK_FILE)
}

impl DevLock {
    /// Take the lock for `root`, replacing a stale one
    pub fn acquire(root: &Path) -> Result<Self> {
        let path = lock_path(root);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SyncError::WriteError {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let info = LockInfo {
            pid: std::process::id(),
            started_at: Utc::now(),
        };

        if try_create(&path, &info)? {
            tracing::debug!("Acquired dev lock {}", path.display());
            return Ok(Self { path, info });
        }

        match read_lock(&path) {
            Some(holder) if is_alive(holder.pid) => {
                return Err(SyncError::DevAlreadyRunning {
                    pid: holder.pid,
                    started_at: holder.started_at.to_rfc3339(),
                })
            }
            Some(holder) => {
                tracing::info!("Removing stale dev lock left by pid {}", holder.pid);
            }
            None => tracing::info!("Removing unreadable dev lock {}", path.display()),
        }
        remove_lock(&path)?;

        // One retry; losing this race means another process just took it
        if try_create(&path, &info)? {
            tracing::debug!("Acquired dev lock {}", path.display());
            return Ok(Self { path, info });
        }
        match read_lock(&path) {
            Some(holder) => Err(SyncError::DevAlreadyRunning {
                pid: holder.pid,
                started_at: holder.started_at.to_rfc3339(),
            }),
            None => Err(SyncError::Unexpected(format!(
                "dev lock {} was recreated but cannot be read",
                path.display()
            ))),
        }
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    /// Release now instead of on drop
    pub fn release(self) {
        drop(self)
    }

    /// Current lock state for `root`; a stale lock is removed on the way
    pub fn status(root: &Path) -> LockStatus {
        let path = lock_path(root);
        if !path.exists() {
            return LockStatus::NotRunning;
        }
        match read_lock(&path) {
            Some(holder) if is_alive(holder.pid) => LockStatus::Running(holder),
            _ => {
                tracing::debug!("Clearing stale dev lock {}", path.display());
                let _ = remove_lock(&path);
                LockStatus::NotRunning
            }
        }
    }
}

impl Drop for DevLock {
    fn drop(&mut self) {
        // Only delete a lock that still names us
        if !read_lock(&self.path).is_some_and(|holder| holder.pid == self.info.pid) {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("Released dev lock {}", self.path.display()),
            Err(e) => tracing::debug!("Failed to remove dev lock {}: {}", self.path.display(), e),
        }
    }
}

/// Exclusive create; `false` when the file already exists
fn try_create(path: &Path, info: &LockInfo) -> Result<bool> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => {
            return Err(SyncError::WriteError {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    let json = serde_json::to_vec(info).map_err(|e| SyncError::Unexpected(e.to_string()))?;
    file.write_all(&json)
        .and_then(|_| file.sync_all())
        .map_err(|e| SyncError::WriteError {
            path: path.to_path_buf(),
            source: e,
        })?;
    Ok(true)
}

fn read_lock(path: &Path) -> Option<LockInfo> {
    let bytes = std::fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn remove_lock(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SyncError::WriteError {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Zero-signal liveness check. EPERM means the process exists under another user.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs permission and existence checks only
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    true
}
