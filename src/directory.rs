// The synced directory: normalization, ignore rules, walking and hashing
//
// Every path handed to the differ comes out of here as a normalized key, so
// both sides of a comparison always agree on separators and the trailing
// slash that marks directories.

use crate::error::{Result, SyncError};
use crate::fs_util;
use crate::path;
use crate::sync::changes::Hashes;
use crate::transport::FileContent;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use ignore::WalkBuilder;
use rayon::prelude::*;
use std::path::{Path, PathBuf};

/// The tool's own metadata directory; its contents are environment authoritative
pub const METADATA_DIR: &str = ".devsync/";

/// Persisted sync state, relative to the root
pub const SYNC_STATE_FILE: &str = ".devsync/sync.json";

/// Dev lock file, relative to the root
pub const DEV_LOCK_FILE: &str = ".devsync/dev.lock";

/// Where local files go before a pull overwrites or deletes them
pub const BACKUP_DIR: &str = ".devsync/backup/";

/// Root-level ignore file (gitignore syntax)
pub const IGNORE_FILE: &str = ".ignore";

/// Never synced, regardless of the ignore file
const ALWAYS_IGNORE: &[&str] = &[".git", "node_modules", ".DS_Store"];

/// Bookkeeping that must never enter the diff loop
const HASHING_IGNORE: &[&str] = &[
    "/.devsync/sync.json",
    "/.devsync/dev.lock",
    "/.devsync/backup",
    "/.devsync/.tmp*",
];

/// Hash of a file's contents, as used in every `Hashes` map
pub fn hash_content(bytes: &[u8]) -> String {
    hex::encode(blake3::hash(bytes).as_bytes())
}

/// Hash used for directory keys
pub fn directory_hash() -> String {
    hash_content(&[])
}

/// A filesystem entry found while walking the directory
#[derive(Debug, Clone)]
pub struct Entry {
    pub key: String,
    pub path: PathBuf,
    pub is_dir: bool,
}

pub struct Directory {
    root: PathBuf,
    ignorer: Gitignore,
    hashing_ignorer: Gitignore,
}

impl Directory {
    /// Open (and create if needed) the directory at `root`
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root).map_err(|e| SyncError::ReadDirError {
            path: root.to_path_buf(),
            source: e,
        })?;
        let root = root.canonicalize().map_err(|e| SyncError::ReadDirError {
            path: root.to_path_buf(),
            source: e,
        })?;

        let hashing_ignorer = build_ignorer(&root, HASHING_IGNORE, false)?;
        let ignorer = build_ignorer(&root, ALWAYS_IGNORE, true)?;

        Ok(Self {
            root,
            ignorer,
            hashing_ignorer,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Re-read the `.ignore` file (after it changed on disk)
    pub fn reload_ignore(&mut self) -> Result<()> {
        self.ignorer = build_ignorer(&self.root, ALWAYS_IGNORE, true)?;
        tracing::debug!("Reloaded ignore rules from {}", IGNORE_FILE);
        Ok(())
    }

    pub fn relative(&self, absolute: &Path, is_dir: bool) -> Result<String> {
        path::relative(&self.root, absolute, is_dir)
    }

    pub fn absolute(&self, key: &str) -> Result<PathBuf> {
        path::absolute(&self.root, key)
    }

    /// Whether the user's ignore rules exclude `key`
    pub fn ignores(&self, key: &str) -> bool {
        let is_dir = path::is_dir_key(key);
        let trimmed = key.trim_end_matches('/');
        if trimmed.is_empty() {
            return false;
        }
        self.ignorer
            .matched_path_or_any_parents(trimmed, is_dir)
            .is_ignore()
    }

    /// Whether `key` is excluded from hashing (ignored or tool bookkeeping)
    pub fn ignores_for_hashing(&self, key: &str) -> bool {
        if self.ignores(key) {
            return true;
        }
        let is_dir = path::is_dir_key(key);
        let trimmed = key.trim_end_matches('/');
        !trimmed.is_empty()
            && self
                .hashing_ignorer
                .matched_path_or_any_parents(trimmed, is_dir)
                .is_ignore()
    }

    /// Walk the directory, skipping ignored paths and bookkeeping
    pub fn walk(&self) -> Result<Vec<Entry>> {
        let root = self.root.clone();
        let ignorer = self.ignorer.clone();
        let hashing_ignorer = self.hashing_ignorer.clone();

        let walker = WalkBuilder::new(&self.root)
            .standard_filters(false)
            .hidden(false)
            .follow_links(false)
            .filter_entry(move |entry| {
                let Ok(rel) = entry.path().strip_prefix(&root) else {
                    return true;
                };
                if rel.as_os_str().is_empty() {
                    return true;
                }
                let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
                !ignorer.matched(rel, is_dir).is_ignore()
                    && !hashing_ignorer.matched(rel, is_dir).is_ignore()
            })
            .build();

        let mut entries = Vec::new();
        for result in walker {
            let entry = result.map_err(|e| SyncError::ReadDirError {
                path: self.root.clone(),
                source: std::io::Error::other(e.to_string()),
            })?;

            if entry.depth() == 0 {
                continue;
            }

            let Some(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_symlink() {
                tracing::debug!("Skipping symlink {}", entry.path().display());
                continue;
            }

            let is_dir = file_type.is_dir();
            let key = self.relative(entry.path(), is_dir)?;
            entries.push(Entry {
                key,
                path: entry.path().to_path_buf(),
                is_dir,
            });
        }

        Ok(entries)
    }

    /// Compute the hash of every file and directory
    pub fn hashes(&self) -> Result<Hashes> {
        let entries = self.walk()?;
        let dir_hash = directory_hash();

        let hashed: Vec<(String, String)> = entries
            .par_iter()
            .map(|entry| {
                if entry.is_dir {
                    return Ok((entry.key.clone(), dir_hash.clone()));
                }
                let bytes = std::fs::read(&entry.path).map_err(|e| SyncError::ReadDirError {
                    path: entry.path.clone(),
                    source: e,
                })?;
                Ok((entry.key.clone(), hash_content(&bytes)))
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!("Hashed {} local entries", hashed.len());
        Ok(hashed.into_iter().collect())
    }

    /// Current hash of a single key, `None` if it no longer exists
    pub fn hash_of(&self, key: &str) -> Result<Option<String>> {
        let path = self.absolute(key)?;
        match std::fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => Ok(Some(directory_hash())),
            Ok(meta) if meta.file_type().is_symlink() => Ok(None),
            Ok(_) => {
                let bytes = std::fs::read(&path)?;
                Ok(Some(hash_content(&bytes)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::ReadDirError { path, source: e }),
        }
    }

    /// Whether anything besides tool metadata lives in the directory
    pub fn has_user_files(&self) -> Result<bool> {
        Ok(self
            .walk()?
            .iter()
            .any(|e| !path::is_under(&e.key, METADATA_DIR)))
    }

    /// Read a file (or directory marker) for publishing
    pub fn read_file(&self, key: &str) -> Result<FileContent> {
        let path = self.absolute(key)?;
        let meta = std::fs::metadata(&path).map_err(|e| SyncError::ReadDirError {
            path: path.clone(),
            source: e,
        })?;

        let content = if meta.is_dir() {
            Vec::new()
        } else {
            std::fs::read(&path).map_err(|e| SyncError::ReadDirError {
                path: path.clone(),
                source: e,
            })?
        };

        Ok(FileContent {
            path: key.to_string(),
            mode: fs_util::file_mode(&meta),
            content,
        })
    }

    /// Write a pulled file, creating parent directories
    pub fn write_file(&self, key: &str, content: &[u8], mode: u32) -> Result<()> {
        let path = self.absolute(key)?;
        if path::is_dir_key(key) {
            return self.create_dir(key);
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SyncError::WriteError {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        std::fs::write(&path, content).map_err(|e| SyncError::WriteError {
            path: path.clone(),
            source: e,
        })?;
        fs_util::set_mode(&path, mode)?;
        Ok(())
    }

    pub fn create_dir(&self, key: &str) -> Result<()> {
        let path = self.absolute(key)?;
        std::fs::create_dir_all(&path).map_err(|e| SyncError::WriteError { path, source: e })
    }

    /// Copy a file into the backup directory before it is overwritten
    pub fn backup(&self, key: &str) -> Result<()> {
        let source = self.absolute(key)?;
        if !source.is_file() {
            return Ok(());
        }
        let target = self.backup_target(key)?;
        std::fs::copy(&source, &target).map_err(|e| SyncError::WriteError {
            path: target.clone(),
            source: e,
        })?;
        Ok(())
    }

    /// Remove a path that was deleted in the environment
    ///
    /// Files are moved into the backup directory. A directory is only removed
    /// once it is empty: anything still inside was never deleted remotely and
    /// is left for the caller to sync. Missing paths are fine, deletes must
    /// stay idempotent across retries.
    ///
    /// Returns whether the path is gone afterwards.
    pub fn remove(&self, key: &str) -> Result<bool> {
        let source = self.absolute(key)?;
        let meta = match std::fs::symlink_metadata(&source) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(write_error(&source, e)),
        };

        if meta.is_dir() {
            let mut entries = std::fs::read_dir(&source).map_err(|e| write_error(&source, e))?;
            if entries.next().is_some() {
                tracing::debug!("Keeping {}, it still has local content", key);
                return Ok(false);
            }
            std::fs::remove_dir(&source).map_err(|e| write_error(&source, e))?;
            return Ok(true);
        }

        let target = self.backup_target(key)?;
        if std::fs::rename(&source, &target).is_err() {
            // Rename across devices fails; fall back to delete
            std::fs::remove_file(&source).map_err(|e| write_error(&source, e))?;
        }
        Ok(true)
    }

    /// Backup location for `key`, cleared and ready to receive a file
    ///
    /// Earlier backups may have left a file where a directory is needed now,
    /// or the other way round. The newest backup always wins.
    fn backup_target(&self, key: &str) -> Result<PathBuf> {
        let trimmed = key.trim_end_matches('/');
        let target = self.absolute(&format!("{}{}", BACKUP_DIR, trimmed))?;
        let backup_root = self.root.join(BACKUP_DIR.trim_end_matches('/'));

        for ancestor in target.ancestors().skip(1) {
            if !ancestor.starts_with(&backup_root) {
                break;
            }
            if let Ok(meta) = std::fs::symlink_metadata(ancestor) {
                if !meta.is_dir() {
                    std::fs::remove_file(ancestor).map_err(|e| write_error(ancestor, e))?;
                }
            }
        }

        if let Ok(existing) = std::fs::symlink_metadata(&target) {
            let cleared = if existing.is_dir() {
                std::fs::remove_dir_all(&target)
            } else {
                std::fs::remove_file(&target)
            };
            cleared.map_err(|e| write_error(&target, e))?;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| write_error(parent, e))?;
        }
        Ok(target)
    }
}

fn write_error(path: &Path, source: std::io::Error) -> SyncError {
    SyncError::WriteError {
        path: path.to_path_buf(),
        source,
    }
}

fn build_ignorer(root: &Path, builtin: &[&str], with_ignore_file: bool) -> Result<Gitignore> {
    let mut builder = GitignoreBuilder::new(root);
    for pattern in builtin {
        builder
            .add_line(None, pattern)
            .map_err(|e| SyncError::Config(format!("Invalid ignore pattern {}: {}", pattern, e)))?;
    }

    if with_ignore_file {
        let ignore_file = root.join(IGNORE_FILE);
        if ignore_file.is_file() {
            if let Some(e) = builder.add(&ignore_file) {
                tracing::warn!("Problem reading {}: {}", ignore_file.display(), e);
            }
        }
    }

    builder
        .build()
        .map_err(|e| SyncError::Config(format!("Failed to build ignore rules: {}", e)))
}
