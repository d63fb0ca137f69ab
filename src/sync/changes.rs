// Hash differ
//
// Pure functions over path -> hash maps. Nothing here touches the filesystem
// or the network, so the orchestrator can recompute changes as often as it
// likes and always get the same answer.

use crate::path;
use serde::Serialize;
use std::collections::BTreeMap;

/// Normalized relative path -> content hash. Directory keys end with `/`.
pub type Hashes = BTreeMap<String, String>;

/// What happened to a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

/// A change at one path, with the hashes on either side of it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Change {
    Create { path: String, to_hash: String },
    Update {
        path: String,
        from_hash: String,
        to_hash: String,
    },
    Delete { path: String, from_hash: String },
}

impl Change {
    pub fn path(&self) -> &str {
        match self {
            Change::Create { path, .. } | Change::Update { path, .. } | Change::Delete { path, .. } => {
                path
            }
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            Change::Create { .. } => ChangeKind::Create,
            Change::Update { .. } => ChangeKind::Update,
            Change::Delete { .. } => ChangeKind::Delete,
        }
    }

    /// Hash the path ends up with, `None` for deletes
    pub fn to_hash(&self) -> Option<&str> {
        match self {
            Change::Create { to_hash, .. } | Change::Update { to_hash, .. } => Some(to_hash),
            Change::Delete { .. } => None,
        }
    }

    /// Hash the path had before, `None` for creates
    pub fn from_hash(&self) -> Option<&str> {
        match self {
            Change::Update { from_hash, .. } | Change::Delete { from_hash, .. } => Some(from_hash),
            Change::Create { .. } => None,
        }
    }

    /// Create or update: the path exists afterwards
    pub fn is_upsert(&self) -> bool {
        !matches!(self, Change::Delete { .. })
    }

    /// The change that undoes this one
    pub fn revert(&self) -> Change {
        match self {
            Change::Create { path, to_hash } => Change::Delete {
                path: path.clone(),
                from_hash: to_hash.clone(),
            },
            Change::Update {
                path,
                from_hash,
                to_hash,
            } => Change::Update {
                path: path.clone(),
                from_hash: to_hash.clone(),
                to_hash: from_hash.clone(),
            },
            Change::Delete { path, from_hash } => Change::Create {
                path: path.clone(),
                to_hash: from_hash.clone(),
            },
        }
    }
}

/// Changes that turn `from` into `to`, sorted by path
pub fn get_changes(from: &Hashes, to: &Hashes) -> Vec<Change> {
    get_changes_ignoring(from, to, &[])
}

/// Like [`get_changes`], skipping any path under one of `ignore`'s prefixes
pub fn get_changes_ignoring(from: &Hashes, to: &Hashes, ignore: &[&str]) -> Vec<Change> {
    let ignored = |p: &str| ignore.iter().any(|prefix| path::is_under(p, prefix));
    let mut changes = Vec::new();

    for (path, from_hash) in from {
        if ignored(path) {
            continue;
        }
        match to.get(path) {
            None => {
                // A directory key can vanish from a map while files under it
                // remain; it is only gone when nothing under it is left.
                let still_covered = path::is_dir_key(path)
                    && to
                        .range::<String, _>(path.clone()..)
                        .next()
                        .is_some_and(|(k, _)| k.starts_with(path.as_str()));
                if !still_covered {
                    changes.push(Change::Delete {
                        path: path.clone(),
                        from_hash: from_hash.clone(),
                    });
                }
            }
            Some(to_hash) if to_hash != from_hash => changes.push(Change::Update {
                path: path.clone(),
                from_hash: from_hash.clone(),
                to_hash: to_hash.clone(),
            }),
            Some(_) => {}
        }
    }

    for (path, to_hash) in to {
        if ignored(path) || from.contains_key(path) {
            continue;
        }
        changes.push(Change::Create {
            path: path.clone(),
            to_hash: to_hash.clone(),
        });
    }

    changes.sort_by(|a, b| a.path().cmp(b.path()));
    changes
}

/// Changes `to` must undergo to match `from`
pub fn get_changes_to_make(from: &Hashes, to: &Hashes) -> Vec<Change> {
    get_changes(to, from)
}

/// Drop changes that `current` already reflects
///
/// Deletes of absent paths and creates/updates whose target hash is already in
/// place are no-ops; filtering them keeps retried batches idempotent.
pub fn get_necessary_file_changes(changes: &[Change], current: &Hashes) -> Vec<Change> {
    changes
        .iter()
        .filter(|change| match change {
            Change::Delete { path, .. } => current.contains_key(path),
            Change::Create { path, to_hash } | Change::Update { path, to_hash, .. } => {
                current.get(path) != Some(to_hash)
            }
        })
        .cloned()
        .collect()
}
