// Conflict classifier
//
// A conflict is two different changes to the same path, one made locally and
// one made in the environment since the last sync.

use super::changes::{Change, ChangeKind};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Which pair of changes collided, from the local point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    YouAddedTheyAdded,
    YouAddedTheyChanged,
    YouAddedTheyDeleted,
    YouChangedTheyAdded,
    YouChangedTheyChanged,
    YouChangedTheyDeleted,
    YouDeletedTheyAdded,
    YouDeletedTheyChanged,
}

impl ConflictKind {
    /// Classify an ordered (local, environment) pair; agreeing deletes are not a conflict
    pub fn classify(local: ChangeKind, environment: ChangeKind) -> Option<Self> {
        use ChangeKind::*;
        let kind = match (local, environment) {
            (Create, Create) => ConflictKind::YouAddedTheyAdded,
            (Create, Update) => ConflictKind::YouAddedTheyChanged,
            (Create, Delete) => ConflictKind::YouAddedTheyDeleted,
            (Update, Create) => ConflictKind::YouChangedTheyAdded,
            (Update, Update) => ConflictKind::YouChangedTheyChanged,
            (Update, Delete) => ConflictKind::YouChangedTheyDeleted,
            (Delete, Create) => ConflictKind::YouDeletedTheyAdded,
            (Delete, Update) => ConflictKind::YouDeletedTheyChanged,
            (Delete, Delete) => return None,
        };
        Some(kind)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConflictKind::YouAddedTheyAdded => "You added, they added",
            ConflictKind::YouAddedTheyChanged => "You added, they changed",
            ConflictKind::YouAddedTheyDeleted => "You added, they deleted",
            ConflictKind::YouChangedTheyAdded => "You changed, they added",
            ConflictKind::YouChangedTheyChanged => "You changed, they changed",
            ConflictKind::YouChangedTheyDeleted => "You changed, they deleted",
            ConflictKind::YouDeletedTheyAdded => "You deleted, they added",
            ConflictKind::YouDeletedTheyChanged => "You deleted, they changed",
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Two differing changes at one path
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub local: Change,
    pub environment: Change,
}

impl Conflict {
    pub fn path(&self) -> &str {
        self.local.path()
    }
}

/// Find the local changes that collide with an environment change
///
/// Output follows the order of `local_changes`.
pub fn get_conflicts(local_changes: &[Change], environment_changes: &[Change]) -> Vec<Conflict> {
    let by_path: BTreeMap<&str, &Change> = environment_changes
        .iter()
        .map(|c| (c.path(), c))
        .collect();

    let mut conflicts = Vec::new();
    for local in local_changes {
        let Some(environment) = by_path.get(local.path()) else {
            continue;
        };

        // Both sides ended up with the same content
        if let (Some(ours), Some(theirs)) = (local.to_hash(), environment.to_hash()) {
            if ours == theirs {
                continue;
            }
        }

        if let Some(kind) = ConflictKind::classify(local.kind(), environment.kind()) {
            conflicts.push(Conflict {
                kind,
                local: local.clone(),
                environment: (*environment).clone(),
            });
        }
    }

    conflicts
}

/// `changes` minus every path that appears in `conflicts`
pub fn without_conflicting_changes(changes: &[Change], conflicts: &[Conflict]) -> Vec<Change> {
    let conflicting: HashSet<&str> = conflicts.iter().map(|c| c.path()).collect();
    changes
        .iter()
        .filter(|c| !conflicting.contains(c.path()))
        .cloned()
        .collect()
}
