// Strategy resolver
//
// Turns (local changes, environment changes, conflicts) plus a policy into a
// plan: which changes get pushed to the environment and which get pulled
// into the local directory.

use super::changes::Change;
use super::conflicts::{without_conflicting_changes, Conflict};
use crate::directory::METADATA_DIR;
use crate::error::{Result, SyncError};
use crate::path;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Overall policy for one sync attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    Cancel,
    Merge,
    Push,
    Pull,
}

/// Which side wins a conflict under [`SyncStrategy::Merge`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeConflictPreference {
    Cancel,
    Local,
    Environment,
}

impl SyncStrategy {
    pub const VALUES: &'static [&'static str] = &["cancel", "merge", "push", "pull"];
}

impl MergeConflictPreference {
    pub const VALUES: &'static [&'static str] = &["cancel", "local", "environment"];
}

impl FromStr for SyncStrategy {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cancel" => Ok(Self::Cancel),
            "merge" => Ok(Self::Merge),
            "push" => Ok(Self::Push),
            "pull" => Ok(Self::Pull),
            other => Err(invalid_value("strategy", other, Self::VALUES)),
        }
    }
}

impl FromStr for MergeConflictPreference {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cancel" => Ok(Self::Cancel),
            "local" => Ok(Self::Local),
            "environment" | "env" => Ok(Self::Environment),
            other => Err(invalid_value("prefer", other, Self::VALUES)),
        }
    }
}

impl fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cancel => "cancel",
            Self::Merge => "merge",
            Self::Push => "push",
            Self::Pull => "pull",
        })
    }
}

impl fmt::Display for MergeConflictPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cancel => "cancel",
            Self::Local => "local",
            Self::Environment => "environment",
        })
    }
}

fn invalid_value(flag: &str, value: &str, valid: &[&str]) -> SyncError {
    SyncError::Arg(format!(
        "Invalid value for --{}: '{}'\nValid values are: {}",
        flag,
        value,
        valid.join(", ")
    ))
}

/// Asks the user how to resolve conflicts when no preference was given
#[async_trait]
pub trait PreferencePrompt: Send + Sync {
    /// `None` means the prompt was abandoned (cancelled or no answer)
    async fn choose(&self, conflicts: &[Conflict]) -> Option<MergeConflictPreference>;
}

/// What one sync attempt will do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// Abort without touching either side
    Cancel,
    /// Apply `pull` locally, then publish `push` to the environment
    Apply { push: Vec<Change>, pull: Vec<Change> },
}

impl Plan {
    pub fn is_noop(&self) -> bool {
        match self {
            Plan::Cancel => true,
            Plan::Apply { push, pull } => push.is_empty() && pull.is_empty(),
        }
    }
}

fn is_metadata(change: &Change) -> bool {
    path::is_under(change.path(), METADATA_DIR)
}

/// Decide the plan for one attempt
///
/// The metadata directory is environment authoritative: local changes under it
/// are never pushed (so they never trigger conflicts) and environment changes
/// under it are always pulled.
pub fn resolve(
    strategy: SyncStrategy,
    preference: Option<MergeConflictPreference>,
    local_changes: &[Change],
    environment_changes: &[Change],
    conflicts: &[Conflict],
) -> Result<Plan> {
    let local: Vec<Change> = local_changes
        .iter()
        .filter(|c| !is_metadata(c))
        .cloned()
        .collect();
    let conflicts: Vec<Conflict> = conflicts
        .iter()
        .filter(|c| !path::is_under(c.path(), METADATA_DIR))
        .cloned()
        .collect();
    let (metadata, environment): (Vec<Change>, Vec<Change>) =
        environment_changes.iter().cloned().partition(is_metadata);

    let plan = match strategy {
        SyncStrategy::Cancel => Plan::Cancel,

        SyncStrategy::Push => {
            // Local wins everywhere: push local changes, and undo environment
            // changes the local side never made.
            let mut push = local.clone();
            let env_only = without_conflicting_changes(&environment, &conflicts);
            push.extend(
                env_only
                    .iter()
                    .filter(|c| !local.iter().any(|l| l.path() == c.path()))
                    .map(Change::revert),
            );
            sort(&mut push);
            Plan::Apply {
                push,
                pull: metadata,
            }
        }

        SyncStrategy::Pull => {
            let mut pull = environment.clone();
            let local_only = without_conflicting_changes(&local, &conflicts);
            pull.extend(
                local_only
                    .iter()
                    .filter(|c| !environment.iter().any(|e| e.path() == c.path()))
                    .map(Change::revert),
            );
            pull.extend(metadata);
            sort(&mut pull);
            Plan::Apply {
                push: Vec::new(),
                pull,
            }
        }

        SyncStrategy::Merge => {
            let mut push = without_conflicting_changes(&local, &conflicts);
            let mut pull = without_conflicting_changes(&environment, &conflicts);

            if !conflicts.is_empty() {
                match preference {
                    None => {
                        return Err(SyncError::UnresolvedConflicts {
                            count: conflicts.len(),
                        })
                    }
                    Some(MergeConflictPreference::Cancel) => return Ok(Plan::Cancel),
                    Some(MergeConflictPreference::Local) => {
                        push.extend(conflicts.iter().map(|c| c.local.clone()));
                    }
                    Some(MergeConflictPreference::Environment) => {
                        pull.extend(conflicts.iter().map(|c| c.environment.clone()));
                    }
                }
            }

            pull.extend(metadata);
            sort(&mut push);
            sort(&mut pull);
            Plan::Apply { push, pull }
        }
    };

    Ok(plan)
}

fn sort(changes: &mut [Change]) {
    changes.sort_by(|a, b| a.path().cmp(b.path()));
}
