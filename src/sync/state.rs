use crate::directory::SYNC_STATE_FILE;
use crate::error::{Result, SyncError};
use crate::fs_util;
use crate::transport::version_string;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Per-environment sync anchor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentState {
    #[serde(with = "version_string")]
    pub files_version: u64,
}

/// Persisted sync state (`.devsync/sync.json`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub application: String,
    /// Environment of the most recent sync
    pub environment: String,
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentState>,
}

pub fn state_path(root: &Path) -> PathBuf {
    root.join(SYNC_STATE_FILE)
}

impl SyncState {
    pub fn new(application: impl Into<String>, environment: impl Into<String>) -> Self {
        let environment = environment.into();
        let mut environments = BTreeMap::new();
        environments.insert(environment.clone(), EnvironmentState::default());
        Self {
            application: application.into(),
            environment,
            environments,
        }
    }

    /// Load the state for `root`; `None` if it was never synced
    pub fn load(root: &Path) -> Result<Option<Self>> {
        let path = state_path(root);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SyncError::ReadDirError { path, source: e }),
        };

        tracing::debug!("Loading sync state from {}", path.display());
        let state: Self = serde_json::from_slice(&bytes).map_err(|e| {
            tracing::warn!("Failed to parse sync state: {}", e);
            SyncError::CorruptState {
                path: path.clone(),
                reason: e.to_string(),
            }
        })?;
        Ok(Some(state))
    }

    /// Like [`SyncState::load`], failing when there is no state
    pub fn load_required(root: &Path) -> Result<Self> {
        Self::load(root)?.ok_or_else(|| SyncError::MissingState {
            path: root.to_path_buf(),
        })
    }

    /// Save atomically: temp file in the same directory, then rename
    pub fn save(&self, root: &Path) -> Result<()> {
        let path = state_path(root);
        let json = serde_json::to_vec_pretty(self).map_err(|e| SyncError::Unexpected(e.to_string()))?;
        fs_util::write_atomic(&path, &json)?;
        tracing::trace!("Saved sync state to {}", path.display());
        Ok(())
    }

    pub fn delete(root: &Path) -> Result<bool> {
        let path = state_path(root);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SyncError::WriteError { path, source: e }),
        }
    }

    /// Last agreed filesVersion for `environment` (0 if never synced)
    pub fn files_version(&self, environment: &str) -> u64 {
        self.environments
            .get(environment)
            .map(|e| e.files_version)
            .unwrap_or(0)
    }

    /// Record `version` for `environment`, never moving backwards
    ///
    /// Returns whether the recorded version changed.
    pub fn advance(&mut self, environment: &str, version: u64) -> bool {
        self.environment = environment.to_string();
        let entry = self.environments.entry(environment.to_string()).or_default();
        if version <= entry.files_version {
            if version < entry.files_version {
                tracing::warn!(
                    "Ignoring stale filesVersion {} for {} (recorded {})",
                    version,
                    environment,
                    entry.files_version
                );
            }
            return false;
        }
        entry.files_version = version;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let mut state = SyncState::new("app", "development");
        state.advance("development", 12);
        state.save(dir.path()).unwrap();

        let loaded = SyncState::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.files_version("development"), 12);
        assert_eq!(loaded.files_version("production"), 0);
    }

    #[test]
    fn test_files_version_is_a_string_on_disk() {
        let dir = TempDir::new().unwrap();
        let mut state = SyncState::new("app", "development");
        state.advance("development", 3);
        state.save(dir.path()).unwrap();

        let raw = std::fs::read_to_string(state_path(dir.path())).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["environments"]["development"]["filesVersion"], "3");
    }

    #[test]
    fn test_numeric_files_version_is_accepted() {
        let dir = TempDir::new().unwrap();
        let path = state_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            r#"{"application":"app","environment":"development","environments":{"development":{"filesVersion":7}}}"#,
        )
        .unwrap();

        let state = SyncState::load(dir.path()).unwrap().unwrap();
        assert_eq!(state.files_version("development"), 7);
    }

    #[test]
    fn test_version_never_regresses() {
        let mut state = SyncState::new("app", "development");
        assert!(state.advance("development", 5));
        assert!(!state.advance("development", 4));
        assert!(!state.advance("development", 5));
        assert_eq!(state.files_version("development"), 5);
        assert!(state.advance("development", 6));
    }

    #[test]
    fn test_missing_and_corrupt_state() {
        let dir = TempDir::new().unwrap();
        assert!(SyncState::load(dir.path()).unwrap().is_none());
        assert!(matches!(
            SyncState::load_required(dir.path()),
            Err(SyncError::MissingState { .. })
        ));

        let path = state_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{").unwrap();
        assert!(matches!(
            SyncState::load(dir.path()),
            Err(SyncError::CorruptState { .. })
        ));
    }

    #[test]
    fn test_delete() {
        let dir = TempDir::new().unwrap();
        SyncState::new("app", "development").save(dir.path()).unwrap();
        assert!(SyncState::delete(dir.path()).unwrap());
        assert!(!SyncState::delete(dir.path()).unwrap());
    }
}
