// In-process environment
//
// Keeps every published version as a snapshot and broadcasts each new
// version to subscribers. Behaves like the hosted environment as far as the
// sync engine can observe: versions only move forward, publishes are
// rejected when `expectedRemoteFilesVersion` is stale, and writing a file
// implies its ancestor directories.

use super::{
    ClientError, EnvironmentTransport, FileContent, FileSyncFiles, FileSyncHashes, GraphQLError,
    PublishInput, RemoteBatch,
};
use crate::directory::{directory_hash, hash_content};
use crate::error::{Result, SyncError};
use crate::path;
use crate::shutdown::Shutdown;
use crate::sync::changes::{get_changes, Hashes};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};

const DIR_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;

#[derive(Debug, Clone, PartialEq, Eq)]
struct StoredFile {
    mode: u32,
    content: Vec<u8>,
}

type Snapshot = BTreeMap<String, StoredFile>;

#[derive(Debug)]
struct Inner {
    /// `snapshots[v]` is the file tree at filesVersion `v`
    snapshots: Vec<Snapshot>,
    /// Number of upcoming calls that fail with a retryable error
    failures: u32,
}

impl Inner {
    fn version(&self) -> u64 {
        (self.snapshots.len() - 1) as u64
    }

    fn latest(&self) -> &Snapshot {
        &self.snapshots[self.snapshots.len() - 1]
    }

    fn snapshot(&self, version: u64) -> Result<&Snapshot> {
        self.snapshots
            .get(version as usize)
            .ok_or_else(|| unknown_version(version))
    }

    fn take_failure(&mut self) -> Result<()> {
        if self.failures > 0 {
            self.failures -= 1;
            return Err(SyncError::Client(ClientError::Http {
                status: 503,
                body: "injected failure".to_string(),
            }));
        }
        Ok(())
    }
}

/// An environment that lives in memory; clones share the same state
#[derive(Debug, Clone)]
pub struct MemoryEnvironment {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<RemoteBatch>,
}

impl Default for MemoryEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEnvironment {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                snapshots: vec![Snapshot::new()],
                failures: 0,
            })),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves a consistent snapshot list
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn version(&self) -> u64 {
        self.lock().version()
    }

    /// Write a file as if edited in the environment; returns the new version
    pub fn write(&self, key: &str, content: &[u8]) -> u64 {
        self.commit(
            vec![FileContent {
                path: key.to_string(),
                mode: FILE_MODE,
                content: content.to_vec(),
            }],
            Vec::new(),
        )
    }

    /// Delete a path as if removed in the environment; returns the new version
    pub fn delete(&self, key: &str) -> u64 {
        self.commit(Vec::new(), vec![key.to_string()])
    }

    /// Content of a file at the latest version
    pub fn content(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().latest().get(key).map(|f| f.content.clone())
    }

    pub fn hashes(&self) -> Hashes {
        hashes_of(self.lock().latest())
    }

    /// Make the next `count` calls fail with a retryable 503
    pub fn fail_next(&self, count: u32) {
        self.lock().failures = count;
    }

    /// Apply a batch as a new version and broadcast it
    fn commit(&self, changed: Vec<FileContent>, deleted: Vec<String>) -> u64 {
        let batch = {
            let mut inner = self.lock();
            let mut next = inner.latest().clone();

            for key in &deleted {
                next.retain(|k, _| k != key && !(path::is_dir_key(key) && k.starts_with(key.as_str())));
            }

            let mut applied = Vec::new();
            for file in changed {
                for ancestor in path::ancestors(&file.path) {
                    if !next.contains_key(&ancestor) {
                        next.insert(
                            ancestor.clone(),
                            StoredFile {
                                mode: DIR_MODE,
                                content: Vec::new(),
                            },
                        );
                        applied.push(FileContent {
                            path: ancestor,
                            mode: DIR_MODE,
                            content: Vec::new(),
                        });
                    }
                }
                let mode = match (file.mode, path::is_dir_key(&file.path)) {
                    (0, true) => DIR_MODE,
                    (0, false) => FILE_MODE,
                    (mode, _) => mode,
                };
                next.insert(
                    file.path.clone(),
                    StoredFile {
                        mode,
                        content: file.content.clone(),
                    },
                );
                applied.push(FileContent { mode, ..file });
            }

            inner.snapshots.push(next);
            RemoteBatch {
                remote_files_version: inner.version(),
                changed: applied,
                deleted,
            }
        };

        let version = batch.remote_files_version;
        // No subscribers is fine
        let _ = self.events.send(batch);
        version
    }
}

fn hashes_of(snapshot: &Snapshot) -> Hashes {
    snapshot
        .iter()
        .map(|(key, file)| {
            let hash = if path::is_dir_key(key) {
                directory_hash()
            } else {
                hash_content(&file.content)
            };
            (key.clone(), hash)
        })
        .collect()
}

fn unknown_version(version: u64) -> SyncError {
    SyncError::Client(ClientError::GraphQL(vec![GraphQLError {
        message: format!("unknown filesVersion {}", version),
        extensions: Some(serde_json::json!({ "code": "BAD_USER_INPUT" })),
    }]))
}

/// One batch taking `from` to `to`
fn catch_up(from: &Snapshot, to: &Snapshot, version: u64) -> RemoteBatch {
    let mut changed = Vec::new();
    let mut deleted = Vec::new();
    for change in get_changes(&hashes_of(from), &hashes_of(to)) {
        if change.is_upsert() {
            if let Some(file) = to.get(change.path()) {
                changed.push(FileContent {
                    path: change.path().to_string(),
                    mode: file.mode,
                    content: file.content.clone(),
                });
            }
        } else {
            deleted.push(change.path().to_string());
        }
    }
    RemoteBatch {
        remote_files_version: version,
        changed,
        deleted,
    }
}

#[async_trait]
impl EnvironmentTransport for MemoryEnvironment {
    async fn remote_files_version(&self) -> Result<u64> {
        let mut inner = self.lock();
        inner.take_failure()?;
        Ok(inner.version())
    }

    async fn file_sync_hashes(&self, files_version: Option<u64>) -> Result<FileSyncHashes> {
        let mut inner = self.lock();
        inner.take_failure()?;
        let version = files_version.unwrap_or_else(|| inner.version());
        Ok(FileSyncHashes {
            files_version: version,
            hashes: hashes_of(inner.snapshot(version)?),
        })
    }

    async fn file_sync_files(&self, paths: &[String], files_version: u64) -> Result<FileSyncFiles> {
        let mut inner = self.lock();
        inner.take_failure()?;
        let snapshot = inner.snapshot(files_version)?;
        let files = paths
            .iter()
            .filter_map(|key| {
                snapshot.get(key).map(|file| FileContent {
                    path: key.clone(),
                    mode: file.mode,
                    content: file.content.clone(),
                })
            })
            .collect();
        Ok(FileSyncFiles {
            files_version,
            files,
        })
    }

    async fn publish_file_sync_events(&self, input: PublishInput) -> Result<u64> {
        {
            let mut inner = self.lock();
            inner.take_failure()?;
            if input.expected_remote_files_version != inner.version() {
                return Err(SyncError::Client(ClientError::FilesVersionMismatch {
                    expected: input.expected_remote_files_version,
                }));
            }
        }
        Ok(self.commit(input.changed, input.deleted))
    }

    async fn subscribe(
        &self,
        local_files_version: u64,
        mut shutdown: Shutdown,
    ) -> Result<mpsc::Receiver<Result<RemoteBatch>>> {
        let (tx, rx) = mpsc::channel(64);
        // Subscribe before reading the catch-up state so nothing falls between
        let mut events = self.events.subscribe();

        let catch_up_batch = {
            let inner = self.lock();
            let latest = inner.version();
            if latest > local_files_version {
                let from = inner.snapshot(local_files_version)?;
                Some(catch_up(from, inner.latest(), latest))
            } else {
                None
            }
        };

        tokio::spawn(async move {
            let mut last = local_files_version;
            if let Some(batch) = catch_up_batch {
                last = batch.remote_files_version;
                if tx.send(Ok(batch)).await.is_err() {
                    return;
                }
            }

            loop {
                let batch = tokio::select! {
                    received = events.recv() => received,
                    _ = shutdown.wait() => return,
                };
                match batch {
                    Ok(batch) if batch.remote_files_version <= last => {}
                    Ok(batch) => {
                        last = batch.remote_files_version;
                        if tx.send(Ok(batch)).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Memory subscription lagged by {} batches", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(rx)
    }
}
