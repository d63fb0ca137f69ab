// Dev session: keep the directory and the environment in sync until stopped
//
// One task owns the FileSync. The filesystem watcher and the environment
// subscription only produce work; everything that touches the directory or
// the sync state happens on this task, one batch at a time.

use super::debounce::Debouncer;
use super::output::SyncEvent;
use super::strategy::SyncStrategy;
use super::FileSync;
use crate::directory::{IGNORE_FILE, METADATA_DIR};
use crate::error::{Result, SyncError};
use crate::lock::DevLock;
use crate::path;
use crate::shutdown::Shutdown;
use crate::transport::RemoteBatch;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

pub struct DevSession {
    sync: FileSync,
    debouncer: Debouncer,
    shutdown: Shutdown,
}

impl DevSession {
    /// Take the dev lock for the synced directory
    ///
    /// Fails with `DevAlreadyRunning` if a live process holds it.
    pub fn start(mut sync: FileSync, debounce: Duration, shutdown: Shutdown) -> Result<Self> {
        let lock = DevLock::acquire(sync.directory().root())?;
        tracing::info!(
            "Dev session started for {} (pid {})",
            sync.directory().root().display(),
            lock.info().pid
        );
        sync.hold_lock(lock);
        Ok(Self {
            sync,
            debouncer: Debouncer::new(debounce),
            shutdown,
        })
    }

    pub fn sync(&self) -> &FileSync {
        &self.sync
    }

    /// Run until shutdown or a fatal error; the lock is released either way
    pub async fn run(mut self) -> Result<()> {
        match self.sync.sync(SyncStrategy::Merge).await {
            Ok(_) => {}
            Err(e) => self.recoverable(e)?,
        }

        let (fs_tx, mut fs_rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = fs_tx.send(res);
        })
        .map_err(watch_error)?;
        watcher
            .watch(self.sync.directory().root(), RecursiveMode::Recursive)
            .map_err(watch_error)?;

        let transport = self.sync.transport();
        let mut remote = transport
            .subscribe(self.sync.files_version(), self.shutdown.clone())
            .await?;

        self.sync.reporter().progress("Watching for changes...");
        let mut shutdown = self.shutdown.clone();
        let result = loop {
            let deadline = self.debouncer.deadline();
            tokio::select! {
                _ = shutdown.wait() => break Ok(()),

                event = fs_rx.recv() => match event {
                    Some(Ok(event)) => self.observe(event),
                    Some(Err(e)) => tracing::warn!("File watcher error: {}", e),
                    None => break Err(SyncError::Unexpected("file watcher stopped".to_string())),
                },

                _ = sleep_until(deadline) => {
                    if let Some(keys) = self.debouncer.poll(Instant::now()) {
                        if let Err(e) = self.handle_local(keys).await {
                            break Err(e);
                        }
                    }
                }

                batch = remote.recv() => match batch {
                    Some(Ok(batch)) => {
                        if let Err(e) = self.handle_remote(batch).await {
                            break Err(e);
                        }
                    }
                    Some(Err(e)) => break Err(e),
                    None if self.shutdown.is_triggered() => break Ok(()),
                    None => break Err(SyncError::Unexpected("subscription ended".to_string())),
                },
            }
        };

        self.sync.reporter().finish_progress();
        drop(watcher);
        match &result {
            Ok(()) => tracing::info!("Dev session stopped"),
            Err(e) => tracing::warn!("Dev session ended: {}", e),
        }
        result
    }

    /// Feed a watcher event into the debouncer
    fn observe(&mut self, event: Event) {
        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any
        ) {
            return;
        }
        let now = Instant::now();
        for absolute in &event.paths {
            if let Some(key) = self.key_for(absolute) {
                self.debouncer.push(key, now);
            }
        }
    }

    fn key_for(&self, absolute: &Path) -> Option<String> {
        let is_dir = absolute.is_dir();
        let key = self.sync.directory().relative(absolute, is_dir).ok()?;
        if key.is_empty() || key == "/" {
            return None;
        }
        Some(key)
    }

    /// Push a debounced batch of local changes
    async fn handle_local(&mut self, keys: Vec<String>) -> Result<()> {
        if keys.iter().any(|k| k == IGNORE_FILE) {
            self.sync.directory_mut().reload_ignore()?;
        }

        let mut relevant = Vec::new();
        for key in keys {
            if path::is_under(&key, METADATA_DIR) || self.sync.directory().ignores_for_hashing(&key) {
                continue;
            }
            if self.sync.is_echo(&key)? {
                tracing::trace!("Ignoring echo of pulled {}", key);
                continue;
            }
            relevant.push(key);
        }
        if relevant.is_empty() {
            return Ok(());
        }

        tracing::debug!("{} local path(s) changed: {:?}", relevant.len(), relevant);
        match self.sync.sync(SyncStrategy::Merge).await {
            Ok(_) => Ok(()),
            Err(e) => self.recoverable(e),
        }
    }

    /// Apply an environment batch, pushing pending local edits first
    async fn handle_remote(&mut self, batch: RemoteBatch) -> Result<()> {
        if !self.debouncer.is_empty() {
            let keys = self.debouncer.flush();
            self.handle_local(keys).await?;
        }
        tracing::debug!("Received {}", batch);
        self.sync.apply_remote_batch(batch).await?;
        Ok(())
    }

    /// Errors the session reports and survives
    fn recoverable(&self, error: SyncError) -> Result<()> {
        match error {
            SyncError::UnresolvedConflicts { .. } | SyncError::Diverged { .. } => {
                tracing::warn!("{}", error);
                self.sync.reporter().emit(SyncEvent::Error {
                    message: error.to_string(),
                });
                Ok(())
            }
            other => Err(other),
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

fn watch_error(e: notify::Error) -> SyncError {
    SyncError::Unexpected(format!("failed to watch directory: {}", e))
}
