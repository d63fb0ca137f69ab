pub mod changes;
pub mod conflicts;
pub mod debounce;
pub mod output;
pub mod state;
pub mod strategy;
pub mod watch;

use crate::directory::{directory_hash, hash_content, Directory, METADATA_DIR};
use crate::error::{Result, SyncError};
use crate::lock::{DevLock, LockStatus};
use crate::path;
use crate::shutdown::Shutdown;
use crate::transport::{ClientError, EnvironmentTransport, FileSyncHashes, PublishInput, RemoteBatch};
use changes::{get_changes, get_changes_ignoring, get_necessary_file_changes, Change, Hashes};
use conflicts::{get_conflicts, Conflict};
use output::{Direction, Reporter, SyncEvent};
use state::SyncState;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strategy::{resolve, MergeConflictPreference, Plan, PreferencePrompt, SyncStrategy};

/// How long a pulled write is remembered for echo suppression
pub const ECHO_WINDOW: Duration = Duration::from_secs(5);

/// Step of one sync attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    ComputeHashes,
    DetectChanges,
    Resolve,
    Apply,
    PersistState,
    Committed,
    Aborted,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::ComputeHashes => "compute-hashes",
            Phase::DetectChanges => "detect-changes",
            Phase::Resolve => "resolve",
            Phase::Apply => "apply",
            Phase::PersistState => "persist-state",
            Phase::Committed => "committed",
            Phase::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Everything one attempt learns before deciding anything
#[derive(Debug, Clone)]
pub struct SyncHashes {
    /// Environment hashes at the last agreed filesVersion
    pub base: Hashes,
    pub local: Hashes,
    pub environment: Hashes,
    /// filesVersion that `environment` describes
    pub environment_version: u64,
    pub local_changes: Vec<Change>,
    pub environment_changes: Vec<Change>,
    /// Only the environment's metadata directory moved
    pub only_metadata_changed: bool,
}

/// What a finished sync did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub pushed: Vec<Change>,
    pub pulled: Vec<Change>,
    pub files_version: u64,
    pub cancelled: bool,
    pub attempts: u32,
}

/// Local changes as they were published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub changes: Vec<Change>,
    /// filesVersion the environment returned
    pub files_version: u64,
}

/// What happened to a subscription batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Applied,
    Stale,
}

/// Report for `devsync status`
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub application: String,
    pub environment: String,
    pub files_version: u64,
    pub latest_version: u64,
    pub local_changes: Vec<Change>,
    pub environment_changes: Vec<Change>,
    pub conflicts: Vec<Conflict>,
    pub dev: LockStatus,
}

/// Paths recently written by a pull, so the watcher can ignore its own echo
#[derive(Debug, Default)]
pub struct RecentWrites {
    entries: HashMap<String, (Option<String>, Instant)>,
}

impl RecentWrites {
    /// Remember `key` now holds `hash` (`None` = deleted)
    pub fn record(&mut self, key: &str, hash: Option<String>, now: Instant) {
        self.entries.insert(key.to_string(), (hash, now));
    }

    /// Whether `key` still holds exactly what a pull wrote within the window
    pub fn is_echo(&self, key: &str, current: Option<&str>, now: Instant) -> bool {
        match self.entries.get(key) {
            Some((hash, at)) => {
                now.saturating_duration_since(*at) <= ECHO_WINDOW && hash.as_deref() == current
            }
            None => false,
        }
    }

    /// Record a pulled file along with the directories written to hold it
    pub fn record_with_ancestors(&mut self, key: &str, hash: Option<String>, now: Instant) {
        if hash.is_some() {
            let dir_hash = directory_hash();
            for ancestor in path::ancestors(key) {
                self.record(&ancestor, Some(dir_hash.clone()), now);
            }
        }
        self.record(key, hash, now);
    }

    pub fn prune(&mut self, now: Instant) {
        self.entries
            .retain(|_, (_, at)| now.saturating_duration_since(*at) <= ECHO_WINDOW);
    }
}

/// Settings for a [`FileSync`]
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Application to sync; `None` means whatever the state file names
    pub application: Option<String>,
    pub environment: String,
    pub allow_unknown_directory: bool,
    pub preference: Option<MergeConflictPreference>,
    pub max_attempts: u32,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            application: None,
            environment: "development".to_string(),
            allow_unknown_directory: false,
            preference: None,
            max_attempts: 10,
        }
    }
}

enum Attempt {
    Done(SyncOutcome),
    /// The environment moved under us; start over with a merge
    Reconcile { pushed: Vec<Change>, pulled: Vec<Change> },
}

/// Sync orchestrator for one directory and one environment
pub struct FileSync {
    directory: Directory,
    transport: Arc<dyn EnvironmentTransport>,
    state: SyncState,
    environment: String,
    options: SyncOptions,
    reporter: Reporter,
    prompt: Option<Box<dyn PreferencePrompt>>,
    shutdown: Shutdown,
    recent_writes: RecentWrites,
    phase: Phase,
    /// Held for the lifetime of a dev session
    dev_lock: Option<DevLock>,
}

impl FileSync {
    /// Load (or start) the sync state of `directory`
    pub fn open(
        directory: Directory,
        transport: Arc<dyn EnvironmentTransport>,
        options: SyncOptions,
        reporter: Reporter,
        shutdown: Shutdown,
    ) -> Result<Self> {
        let root = directory.root().to_path_buf();
        let state = match (SyncState::load(&root)?, &options.application) {
            (Some(state), Some(requested)) if &state.application != requested => {
                return Err(SyncError::ApplicationMismatch {
                    path: root,
                    synced: state.application,
                    requested: requested.clone(),
                })
            }
            (Some(state), _) => state,
            (None, None) => return Err(SyncError::MissingState { path: root }),
            (None, Some(application)) => {
                if directory.has_user_files()? && !options.allow_unknown_directory {
                    return Err(SyncError::UnknownDirectory { path: root });
                }
                tracing::info!("Starting a new sync of {} in {}", application, root.display());
                SyncState::new(application.clone(), options.environment.clone())
            }
        };

        Ok(Self {
            directory,
            transport,
            state,
            environment: options.environment.clone(),
            options,
            reporter,
            prompt: None,
            shutdown,
            recent_writes: RecentWrites::default(),
            phase: Phase::Idle,
            dev_lock: None,
        })
    }

    /// Ask interactively when conflicts have no preference
    pub fn with_prompt(mut self, prompt: Box<dyn PreferencePrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    /// Bind the dev lock to this orchestrator; it is released when dropped
    pub fn hold_lock(&mut self, lock: DevLock) {
        self.dev_lock = Some(lock);
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn directory_mut(&mut self) -> &mut Directory {
        &mut self.directory
    }

    pub fn transport(&self) -> Arc<dyn EnvironmentTransport> {
        Arc::clone(&self.transport)
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn application(&self) -> &str {
        &self.state.application
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn files_version(&self) -> u64 {
        self.state.files_version(&self.environment)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    pub fn recent_writes(&self) -> &RecentWrites {
        &self.recent_writes
    }

    fn enter(&mut self, phase: Phase) {
        tracing::debug!("Sync phase {} -> {}", self.phase, phase);
        self.phase = phase;
    }

    /// Drop paths the local directory never syncs
    fn visible(&self, hashes: Hashes) -> Hashes {
        hashes
            .into_iter()
            .filter(|(key, _)| !self.directory.ignores_for_hashing(key))
            .collect()
    }

    /// Compute local and environment changes since the last agreed version
    pub async fn hashes(&mut self) -> Result<SyncHashes> {
        self.enter(Phase::ComputeHashes);
        let recorded = self.files_version();

        let base = if recorded == 0 {
            FileSyncHashes::default()
        } else {
            self.transport.file_sync_hashes(Some(recorded)).await?
        };
        // Nothing published since the last sync: the base is the environment
        let remote = if recorded > 0 && self.transport.remote_files_version().await? == recorded {
            base.clone()
        } else {
            self.transport.file_sync_hashes(None).await?
        };
        let local = self.directory.hashes()?;

        let base = self.visible(base.hashes);
        let environment = self.visible(remote.hashes);

        self.enter(Phase::DetectChanges);
        let local_changes = get_necessary_file_changes(
            &get_changes_ignoring(&base, &local, &[METADATA_DIR]),
            &environment,
        );
        let environment_changes =
            get_necessary_file_changes(&get_changes(&base, &environment), &local);
        let only_metadata_changed = !environment_changes.is_empty()
            && environment_changes
                .iter()
                .all(|c| path::is_under(c.path(), METADATA_DIR));

        tracing::debug!(
            "{} local change(s), {} environment change(s) since version {}",
            local_changes.len(),
            environment_changes.len(),
            recorded
        );

        Ok(SyncHashes {
            base,
            local,
            environment,
            environment_version: remote.files_version,
            local_changes,
            environment_changes,
            only_metadata_changed,
        })
    }

    /// Sync both ways under `strategy`
    ///
    /// The whole attempt is recomputed when the environment moves while it
    /// runs, up to the configured number of attempts.
    pub async fn sync(&mut self, strategy: SyncStrategy) -> Result<SyncOutcome> {
        let started = Instant::now();
        self.reporter.emit(SyncEvent::Start {
            application: self.state.application.clone(),
            environment: self.environment.clone(),
            strategy: strategy.to_string(),
            files_version: self.files_version(),
        });

        let max_attempts = self.options.max_attempts.max(1);
        let mut strategy = strategy;
        let mut pushed = Vec::new();
        let mut pulled = Vec::new();

        for attempt in 1..=max_attempts {
            if self.shutdown.is_triggered() {
                self.enter(Phase::Aborted);
                return Err(SyncError::Cancelled);
            }
            self.reporter.progress("Comparing files...");

            let result = self.attempt(strategy).await;
            let outcome = match result {
                Ok(Attempt::Done(mut outcome)) => {
                    pushed.append(&mut outcome.pushed);
                    pulled.append(&mut outcome.pulled);
                    outcome.pushed = pushed;
                    outcome.pulled = pulled;
                    outcome.attempts = attempt;
                    outcome
                }
                Ok(Attempt::Reconcile {
                    pushed: mut p,
                    pulled: mut l,
                }) => {
                    pushed.append(&mut p);
                    pulled.append(&mut l);
                    tracing::info!("Environment changed during sync, reconciling (attempt {})", attempt);
                    strategy = SyncStrategy::Merge;
                    continue;
                }
                Err(SyncError::Client(ClientError::FilesVersionMismatch { expected })) => {
                    tracing::warn!(
                        "Environment moved past version {} while syncing, retrying (attempt {}/{})",
                        expected,
                        attempt,
                        max_attempts
                    );
                    continue;
                }
                Err(e) => {
                    self.enter(Phase::Aborted);
                    self.reporter.finish_progress();
                    return Err(e);
                }
            };

            self.reporter.finish_progress();
            if outcome.cancelled {
                self.reporter.emit(SyncEvent::Cancelled {
                    reason: "conflicts were not resolved".to_string(),
                });
            } else {
                self.reporter.emit(SyncEvent::Summary {
                    pushed: outcome.pushed.len(),
                    pulled: outcome.pulled.len(),
                    files_version: outcome.files_version,
                    duration_secs: started.elapsed().as_secs_f64(),
                });
            }
            return Ok(outcome);
        }

        self.enter(Phase::Aborted);
        self.reporter.finish_progress();
        Err(SyncError::TooManySyncAttempts {
            attempts: max_attempts,
        })
    }

    /// Push local changes, overwriting the environment
    ///
    /// Refuses when the environment has changes of its own unless `force`.
    pub async fn push(&mut self, force: bool) -> Result<SyncOutcome> {
        if !force {
            let hashes = self.hashes().await?;
            let diverged = hashes
                .environment_changes
                .iter()
                .filter(|c| !path::is_under(c.path(), METADATA_DIR))
                .count();
            if diverged > 0 {
                self.enter(Phase::Aborted);
                return Err(SyncError::Diverged {
                    side: "environment",
                    count: diverged,
                });
            }
        }
        self.sync(SyncStrategy::Push).await
    }

    /// Pull environment changes, overwriting the local directory
    ///
    /// Refuses when the local directory has changes of its own unless `force`.
    pub async fn pull(&mut self, force: bool) -> Result<SyncOutcome> {
        if !force {
            let hashes = self.hashes().await?;
            if !hashes.local_changes.is_empty() {
                self.enter(Phase::Aborted);
                return Err(SyncError::Diverged {
                    side: "local directory",
                    count: hashes.local_changes.len(),
                });
            }
        }
        self.sync(SyncStrategy::Pull).await
    }

    async fn attempt(&mut self, strategy: SyncStrategy) -> Result<Attempt> {
        let hashes = self.hashes().await?;
        let conflicts = get_conflicts(&hashes.local_changes, &hashes.environment_changes);

        // Metadata is environment authoritative and not worth reporting alone
        let quiet_pull = hashes.only_metadata_changed && hashes.local_changes.is_empty();
        if quiet_pull {
            tracing::debug!("Only environment metadata changed");
        }

        self.enter(Phase::Resolve);
        let preference = if strategy == SyncStrategy::Merge && !conflicts.is_empty() {
            self.reporter.finish_progress();
            self.reporter.conflicts(&conflicts);
            self.choose_preference(&conflicts).await
        } else {
            self.options.preference
        };

        let plan = resolve(
            strategy,
            preference,
            &hashes.local_changes,
            &hashes.environment_changes,
            &conflicts,
        )?;

        let (push, pull) = match plan {
            Plan::Cancel => {
                self.enter(Phase::Aborted);
                tracing::info!("Sync cancelled, nothing was changed");
                return Ok(Attempt::Done(SyncOutcome {
                    files_version: self.files_version(),
                    cancelled: true,
                    ..SyncOutcome::default()
                }));
            }
            Plan::Apply { push, pull } => (push, pull),
        };

        self.enter(Phase::Apply);
        let version = hashes.environment_version;
        if !pull.is_empty() {
            if !quiet_pull {
                self.reporter.progress(&format!("Pulling {} change(s)...", pull.len()));
            }
            self.apply_pull(&pull, version).await?;
            if !quiet_pull {
                self.reporter.changes(Direction::Pull, &pull);
            }
        }

        // Local now matches the environment at `version`, except for `push`
        self.enter(Phase::PersistState);
        if self.state.advance(&self.environment, version) || self.state_is_new() {
            self.save_state()?;
        }

        if push.is_empty() {
            self.enter(Phase::Committed);
            return Ok(Attempt::Done(SyncOutcome {
                pulled: pull,
                files_version: self.files_version(),
                ..SyncOutcome::default()
            }));
        }

        self.enter(Phase::Apply);
        self.reporter.progress(&format!("Pushing {} change(s)...", push.len()));
        let Some(Published {
            changes: push,
            files_version: published,
        }) = self.apply_push(&push, version).await?
        else {
            // Every local change vanished before it could be read
            self.enter(Phase::Committed);
            return Ok(Attempt::Done(SyncOutcome {
                pulled: pull,
                files_version: self.files_version(),
                ..SyncOutcome::default()
            }));
        };
        self.reporter.changes(Direction::Push, &push);

        self.enter(Phase::PersistState);
        if published == version + 1 {
            self.state.advance(&self.environment, published);
            self.save_state()?;
            self.enter(Phase::Committed);
            Ok(Attempt::Done(SyncOutcome {
                pushed: push,
                pulled: pull,
                files_version: self.files_version(),
                ..SyncOutcome::default()
            }))
        } else {
            // Someone else published between our read and our write
            tracing::info!(
                "Environment jumped from {} to {} while pushing",
                version,
                published
            );
            Ok(Attempt::Reconcile { pushed: push, pulled: pull })
        }
    }

    async fn choose_preference(&self, conflicts: &[Conflict]) -> Option<MergeConflictPreference> {
        if self.options.preference.is_some() {
            return self.options.preference;
        }
        let prompt = self.prompt.as_ref()?;
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            choice = prompt.choose(conflicts) => choice.or(Some(MergeConflictPreference::Cancel)),
            _ = shutdown.wait() => Some(MergeConflictPreference::Cancel),
        }
    }

    fn state_is_new(&self) -> bool {
        !crate::sync::state::state_path(self.directory.root()).exists()
    }

    fn save_state(&self) -> Result<()> {
        self.state.save(self.directory.root())
    }

    /// Apply environment changes locally
    ///
    /// Deletes run deepest first, then directories and files are written.
    /// Every file that is replaced or removed is backed up first.
    pub async fn apply_pull(&mut self, changes: &[Change], files_version: u64) -> Result<()> {
        let mut deletes: Vec<&Change> = changes.iter().filter(|c| !c.is_upsert()).collect();
        deletes.sort_by(|a, b| depth(b.path()).cmp(&depth(a.path())).then(b.path().cmp(a.path())));

        let now = Instant::now();
        for change in deletes {
            if self.directory.remove(change.path())? {
                self.recent_writes.record(change.path(), None, now);
            }
        }

        let upserts: Vec<&Change> = changes.iter().filter(|c| c.is_upsert()).collect();
        for change in upserts.iter().filter(|c| path::is_dir_key(c.path())) {
            self.directory.create_dir(change.path())?;
            self.recent_writes
                .record_with_ancestors(change.path(), Some(directory_hash()), now);
        }

        let files: Vec<String> = upserts
            .iter()
            .filter(|c| !path::is_dir_key(c.path()))
            .map(|c| c.path().to_string())
            .collect();
        if files.is_empty() {
            return Ok(());
        }

        let fetched = self.transport.file_sync_files(&files, files_version).await?;
        let mut written = 0;
        for file in fetched.files {
            self.directory.backup(&file.path)?;
            self.directory.write_file(&file.path, &file.content, file.mode)?;
            self.recent_writes.record_with_ancestors(
                &file.path,
                Some(hash_content(&file.content)),
                Instant::now(),
            );
            written += 1;
        }
        if written != files.len() {
            return Err(SyncError::Unexpected(format!(
                "environment returned {} of {} requested files at version {}",
                written,
                files.len(),
                files_version
            )));
        }

        tracing::info!("Pulled {} change(s) at version {}", changes.len(), files_version);
        Ok(())
    }

    /// Publish local changes
    ///
    /// Files are read from disk now, so a file that vanished since it was
    /// hashed is published as a delete (or dropped, if the environment never
    /// had it). Returns what was actually published, or `None` when nothing
    /// was left to publish.
    pub async fn apply_push(&mut self, changes: &[Change], expected: u64) -> Result<Option<Published>> {
        let mut input = PublishInput {
            expected_remote_files_version: expected,
            ..PublishInput::default()
        };
        let mut published = Vec::with_capacity(changes.len());

        for change in changes {
            if change.is_upsert() && self.directory.hash_of(change.path())?.is_none() {
                match change.from_hash() {
                    Some(from_hash) => {
                        tracing::debug!("{} disappeared before push, deleting instead", change.path());
                        input.deleted.push(change.path().to_string());
                        published.push(Change::Delete {
                            path: change.path().to_string(),
                            from_hash: from_hash.to_string(),
                        });
                    }
                    None => tracing::debug!("{} disappeared before push, skipping", change.path()),
                }
                continue;
            }
            if change.is_upsert() {
                input.changed.push(self.directory.read_file(change.path())?);
            } else {
                input.deleted.push(change.path().to_string());
            }
            published.push(change.clone());
        }

        if input.is_empty() {
            return Ok(None);
        }
        let version = self.transport.publish_file_sync_events(input).await?;
        tracing::info!("Pushed {} change(s), environment is at version {}", published.len(), version);
        Ok(Some(Published {
            changes: published,
            files_version: version,
        }))
    }

    /// Apply a batch delivered by the subscription
    ///
    /// Batches at or below the recorded filesVersion are stale and ignored.
    pub async fn apply_remote_batch(&mut self, batch: RemoteBatch) -> Result<BatchOutcome> {
        let recorded = self.files_version();
        if batch.remote_files_version <= recorded {
            tracing::warn!(
                "Ignoring stale batch at version {} (recorded {})",
                batch.remote_files_version,
                recorded
            );
            return Ok(BatchOutcome::Stale);
        }

        self.enter(Phase::Apply);
        let deleted = self.expand_deletes(&batch.deleted).await?;
        let now = Instant::now();
        for key in &deleted {
            if self.directory.remove(key)? {
                self.recent_writes.record(key, None, now);
            }
        }

        let mut changed = 0;
        for file in &batch.changed {
            if self.directory.ignores_for_hashing(&file.path) {
                continue;
            }
            if path::is_dir_key(&file.path) {
                self.directory.create_dir(&file.path)?;
                self.recent_writes
                    .record_with_ancestors(&file.path, Some(directory_hash()), now);
            } else {
                self.directory.backup(&file.path)?;
                self.directory.write_file(&file.path, &file.content, file.mode)?;
                self.recent_writes
                    .record_with_ancestors(&file.path, Some(hash_content(&file.content)), now);
            }
            changed += 1;
        }

        self.enter(Phase::PersistState);
        self.state.advance(&self.environment, batch.remote_files_version);
        self.save_state()?;
        self.enter(Phase::Committed);

        self.reporter.emit(SyncEvent::Batch {
            direction: Direction::Pull,
            files_version: batch.remote_files_version,
            changed,
            deleted: deleted.len(),
        });
        Ok(BatchOutcome::Applied)
    }

    /// Keys a batch deletes, deepest first
    ///
    /// A batch names only a deleted directory, not its contents. The files
    /// it held at the recorded version are deleted with it; anything created
    /// locally since then stays, and so does the directory holding it.
    async fn expand_deletes(&self, deleted: &[String]) -> Result<Vec<String>> {
        let mut keys: BTreeSet<String> = deleted
            .iter()
            .filter(|key| !self.directory.ignores_for_hashing(key))
            .cloned()
            .collect();

        let dirs: Vec<String> = keys.iter().filter(|k| path::is_dir_key(k)).cloned().collect();
        let recorded = self.files_version();
        if !dirs.is_empty() && recorded > 0 {
            let tracked = self.transport.file_sync_hashes(Some(recorded)).await?.hashes;
            for dir in &dirs {
                keys.extend(
                    tracked
                        .keys()
                        .filter(|k| path::is_under(k, dir) && !self.directory.ignores_for_hashing(k))
                        .cloned(),
                );
            }
        }

        let mut keys: Vec<String> = keys.into_iter().collect();
        keys.sort_by(|a, b| depth(b).cmp(&depth(a)).then(b.cmp(a)));
        Ok(keys)
    }

    /// Whether a watcher event for `key` only reflects our own pull
    pub fn is_echo(&mut self, key: &str) -> Result<bool> {
        let now = Instant::now();
        self.recent_writes.prune(now);
        let current = self.directory.hash_of(key)?;
        Ok(self.recent_writes.is_echo(key, current.as_deref(), now))
    }

    /// Local and environment changes without touching either side
    pub async fn status(&mut self) -> Result<StatusReport> {
        let hashes = self.hashes().await?;
        let conflicts = get_conflicts(&hashes.local_changes, &hashes.environment_changes);
        self.enter(Phase::Idle);
        Ok(StatusReport {
            application: self.state.application.clone(),
            environment: self.environment.clone(),
            files_version: self.files_version(),
            latest_version: hashes.environment_version,
            local_changes: hashes.local_changes,
            environment_changes: hashes.environment_changes,
            conflicts,
            dev: DevLock::status(self.directory.root()),
        })
    }
}

fn depth(key: &str) -> usize {
    key.trim_end_matches('/').matches('/').count()
}
