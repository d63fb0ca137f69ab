use async_trait::async_trait;
use devsync::directory::{hash_content, Directory};
use devsync::shutdown::{self, Shutdown, ShutdownTrigger};
use devsync::sync::changes::Change;
use devsync::sync::output::Reporter;
use devsync::sync::state::SyncState;
use devsync::sync::strategy::{MergeConflictPreference, SyncStrategy};
use devsync::sync::{BatchOutcome, FileSync, Phase, SyncOptions};
use devsync::transport::{
    EnvironmentTransport, FileContent, FileSyncFiles, FileSyncHashes, MemoryEnvironment,
    PublishInput, RemoteBatch,
};
use devsync::{Result, SyncError};
use std::fs;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;

fn options(preference: Option<MergeConflictPreference>) -> SyncOptions {
    SyncOptions {
        application: Some("shop".to_string()),
        preference,
        max_attempts: 3,
        ..SyncOptions::default()
    }
}

fn open_with(
    dir: &Path,
    transport: Arc<dyn EnvironmentTransport>,
    options: SyncOptions,
    shutdown: Shutdown,
) -> Result<FileSync> {
    FileSync::open(
        Directory::open(dir)?,
        transport,
        options,
        Reporter::quiet(),
        shutdown,
    )
}

/// A `FileSync` together with the trigger that keeps its shutdown signal armed
struct Harness {
    inner: FileSync,
    _trigger: ShutdownTrigger,
}

impl Deref for Harness {
    type Target = FileSync;

    fn deref(&self) -> &FileSync {
        &self.inner
    }
}

impl DerefMut for Harness {
    fn deref_mut(&mut self) -> &mut FileSync {
        &mut self.inner
    }
}

fn harness(dir: &Path, env: &MemoryEnvironment, options: SyncOptions) -> Harness {
    let (trigger, shutdown) = shutdown::channel();
    Harness {
        inner: open_with(dir, Arc::new(env.clone()), options, shutdown).unwrap(),
        _trigger: trigger,
    }
}

fn open(dir: &Path, env: &MemoryEnvironment) -> Harness {
    harness(dir, env, options(None))
}

fn open_preferring(dir: &Path, env: &MemoryEnvironment, preference: MergeConflictPreference) -> Harness {
    harness(dir, env, options(Some(preference)))
}

fn read(dir: &Path, key: &str) -> String {
    fs::read_to_string(dir.join(key)).unwrap()
}

fn recorded_version(dir: &Path) -> u64 {
    SyncState::load_required(dir).unwrap().files_version("development")
}

/// Environment with `a.txt` and `b.txt`, and a directory synced to it
async fn synced_pair() -> (TempDir, MemoryEnvironment) {
    let env = MemoryEnvironment::new();
    env.write("a.txt", b"a0");
    env.write("b.txt", b"b0");
    let dir = TempDir::new().unwrap();
    open(dir.path(), &env).sync(SyncStrategy::Merge).await.unwrap();
    (dir, env)
}

#[tokio::test]
async fn test_first_sync_pulls_everything() {
    let env = MemoryEnvironment::new();
    env.write("index.js", b"console.log('hi')");
    env.write("src/app.js", b"export {}");
    let dir = TempDir::new().unwrap();

    let mut sync = open(dir.path(), &env);
    let outcome = sync.sync(SyncStrategy::Merge).await.unwrap();

    assert!(!outcome.cancelled);
    assert!(outcome.pushed.is_empty());
    assert_eq!(outcome.files_version, env.version());
    assert_eq!(read(dir.path(), "index.js"), "console.log('hi')");
    assert_eq!(read(dir.path(), "src/app.js"), "export {}");
    assert_eq!(sync.phase(), Phase::Committed);
    assert_eq!(recorded_version(dir.path()), env.version());
}

#[tokio::test]
async fn test_first_sync_of_empty_environment_saves_state() {
    let env = MemoryEnvironment::new();
    let dir = TempDir::new().unwrap();

    let outcome = open(dir.path(), &env).sync(SyncStrategy::Merge).await.unwrap();
    assert_eq!(outcome.files_version, 0);
    assert_eq!(recorded_version(dir.path()), 0);
}

#[tokio::test]
async fn test_unknown_directory_requires_opt_in() {
    let env = MemoryEnvironment::new();
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("local.txt"), "mine").unwrap();

    let (_trigger, shutdown) = shutdown::channel();
    let refused = open_with(dir.path(), Arc::new(env.clone()), options(None), shutdown.clone());
    assert!(matches!(refused, Err(SyncError::UnknownDirectory { .. })));

    let allowed = SyncOptions {
        allow_unknown_directory: true,
        ..options(None)
    };
    let mut sync = open_with(dir.path(), Arc::new(env.clone()), allowed, shutdown).unwrap();
    let outcome = sync.sync(SyncStrategy::Merge).await.unwrap();

    assert_eq!(outcome.pushed.len(), 1);
    assert_eq!(env.content("local.txt").unwrap(), b"mine");
    assert_eq!(recorded_version(dir.path()), env.version());
}

#[tokio::test]
async fn test_application_mismatch() {
    let (dir, env) = synced_pair().await;
    let (_trigger, shutdown) = shutdown::channel();
    let other = SyncOptions {
        application: Some("blog".to_string()),
        ..options(None)
    };
    let result = open_with(dir.path(), Arc::new(env), other, shutdown);
    assert!(matches!(result, Err(SyncError::ApplicationMismatch { .. })));
}

#[tokio::test]
async fn test_merge_without_conflicts() {
    let (dir, env) = synced_pair().await;
    fs::write(dir.path().join("a.txt"), "a1").unwrap();
    env.write("b.txt", b"b1");
    let before = env.version();

    let outcome = open(dir.path(), &env).sync(SyncStrategy::Merge).await.unwrap();

    assert_eq!(outcome.pushed.len(), 1);
    assert_eq!(outcome.pulled.len(), 1);
    assert_eq!(env.content("a.txt").unwrap(), b"a1");
    assert_eq!(read(dir.path(), "b.txt"), "b1");
    assert_eq!(env.version(), before + 1);
    assert_eq!(recorded_version(dir.path()), before + 1);
}

#[tokio::test]
async fn test_merge_conflict_without_preference_changes_nothing() {
    let (dir, env) = synced_pair().await;
    fs::write(dir.path().join("a.txt"), "local").unwrap();
    env.write("a.txt", b"remote");
    let recorded = recorded_version(dir.path());

    let result = open(dir.path(), &env).sync(SyncStrategy::Merge).await;

    assert!(matches!(result, Err(SyncError::UnresolvedConflicts { count: 1 })));
    assert_eq!(read(dir.path(), "a.txt"), "local");
    assert_eq!(env.content("a.txt").unwrap(), b"remote");
    assert_eq!(recorded_version(dir.path()), recorded);
}

#[tokio::test]
async fn test_merge_conflict_prefer_local() {
    let (dir, env) = synced_pair().await;
    fs::write(dir.path().join("a.txt"), "local").unwrap();
    env.write("a.txt", b"remote");
    env.write("b.txt", b"b1");

    open_preferring(dir.path(), &env, MergeConflictPreference::Local)
        .sync(SyncStrategy::Merge)
        .await
        .unwrap();

    assert_eq!(env.content("a.txt").unwrap(), b"local");
    assert_eq!(read(dir.path(), "b.txt"), "b1");
    assert_eq!(recorded_version(dir.path()), env.version());
}

#[tokio::test]
async fn test_merge_conflict_prefer_environment_backs_up() {
    let (dir, env) = synced_pair().await;
    fs::write(dir.path().join("a.txt"), "local").unwrap();
    env.write("a.txt", b"remote");

    open_preferring(dir.path(), &env, MergeConflictPreference::Environment)
        .sync(SyncStrategy::Merge)
        .await
        .unwrap();

    assert_eq!(read(dir.path(), "a.txt"), "remote");
    assert_eq!(read(dir.path(), ".devsync/backup/a.txt"), "local");
    assert_eq!(env.content("a.txt").unwrap(), b"remote");
}

#[tokio::test]
async fn test_cancel_preference_aborts() {
    let (dir, env) = synced_pair().await;
    fs::write(dir.path().join("a.txt"), "local").unwrap();
    env.write("a.txt", b"remote");

    let mut sync = open_preferring(dir.path(), &env, MergeConflictPreference::Cancel);
    let outcome = sync.sync(SyncStrategy::Merge).await.unwrap();

    assert!(outcome.cancelled);
    assert_eq!(sync.phase(), Phase::Aborted);
    assert_eq!(read(dir.path(), "a.txt"), "local");
    assert_eq!(env.content("a.txt").unwrap(), b"remote");
}

#[tokio::test]
async fn test_push_refuses_diverged_environment() {
    let (dir, env) = synced_pair().await;
    env.write("b.txt", b"remote edit");

    let result = open(dir.path(), &env).push(false).await;
    assert!(matches!(
        result,
        Err(SyncError::Diverged {
            side: "environment",
            count: 1
        })
    ));
    assert_eq!(env.content("b.txt").unwrap(), b"remote edit");
}

#[tokio::test]
async fn test_push_force_overwrites_environment() {
    let (dir, env) = synced_pair().await;
    fs::write(dir.path().join("a.txt"), "a1").unwrap();
    env.write("b.txt", b"remote edit");
    env.write("extra.txt", b"remote only");

    open(dir.path(), &env).push(true).await.unwrap();

    assert_eq!(env.content("a.txt").unwrap(), b"a1");
    assert_eq!(env.content("b.txt").unwrap(), b"b0");
    assert!(env.content("extra.txt").is_none());
    assert_eq!(read(dir.path(), "b.txt"), "b0");
    assert_eq!(recorded_version(dir.path()), env.version());
}

#[tokio::test]
async fn test_pull_refuses_local_changes() {
    let (dir, env) = synced_pair().await;
    fs::write(dir.path().join("a.txt"), "a1").unwrap();

    let result = open(dir.path(), &env).pull(false).await;
    assert!(matches!(
        result,
        Err(SyncError::Diverged {
            side: "local directory",
            count: 1
        })
    ));
    assert_eq!(read(dir.path(), "a.txt"), "a1");
}

#[tokio::test]
async fn test_pull_force_overwrites_local() {
    let (dir, env) = synced_pair().await;
    fs::write(dir.path().join("a.txt"), "a1").unwrap();
    fs::write(dir.path().join("scratch.txt"), "local only").unwrap();
    env.write("b.txt", b"b1");
    let before = env.version();

    let outcome = open(dir.path(), &env).pull(true).await.unwrap();

    assert!(outcome.pushed.is_empty());
    assert_eq!(read(dir.path(), "a.txt"), "a0");
    assert_eq!(read(dir.path(), "b.txt"), "b1");
    assert!(!dir.path().join("scratch.txt").exists());
    assert_eq!(read(dir.path(), ".devsync/backup/scratch.txt"), "local only");
    assert_eq!(env.version(), before);
    assert_eq!(recorded_version(dir.path()), before);
}

#[tokio::test]
async fn test_deletes_propagate_both_ways() {
    let env = MemoryEnvironment::new();
    env.write("docs/one.md", b"1");
    env.write("docs/two.md", b"2");
    env.write("keep.txt", b"k");
    let dir = TempDir::new().unwrap();
    open(dir.path(), &env).sync(SyncStrategy::Merge).await.unwrap();

    env.delete("docs/");
    fs::remove_file(dir.path().join("keep.txt")).unwrap();
    open(dir.path(), &env).sync(SyncStrategy::Merge).await.unwrap();

    assert!(!dir.path().join("docs").exists());
    assert!(env.content("keep.txt").is_none());
}

#[tokio::test]
async fn test_stale_remote_batch_is_ignored() {
    let (dir, env) = synced_pair().await;
    let recorded = recorded_version(dir.path());
    let mut sync = open(dir.path(), &env);

    let stale = RemoteBatch {
        remote_files_version: recorded,
        changed: vec![FileContent {
            path: "a.txt".to_string(),
            mode: 0o644,
            content: b"old news".to_vec(),
        }],
        deleted: Vec::new(),
    };
    assert_eq!(sync.apply_remote_batch(stale).await.unwrap(), BatchOutcome::Stale);
    assert_eq!(read(dir.path(), "a.txt"), "a0");
    assert_eq!(recorded_version(dir.path()), recorded);
}

#[tokio::test]
async fn test_remote_batch_applies_and_advances() {
    let (dir, env) = synced_pair().await;
    let recorded = recorded_version(dir.path());
    let mut sync = open(dir.path(), &env);

    let batch = RemoteBatch {
        remote_files_version: recorded + 2,
        changed: vec![FileContent {
            path: "lib/new.js".to_string(),
            mode: 0o644,
            content: b"new".to_vec(),
        }],
        deleted: vec!["b.txt".to_string()],
    };
    assert_eq!(sync.apply_remote_batch(batch).await.unwrap(), BatchOutcome::Applied);
    assert_eq!(read(dir.path(), "lib/new.js"), "new");
    assert!(!dir.path().join("b.txt").exists());
    assert_eq!(read(dir.path(), ".devsync/backup/b.txt"), "b0");
    assert_eq!(recorded_version(dir.path()), recorded + 2);

    // Pulled files are echoes until edited
    assert!(sync.is_echo("lib/new.js").unwrap());
    assert!(sync.is_echo("lib/").unwrap());
    fs::write(dir.path().join("lib/new.js"), "edited").unwrap();
    assert!(!sync.is_echo("lib/new.js").unwrap());
}

#[tokio::test]
async fn test_version_never_regresses() {
    let (dir, env) = synced_pair().await;
    let mut sync = open(dir.path(), &env);
    let recorded = sync.files_version();

    let newer = RemoteBatch {
        remote_files_version: recorded + 5,
        changed: Vec::new(),
        deleted: Vec::new(),
    };
    sync.apply_remote_batch(newer).await.unwrap();

    let older = RemoteBatch {
        remote_files_version: recorded + 3,
        changed: Vec::new(),
        deleted: Vec::new(),
    };
    assert_eq!(sync.apply_remote_batch(older).await.unwrap(), BatchOutcome::Stale);
    assert_eq!(sync.files_version(), recorded + 5);
    assert_eq!(recorded_version(dir.path()), recorded + 5);
}

#[tokio::test]
async fn test_environment_directory_delete_keeps_local_creates() {
    let env = MemoryEnvironment::new();
    env.write("src/a.js", b"a");
    let dir = TempDir::new().unwrap();
    open(dir.path(), &env).sync(SyncStrategy::Merge).await.unwrap();

    env.delete("src/");
    fs::write(dir.path().join("src/new.js"), "mine").unwrap();

    let mut sync = open(dir.path(), &env);
    let outcome = sync.sync(SyncStrategy::Merge).await.unwrap();

    let pushed: Vec<&str> = outcome.pushed.iter().map(|c| c.path()).collect();
    assert_eq!(pushed, vec!["src/new.js"]);
    assert!(outcome.pushed[0].is_upsert());
    assert_eq!(read(dir.path(), "src/new.js"), "mine");
    assert_eq!(env.content("src/new.js"), Some(b"mine".to_vec()));
    assert!(!dir.path().join("src/a.js").exists());
    assert_eq!(read(dir.path(), ".devsync/backup/src/a.js"), "a");

    // Both sides agree afterwards
    let again = sync.sync(SyncStrategy::Merge).await.unwrap();
    assert!(again.pushed.is_empty());
    assert!(again.pulled.is_empty());
}

#[tokio::test]
async fn test_remote_batch_directory_delete_keeps_local_creates() {
    let env = MemoryEnvironment::new();
    env.write("src/a.js", b"a");
    let dir = TempDir::new().unwrap();
    open(dir.path(), &env).sync(SyncStrategy::Merge).await.unwrap();
    fs::write(dir.path().join("src/new.js"), "mine").unwrap();

    let mut sync = open(dir.path(), &env);
    let batch = RemoteBatch {
        remote_files_version: env.delete("src/"),
        changed: Vec::new(),
        deleted: vec!["src/".to_string()],
    };
    assert_eq!(sync.apply_remote_batch(batch).await.unwrap(), BatchOutcome::Applied);

    assert!(!dir.path().join("src/a.js").exists());
    assert_eq!(read(dir.path(), ".devsync/backup/src/a.js"), "a");
    assert_eq!(read(dir.path(), "src/new.js"), "mine");

    sync.sync(SyncStrategy::Merge).await.unwrap();
    assert_eq!(env.content("src/new.js"), Some(b"mine".to_vec()));
    assert!(env.content("src/a.js").is_none());
}

#[tokio::test]
async fn test_backup_of_file_does_not_block_later_directory_backups() {
    let env = MemoryEnvironment::new();
    env.write("lib", b"was a file");
    let dir = TempDir::new().unwrap();
    let mut sync = open(dir.path(), &env);
    sync.sync(SyncStrategy::Merge).await.unwrap();

    env.delete("lib");
    sync.sync(SyncStrategy::Merge).await.unwrap();
    assert_eq!(read(dir.path(), ".devsync/backup/lib"), "was a file");

    env.write("lib/x.js", b"v1");
    sync.sync(SyncStrategy::Merge).await.unwrap();
    env.write("lib/x.js", b"v2");
    sync.sync(SyncStrategy::Merge).await.unwrap();

    assert_eq!(read(dir.path(), "lib/x.js"), "v2");
    assert_eq!(read(dir.path(), ".devsync/backup/lib/x.js"), "v1");
    assert_eq!(recorded_version(dir.path()), env.version());
}

#[tokio::test]
async fn test_push_reports_vanished_files_as_published() {
    let (dir, env) = synced_pair().await;
    let mut sync = open(dir.path(), &env);
    let version = env.version();
    fs::remove_file(dir.path().join("a.txt")).unwrap();

    let changes = vec![
        Change::Update {
            path: "a.txt".to_string(),
            from_hash: hash_content(b"a0"),
            to_hash: hash_content(b"a1"),
        },
        Change::Create {
            path: "never-pushed.txt".to_string(),
            to_hash: hash_content(b"n"),
        },
    ];
    let published = sync.apply_push(&changes, version).await.unwrap().unwrap();

    assert_eq!(
        published.changes,
        vec![Change::Delete {
            path: "a.txt".to_string(),
            from_hash: hash_content(b"a0"),
        }]
    );
    assert_eq!(published.files_version, version + 1);
    assert!(env.content("a.txt").is_none());
    assert!(env.content("never-pushed.txt").is_none());
}

#[tokio::test]
async fn test_push_of_only_vanished_creates_publishes_nothing() {
    let (dir, env) = synced_pair().await;
    let mut sync = open(dir.path(), &env);
    let version = env.version();

    let changes = vec![Change::Create {
        path: "never-pushed.txt".to_string(),
        to_hash: hash_content(b"n"),
    }];
    assert!(sync.apply_push(&changes, version).await.unwrap().is_none());
    assert_eq!(env.version(), version);
}

#[tokio::test]
async fn test_metadata_is_pulled_and_never_pushed() {
    let (dir, env) = synced_pair().await;
    env.write(".devsync/settings.json", b"{\"runtime\":\"node\"}");

    open(dir.path(), &env).sync(SyncStrategy::Merge).await.unwrap();
    assert_eq!(read(dir.path(), ".devsync/settings.json"), "{\"runtime\":\"node\"}");

    fs::write(dir.path().join(".devsync/settings.json"), "{}").unwrap();
    fs::write(dir.path().join(".devsync/local-only.json"), "{}").unwrap();
    let before = env.version();
    let outcome = open(dir.path(), &env).sync(SyncStrategy::Merge).await.unwrap();

    assert!(outcome.pushed.is_empty());
    assert_eq!(env.version(), before);
    assert_eq!(env.content(".devsync/settings.json").unwrap(), b"{\"runtime\":\"node\"}");
    assert!(env.content(".devsync/local-only.json").is_none());
    assert!(env.content(".devsync/sync.json").is_none());
}

#[tokio::test]
async fn test_status_reports_without_changing_anything() {
    let (dir, env) = synced_pair().await;
    fs::write(dir.path().join("a.txt"), "local").unwrap();
    env.write("a.txt", b"remote");
    env.write("c.txt", b"c");
    let recorded = recorded_version(dir.path());

    let report = open(dir.path(), &env).status().await.unwrap();

    assert_eq!(report.files_version, recorded);
    assert_eq!(report.latest_version, env.version());
    assert_eq!(report.local_changes.len(), 1);
    assert_eq!(report.environment_changes.len(), 2);
    assert_eq!(report.conflicts.len(), 1);
    assert!(!report.dev.is_running());
    assert_eq!(read(dir.path(), "a.txt"), "local");
    assert_eq!(recorded_version(dir.path()), recorded);
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let (dir, env) = synced_pair().await;
    let (trigger, shutdown) = shutdown::channel();
    let mut sync = open_with(dir.path(), Arc::new(env), options(None), shutdown).unwrap();
    trigger.trigger();

    assert!(matches!(
        sync.sync(SyncStrategy::Merge).await,
        Err(SyncError::Cancelled)
    ));
}

/// Commits an unrelated environment edit right before the first `limit` publishes
struct Racing {
    env: MemoryEnvironment,
    remaining: AtomicU32,
}

#[async_trait]
impl EnvironmentTransport for Racing {
    async fn remote_files_version(&self) -> Result<u64> {
        self.env.remote_files_version().await
    }

    async fn file_sync_hashes(&self, files_version: Option<u64>) -> Result<FileSyncHashes> {
        self.env.file_sync_hashes(files_version).await
    }

    async fn file_sync_files(&self, paths: &[String], files_version: u64) -> Result<FileSyncFiles> {
        self.env.file_sync_files(paths, files_version).await
    }

    async fn publish_file_sync_events(&self, input: PublishInput) -> Result<u64> {
        if self.remaining.load(Ordering::SeqCst) > 0 {
            let n = self.remaining.fetch_sub(1, Ordering::SeqCst);
            self.env.write(&format!("race-{}.txt", n), b"elsewhere");
        }
        self.env.publish_file_sync_events(input).await
    }

    async fn subscribe(
        &self,
        local_files_version: u64,
        shutdown: Shutdown,
    ) -> Result<mpsc::Receiver<Result<RemoteBatch>>> {
        self.env.subscribe(local_files_version, shutdown).await
    }
}

#[tokio::test]
async fn test_concurrent_environment_change_is_reconciled() {
    let (dir, env) = synced_pair().await;
    fs::write(dir.path().join("a.txt"), "a1").unwrap();
    let racing = Arc::new(Racing {
        env: env.clone(),
        remaining: AtomicU32::new(1),
    });

    let (_trigger, shutdown) = shutdown::channel();
    let mut sync = open_with(dir.path(), racing, options(None), shutdown).unwrap();
    let outcome = sync.sync(SyncStrategy::Merge).await.unwrap();

    assert_eq!(outcome.attempts, 2);
    assert_eq!(env.content("a.txt").unwrap(), b"a1");
    assert_eq!(read(dir.path(), "race-1.txt"), "elsewhere");
    assert_eq!(recorded_version(dir.path()), env.version());
}

#[tokio::test]
async fn test_gives_up_after_too_many_attempts() {
    let (dir, env) = synced_pair().await;
    fs::write(dir.path().join("a.txt"), "a1").unwrap();
    let racing = Arc::new(Racing {
        env: env.clone(),
        remaining: AtomicU32::new(100),
    });

    let (_trigger, shutdown) = shutdown::channel();
    let mut sync = open_with(dir.path(), racing, options(None), shutdown).unwrap();
    let result = sync.sync(SyncStrategy::Merge).await;

    assert!(matches!(result, Err(SyncError::TooManySyncAttempts { attempts: 3 })));
    assert_eq!(sync.phase(), Phase::Aborted);
}
