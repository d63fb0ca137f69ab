use crate::transport::ClientError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("{0}")]
    Arg(String),

    #[error("No sync state found in {path}\nRun `devsync sync --app <app>` to start syncing this directory.")]
    MissingState { path: PathBuf },

    #[error("Sync state is corrupt: {path}\nCause: {reason}\nRun `devsync reset` and sync again.")]
    CorruptState { path: PathBuf, reason: String },

    #[error("{path} is not empty and has never been synced\nPass --allow-unknown-directory to sync it anyway, or choose an empty directory.")]
    UnknownDirectory { path: PathBuf },

    #[error("{path} is synced with application {synced}, not {requested}\nChoose another directory or run `devsync reset` first.")]
    ApplicationMismatch {
        path: PathBuf,
        synced: String,
        requested: String,
    },

    #[error("The {side} has {count} change(s) that would be overwritten\nRun `devsync status` to review them, or pass --force to overwrite.")]
    Diverged { side: &'static str, count: usize },

    #[error("{count} conflicting change(s) need a resolution\nPass --prefer local|environment to choose which side wins.")]
    UnresolvedConflicts { count: usize },

    #[error("devsync dev is already running in this directory (pid {pid}, started {started_at})\nStop that process before starting another one.")]
    DevAlreadyRunning { pid: u32, started_at: String },

    #[error("Your session is not authorized or has expired\nLog in again and retry (set DEVSYNC_TOKEN or `token` in the config file).")]
    AuthenticationRequired,

    #[error("Too many sync attempts ({attempts})\nThe environment kept failing or changing while syncing. Try again in a moment.")]
    TooManySyncAttempts { attempts: u32 },

    #[error("Request to the environment failed: {0}")]
    Client(#[from] ClientError),

    #[error("Sync cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read directory: {path}\nCause: {source}\nCheck that the directory exists and you have read permissions.")]
    ReadDirError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write file: {path}\nCause: {source}\nCheck disk space and write permissions.")]
    WriteError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid path: {path}\nPaths must be valid UTF-8 and stay inside the synced directory.")]
    InvalidPath { path: PathBuf },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// How bad an error is, least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Arguments, configuration, local state: the user can fix it
    User,
    /// Another sync process owns the directory
    Concurrency,
    /// The session expired; the user must log in again
    Authentication,
    /// Retries were exhausted; could be an outage or a bug
    PossibleBug,
    /// Uncategorized failure, always reported as a bug
    Bug,
}

impl SyncError {
    pub fn severity(&self) -> Severity {
        match self {
            SyncError::Arg(_)
            | SyncError::MissingState { .. }
            | SyncError::CorruptState { .. }
            | SyncError::UnknownDirectory { .. }
            | SyncError::ApplicationMismatch { .. }
            | SyncError::Diverged { .. }
            | SyncError::UnresolvedConflicts { .. }
            | SyncError::Cancelled
            | SyncError::ReadDirError { .. }
            | SyncError::WriteError { .. }
            | SyncError::InvalidPath { .. }
            | SyncError::Config(_) => Severity::User,
            SyncError::DevAlreadyRunning { .. } => Severity::Concurrency,
            SyncError::AuthenticationRequired => Severity::Authentication,
            SyncError::TooManySyncAttempts { .. } | SyncError::Client(_) => Severity::PossibleBug,
            SyncError::Io(_) | SyncError::Unexpected(_) => Severity::Bug,
        }
    }

    pub fn is_bug(&self) -> bool {
        self.severity() >= Severity::PossibleBug
    }

    /// Text shown to the user. Bug-class errors carry full detail and a
    /// reference id to quote when reporting the issue.
    pub fn render(&self) -> String {
        if self.is_bug() {
            let reference = uuid::Uuid::new_v4();
            format!(
                "{}\n\nDetails: {:?}\n\nThis may be a bug. Please report it and include reference {}",
                self, self, reference
            )
        } else {
            self.to_string()
        }
    }
}
