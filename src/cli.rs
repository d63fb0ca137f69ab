use crate::sync::conflicts::Conflict;
use crate::sync::strategy::{MergeConflictPreference, PreferencePrompt, SyncStrategy};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::io::{BufRead, IsTerminal, Write};
use std::path::PathBuf;

fn parse_strategy(s: &str) -> Result<SyncStrategy, String> {
    s.parse().map_err(|e: crate::error::SyncError| e.to_string())
}

fn parse_preference(s: &str) -> Result<MergeConflictPreference, String> {
    s.parse().map_err(|e: crate::error::SyncError| e.to_string())
}

#[derive(Parser, Debug)]
#[command(name = "devsync")]
#[command(about = "Keep a local directory in sync with a hosted environment", long_about = None)]
#[command(version)]
#[command(after_help = "EXAMPLES:
    # First sync of a new directory
    devsync --app shop --dir ./shop sync

    # Sync, keeping local edits when both sides changed a file
    devsync sync --prefer local

    # Overwrite the environment with the local directory
    devsync push --force

    # Show what would change
    devsync status

    # Keep syncing as files change (Ctrl-C to stop)
    devsync dev

    # Machine-readable output
    devsync --json sync")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Application to sync (required the first time a directory is synced)
    #[arg(long, global = true)]
    pub app: Option<String>,

    /// Environment to sync with
    #[arg(long = "env", global = true)]
    pub environment: Option<String>,

    /// Directory to sync (default: current directory)
    #[arg(long, global = true)]
    pub dir: Option<PathBuf>,

    /// Use named profile from config file
    #[arg(long, global = true)]
    pub profile: Option<String>,

    /// Verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (only show errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output JSON (newline-delimited JSON for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// List all available profiles
    #[arg(long)]
    pub list_profiles: bool,

    /// Show details of a specific profile
    #[arg(long)]
    pub show_profile: Option<String>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Publish local changes to the environment
    Push {
        /// Overwrite changes made in the environment
        #[arg(long)]
        force: bool,
    },

    /// Apply environment changes to the local directory
    Pull {
        /// Overwrite local changes
        #[arg(long)]
        force: bool,
    },

    /// Sync both ways
    Sync {
        /// How to sync: cancel, merge, push, pull
        #[arg(long, default_value = "merge", value_parser = parse_strategy)]
        strategy: SyncStrategy,

        /// Which side wins a conflict: cancel, local, environment
        #[arg(long, value_parser = parse_preference)]
        prefer: Option<MergeConflictPreference>,

        /// Sync a directory that has files but was never synced
        #[arg(long)]
        allow_unknown_directory: bool,
    },

    /// Show local and environment changes without applying them
    Status,

    /// Watch the directory and the environment and sync continuously
    Dev {
        /// Which side wins a conflict: cancel, local, environment
        #[arg(long, value_parser = parse_preference)]
        prefer: Option<MergeConflictPreference>,

        /// Sync a directory that has files but was never synced
        #[arg(long)]
        allow_unknown_directory: bool,
    },

    /// Forget the sync state of the directory
    Reset,
}

impl Cli {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.list_profiles || self.show_profile.is_some() {
            return Ok(());
        }
        if self.command.is_none() {
            anyhow::bail!("A command is required (push, pull, sync, status, dev or reset)");
        }
        if self.quiet && self.verbose > 0 {
            anyhow::bail!("--quiet and --verbose cannot be used together");
        }
        if let Some(app) = &self.app {
            if app.trim().is_empty() {
                anyhow::bail!("--app cannot be empty");
            }
        }
        Ok(())
    }

    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            return tracing::Level::ERROR;
        }

        match self.verbose {
            0 => tracing::Level::WARN,
            1 => tracing::Level::INFO,
            2 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    }
}

/// Asks on the terminal which side should win
pub struct StdinPrompt;

impl StdinPrompt {
    /// A prompt only makes sense when someone can answer it
    pub fn is_available() -> bool {
        std::io::stdin().is_terminal() && std::io::stderr().is_terminal()
    }
}

#[async_trait]
impl PreferencePrompt for StdinPrompt {
    async fn choose(&self, conflicts: &[Conflict]) -> Option<MergeConflictPreference> {
        let count = conflicts.len();
        let answer = tokio::task::spawn_blocking(move || -> Option<String> {
            let mut stderr = std::io::stderr();
            let _ = write!(
                stderr,
                "{} Resolve {} conflict(s) by keeping [l]ocal, [e]nvironment, or [c]ancel? ",
                "?".cyan().bold(),
                count
            );
            let _ = stderr.flush();
            let mut line = String::new();
            match std::io::stdin().lock().read_line(&mut line) {
                Ok(0) | Err(_) => None,
                Ok(_) => Some(line),
            }
        })
        .await
        .ok()??;

        parse_answer(&answer)
    }
}

fn parse_answer(answer: &str) -> Option<MergeConflictPreference> {
    match answer.trim().to_ascii_lowercase().as_str() {
        "l" | "local" => Some(MergeConflictPreference::Local),
        "e" | "env" | "environment" => Some(MergeConflictPreference::Environment),
        _ => Some(MergeConflictPreference::Cancel),
    }
}
