use super::changes::{Change, ChangeKind};
use super::conflicts::{Conflict, ConflictKind};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::time::Duration;

/// Which way a change travels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Push,
    Pull,
}

/// JSON output mode for machine-readable sync events
/// Uses NDJSON format (newline-delimited JSON)
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    Start {
        application: String,
        environment: String,
        strategy: String,
        files_version: u64,
    },
    Change {
        direction: Direction,
        path: String,
        change: ChangeKind,
    },
    Conflict {
        path: String,
        kind: ConflictKind,
    },
    Batch {
        direction: Direction,
        files_version: u64,
        changed: usize,
        deleted: usize,
    },
    Cancelled {
        reason: String,
    },
    Summary {
        pushed: usize,
        pulled: usize,
        files_version: u64,
        duration_secs: f64,
    },
    Error {
        message: String,
    },
}

impl SyncEvent {
    /// Emit this event as JSON to stdout
    pub fn emit(&self) {
        if let Ok(json) = serde_json::to_string(self) {
            println!("{}", json);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
    Quiet,
}

/// Reports sync progress on stdout, as text or NDJSON
///
/// Log lines go to stderr through `tracing`; this is the user-facing channel.
#[derive(Debug, Clone)]
pub struct Reporter {
    mode: OutputMode,
    spinner: ProgressBar,
}

impl Reporter {
    pub fn new(mode: OutputMode) -> Self {
        let spinner = if mode == OutputMode::Human {
            let pb = ProgressBar::new_spinner();
            if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
                pb.set_style(style);
            }
            pb
        } else {
            ProgressBar::hidden()
        };
        Self { mode, spinner }
    }

    /// Reporter that prints nothing
    pub fn quiet() -> Self {
        Self::new(OutputMode::Quiet)
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    /// Show (or update) the spinner message
    pub fn progress(&self, message: &str) {
        if self.mode != OutputMode::Human {
            return;
        }
        self.spinner.set_message(message.to_string());
        self.spinner.enable_steady_tick(Duration::from_millis(100));
    }

    pub fn finish_progress(&self) {
        self.spinner.finish_and_clear();
    }

    pub fn emit(&self, event: SyncEvent) {
        match self.mode {
            OutputMode::Quiet => {}
            OutputMode::Json => event.emit(),
            OutputMode::Human => {
                let line = human_line(&event);
                self.spinner.suspend(|| println!("{}", line));
            }
        }
    }

    pub fn changes(&self, direction: Direction, changes: &[Change]) {
        for change in changes {
            self.emit(SyncEvent::Change {
                direction,
                path: change.path().to_string(),
                change: change.kind(),
            });
        }
    }

    pub fn conflicts(&self, conflicts: &[Conflict]) {
        if conflicts.is_empty() {
            return;
        }
        if self.mode == OutputMode::Human {
            let width = conflicts
                .iter()
                .map(|c| c.path().len())
                .max()
                .unwrap_or(0)
                .max(4);
            let table = conflicts
                .iter()
                .map(|c| format!("  {:<width$}  {}", c.path(), c.kind.label().yellow(), width = width))
                .collect::<Vec<_>>()
                .join("\n");
            self.spinner.suspend(|| {
                println!("{}", format!("{} conflicting change(s):", conflicts.len()).bold());
                println!("{}", table);
            });
            return;
        }
        for conflict in conflicts {
            self.emit(SyncEvent::Conflict {
                path: conflict.path().to_string(),
                kind: conflict.kind,
            });
        }
    }
}

fn arrow(direction: Direction) -> &'static str {
    match direction {
        Direction::Push => "↑",
        Direction::Pull => "↓",
    }
}

fn human_line(event: &SyncEvent) -> String {
    match event {
        SyncEvent::Start {
            application,
            environment,
            strategy,
            ..
        } => format!(
            "{} {} ({}) using {}",
            "Syncing".bold(),
            application.cyan(),
            environment,
            strategy
        ),
        SyncEvent::Change {
            direction,
            path,
            change,
        } => {
            let (sign, path) = match change {
                ChangeKind::Create => ("+".green(), path.green()),
                ChangeKind::Update => ("~".yellow(), path.yellow()),
                ChangeKind::Delete => ("-".red(), path.red()),
            };
            format!("  {} {} {}", arrow(*direction), sign, path)
        }
        SyncEvent::Conflict { path, kind } => format!("  {}  {}", path, kind.label().yellow()),
        SyncEvent::Batch {
            direction,
            files_version,
            changed,
            deleted,
        } => format!(
            "{} {} changed, {} deleted (version {})",
            arrow(*direction),
            changed,
            deleted,
            files_version
        ),
        SyncEvent::Cancelled { reason } => format!("{} {}", "Cancelled:".yellow(), reason),
        SyncEvent::Summary {
            pushed,
            pulled,
            files_version,
            duration_secs,
        } => {
            if *pushed == 0 && *pulled == 0 {
                format!("{} Already in sync (version {})", "✓".green(), files_version)
            } else {
                format!(
                    "{} Synced: {} pushed, {} pulled (version {}) in {:.2}s",
                    "✓".green(),
                    pushed,
                    pulled,
                    files_version,
                    duration_secs
                )
            }
        }
        SyncEvent::Error { message } => format!("{} {}", "✗".red(), message),
    }
}
