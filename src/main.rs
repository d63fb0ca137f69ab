use clap::Parser;
use colored::Colorize;
use devsync::cli::{Cli, Command, StdinPrompt};
use devsync::config::{self, Config};
use devsync::directory::Directory;
use devsync::lock::{DevLock, LockStatus};
use devsync::shutdown::{self, Shutdown, ShutdownTrigger};
use devsync::sync::changes::{Change, ChangeKind};
use devsync::sync::output::{OutputMode, Reporter, SyncEvent};
use devsync::sync::state::SyncState;
use devsync::sync::watch::DevSession;
use devsync::sync::{FileSync, StatusReport, SyncOptions};
use devsync::transport::GraphqlTransport;
use devsync::{Result, SyncError};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_ENVIRONMENT: &str = "development";

/// A second Ctrl-C within this window exits immediately
const FORCE_EXIT_WINDOW: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() {
    // Usage errors exit 1 like every other failure; help and version exit 0
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };
    let json = cli.json;

    if let Err(e) = run(cli).await {
        if json {
            SyncEvent::Error {
                message: e.to_string(),
            }
            .emit();
        }
        eprintln!("{} {}", "error:".red().bold(), e.render());
        std::process::exit(1);
    }
}

async fn run(mut cli: Cli) -> Result<()> {
    let config = Config::load().map_err(config::to_sync_error)?;

    // Handle profile-only flags (print and exit)
    if cli.list_profiles {
        let profiles = config.list_profiles();
        if profiles.is_empty() {
            println!("No profiles configured");
            let path = Config::config_path().map_err(config::to_sync_error)?;
            println!("\nCreate profiles in: {}", path.display());
        } else {
            println!("Available profiles:");
            for name in profiles {
                println!("  {}", name);
            }
        }
        return Ok(());
    }

    if let Some(ref profile_name) = cli.show_profile {
        return match config.show_profile(profile_name) {
            Some(output) => {
                println!("{}", output);
                Ok(())
            }
            None => Err(SyncError::Config(format!("Profile '{}' not found", profile_name))),
        };
    }

    // Profile values fill in whatever the flags left out
    if let Some(ref profile_name) = cli.profile {
        let profile = config
            .get_profile(profile_name)
            .ok_or_else(|| SyncError::Config(format!("Profile '{}' not found", profile_name)))?;
        if cli.app.is_none() {
            cli.app = profile.app.clone();
        }
        if cli.environment.is_none() {
            cli.environment = profile.env.clone();
        }
        if cli.dir.is_none() {
            cli.dir = profile.dir.clone();
        }
    }

    cli.validate().map_err(|e| SyncError::Arg(e.to_string()))?;
    init_logging(&cli);

    let Some(command) = cli.command.clone() else {
        return Err(SyncError::Arg("A command is required".to_string()));
    };

    let root = match &cli.dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    let directory = Directory::open(&root)?;

    if command == Command::Reset {
        return reset(&directory, cli.quiet);
    }

    // One-shot writers never run beside a dev session
    if !matches!(command, Command::Status | Command::Dev { .. }) {
        if let LockStatus::Running(holder) = DevLock::status(directory.root()) {
            return Err(SyncError::DevAlreadyRunning {
                pid: holder.pid,
                started_at: holder.started_at.to_rfc3339(),
            });
        }
    }

    let existing = SyncState::load(directory.root())?;
    let application = match (&cli.app, &existing) {
        (Some(app), _) => app.clone(),
        (None, Some(state)) => state.application.clone(),
        (None, None) => {
            return Err(SyncError::MissingState {
                path: directory.root().to_path_buf(),
            })
        }
    };
    let environment = cli
        .environment
        .clone()
        .or_else(|| existing.as_ref().map(|s| s.environment.clone()))
        .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string());

    let (trigger, shutdown) = shutdown::channel();
    spawn_interrupt_handler(trigger);

    let backoff = config.backoff();
    let transport = GraphqlTransport::new(
        config.api_url(&application, &environment),
        config.token.clone(),
        backoff,
        shutdown.clone(),
    )?;
    tracing::debug!("Using environment endpoint {}", transport.url());

    let mode = if cli.json {
        OutputMode::Json
    } else if cli.quiet {
        OutputMode::Quiet
    } else {
        OutputMode::Human
    };

    let (preference, allow_unknown_directory) = match &command {
        Command::Sync {
            prefer,
            allow_unknown_directory,
            ..
        }
        | Command::Dev {
            prefer,
            allow_unknown_directory,
        } => (*prefer, *allow_unknown_directory),
        _ => (None, false),
    };

    let options = SyncOptions {
        application: Some(application),
        environment,
        allow_unknown_directory,
        preference,
        max_attempts: backoff.max_attempts,
    };
    let mut sync = FileSync::open(
        directory,
        Arc::new(transport),
        options,
        Reporter::new(mode),
        shutdown.clone(),
    )?;
    if mode == OutputMode::Human && StdinPrompt::is_available() {
        sync = sync.with_prompt(Box::new(StdinPrompt));
    }

    match command {
        Command::Push { force } => {
            sync.push(force).await?;
        }
        Command::Pull { force } => {
            sync.pull(force).await?;
        }
        Command::Sync { strategy, .. } => {
            sync.sync(strategy).await?;
        }
        Command::Status => {
            let report = sync.status().await?;
            print_status(&report, mode);
        }
        Command::Dev { .. } => {
            run_dev(sync, config.debounce(), shutdown).await?;
        }
        Command::Reset => reset(sync.directory(), cli.quiet)?,
    }

    Ok(())
}

fn init_logging(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level().as_str()));

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// First Ctrl-C asks everything to stop; a second one within the window exits
fn spawn_interrupt_handler(trigger: ShutdownTrigger) {
    tokio::spawn(async move {
        let mut first: Option<Instant> = None;
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            match first {
                Some(at) if at.elapsed() <= FORCE_EXIT_WINDOW => {
                    eprintln!("{}", "Interrupted".red());
                    std::process::exit(130);
                }
                _ => {
                    first = Some(Instant::now());
                    eprintln!(
                        "{}",
                        "Stopping... press Ctrl-C again to exit immediately".yellow()
                    );
                    trigger.trigger();
                }
            }
        }
    });
}

async fn run_dev(sync: FileSync, debounce: Duration, shutdown: Shutdown) -> Result<()> {
    let session = DevSession::start(sync, debounce, shutdown)?;
    match session.run().await {
        Err(SyncError::Cancelled) => Ok(()),
        other => other,
    }
}

fn reset(directory: &Directory, quiet: bool) -> Result<()> {
    if let LockStatus::Running(holder) = DevLock::status(directory.root()) {
        return Err(SyncError::DevAlreadyRunning {
            pid: holder.pid,
            started_at: holder.started_at.to_rfc3339(),
        });
    }
    let removed = SyncState::delete(directory.root())?;
    if !quiet {
        if removed {
            println!("{} Sync state removed from {}", "✓".green(), directory.root().display());
        } else {
            println!("No sync state in {}", directory.root().display());
        }
    }
    Ok(())
}

fn print_status(report: &StatusReport, mode: OutputMode) {
    match mode {
        OutputMode::Quiet => {}
        OutputMode::Json => {
            let dev = match &report.dev {
                LockStatus::Running(holder) => json!({
                    "running": true,
                    "pid": holder.pid,
                    "startedAt": holder.started_at.to_rfc3339(),
                }),
                LockStatus::NotRunning => json!({ "running": false }),
            };
            let value = json!({
                "type": "status",
                "application": report.application,
                "environment": report.environment,
                "files_version": report.files_version,
                "latest_version": report.latest_version,
                "local_changes": report.local_changes,
                "environment_changes": report.environment_changes,
                "conflicts": report.conflicts,
                "dev": dev,
            });
            println!("{}", value);
        }
        OutputMode::Human => {
            println!(
                "{} ({}) at version {} of {}",
                report.application.cyan().bold(),
                report.environment,
                report.files_version,
                report.latest_version
            );
            if let LockStatus::Running(holder) = &report.dev {
                println!("  dev session running (pid {})", holder.pid);
            }
            print_changes("Local changes", &report.local_changes);
            print_changes("Environment changes", &report.environment_changes);
            if !report.conflicts.is_empty() {
                println!("\n{}", format!("Conflicts ({}):", report.conflicts.len()).bold());
                for conflict in &report.conflicts {
                    println!("  {}  {}", conflict.path(), conflict.kind.label().yellow());
                }
            }
            if report.local_changes.is_empty() && report.environment_changes.is_empty() {
                println!("{} Everything is in sync", "✓".green());
            }
        }
    }
}

fn print_changes(title: &str, changes: &[Change]) {
    if changes.is_empty() {
        return;
    }
    println!("\n{}", format!("{} ({}):", title, changes.len()).bold());
    for change in changes {
        let line = match change.kind() {
            ChangeKind::Create => format!("  + {}", change.path()).green(),
            ChangeKind::Update => format!("  ~ {}", change.path()).yellow(),
            ChangeKind::Delete => format!("  - {}", change.path()).red(),
        };
        println!("{}", line);
    }
}
