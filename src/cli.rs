//! Command-line surface and dispatch.
//!
//! With no subcommand the binary runs the interactive installer. Every
//! runtime helper is a subcommand of the same binary; the wrapper scripts in
//! the installation directory call them with `--settings` pointing at the
//! installation's `provision.json`.

use crate::config_file::InstallerSettings;
use crate::console;
use crate::control::{self, Runtime};
use crate::error::{DeployError, Result};
use crate::host::Host;
use crate::operator::Operator;
use crate::paths::InstallPaths;
use crate::probe::Inspector;
use crate::scheduler;
use crate::sequencer::Installer;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

/// n8n-provision - install and operate a single-host n8n deployment
#[derive(Parser, Debug)]
#[command(name = "n8n-provision")]
#[command(about = "Install and operate a single-host n8n deployment")]
#[command(version)]
pub struct Cli {
    /// Dry-run mode: show what would be executed without making changes.
    ///
    /// Destructive commands (package installs, compose up/down, certbot)
    /// and file writes are skipped and logged. Read-only commands still run.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Installer settings file (JSON). Defaults to <install_dir>/provision.json
    /// when it exists, built-in defaults otherwise.
    #[arg(long, global = true, value_name = "FILE")]
    pub settings: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Run the interactive installer (default)
    Install,
    /// Back up the database and configuration now
    Backup,
    /// List backups in the backup directory
    Backups,
    /// Restore a backup by timestamp (stops n8n while restoring)
    Restore {
        /// Backup timestamp, e.g. 20250101_020000 (see `backups`)
        timestamp: String,
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Manage queue-mode workers; opens a menu without an action
    Workers {
        #[command(subcommand)]
        action: Option<WorkerCommands>,
    },
    /// Upgrade n8n to another version (backup is taken first)
    Upgrade {
        /// Target version, `latest`, or `next`; prompted for when absent
        #[arg(long, value_name = "VERSION")]
        to: Option<String>,
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Print the running n8n version
    Version,
    /// Prune old images and caches, vacuum the journal
    Maintenance,
    /// Renew TLS certificates that are due
    RenewCerts,
    /// (Re-)register the recurring jobs in root's crontab
    Schedule,
    /// Validate a settings file
    Validate {
        /// Path to the settings file
        settings: PathBuf,
    },
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum WorkerCommands {
    /// Start one more worker
    Add,
    /// Stop one worker (the last one cannot be removed)
    Remove,
    /// Show worker counts and concurrency
    Status,
    /// Set jobs per worker (1-20) and recreate the workers
    Concurrency { value: u32 },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}

/// Everything a command needs from the outside world
pub struct Session<'a> {
    pub host: &'a dyn Host,
    pub operator: &'a dyn Operator,
    pub inspector: &'a dyn Inspector,
    /// Host layout before settings are applied
    pub base: InstallPaths,
    /// Executable copied to the helper location during install
    pub helper_source: PathBuf,
}

/// Settings from `--settings`, the installation's own file, or defaults
pub fn resolve_settings(explicit: Option<&Path>, base: &InstallPaths) -> Result<InstallerSettings> {
    if let Some(path) = explicit {
        return Ok(InstallerSettings::load_validated(path)?);
    }
    let installed = base.settings_file();
    if installed.is_file() {
        log::debug!("Using settings from {}", installed.display());
        return Ok(InstallerSettings::load_validated(&installed)?);
    }
    Ok(InstallerSettings::default())
}

/// Host layout with the settings' directories applied
pub fn paths_for(base: &InstallPaths, settings: &InstallerSettings) -> InstallPaths {
    let paths = base.clone().with_install_dir(&settings.install_dir);
    match &settings.backup_dir {
        Some(dir) => paths.with_backup_dir(dir),
        None => paths,
    }
}

/// Run the parsed command
pub fn run(cli: &Cli, session: &Session) -> Result<()> {
    if let Some(Commands::Validate { settings }) = &cli.command {
        return validate(settings);
    }

    let settings = resolve_settings(cli.settings.as_deref(), &session.base)?;
    let paths = paths_for(&session.base, &settings);
    if session.host.dry_run() {
        console::warn("dry run: no changes will be made");
    }

    let command = cli.command.as_ref().unwrap_or(&Commands::Install);
    if *command == Commands::Install {
        let mut installer = Installer::new(
            session.host,
            session.operator,
            session.inspector,
            paths,
            settings,
            session.helper_source.clone(),
        );
        let summary = installer.run()?;
        summary.print();
        return Ok(());
    }

    let rt = Runtime::new(session.host, session.operator, paths, settings);
    match command {
        Commands::Install | Commands::Validate { .. } => Ok(()),
        Commands::Backup => {
            let artifact = control::backup::create(&rt)?;
            console::success(&format!("backup {} created", artifact.timestamp));
            console::field("Database", &artifact.database.display().to_string());
            console::field("Files", &artifact.files.display().to_string());
            Ok(())
        }
        Commands::Backups => {
            let sets = control::backup::list(rt.paths.backup_dir())?;
            if sets.is_empty() {
                console::info(&format!("no backups in {}", rt.paths.backup_dir().display()));
            }
            for set in sets {
                if set.is_complete() {
                    console::success(&set.timestamp);
                } else {
                    console::warn(&format!("{} (incomplete, cannot be restored)", set.timestamp));
                }
            }
            Ok(())
        }
        Commands::Restore { timestamp, yes } => {
            control::restore::restore(&rt, timestamp, *yes)?;
            console::success(&format!("backup {} restored", timestamp));
            Ok(())
        }
        Commands::Workers { action } => match action {
            None => control::workers::menu(&rt),
            Some(WorkerCommands::Add) => {
                let n = control::workers::add(&rt)?;
                console::success(&format!("{} worker(s) running", n));
                Ok(())
            }
            Some(WorkerCommands::Remove) => {
                let n = control::workers::remove(&rt)?;
                console::success(&format!("{} worker(s) running", n));
                Ok(())
            }
            Some(WorkerCommands::Status) => {
                control::workers::print_status(&control::workers::status(&rt)?);
                Ok(())
            }
            Some(WorkerCommands::Concurrency { value }) => {
                control::workers::set_concurrency(&rt, *value)?;
                console::success(&format!("worker concurrency set to {}", value));
                Ok(())
            }
        },
        Commands::Upgrade { to, yes } => {
            let report = control::upgrade::upgrade(&rt, to.as_deref(), *yes)?;
            console::success(&format!("n8n upgraded: {} → {}", report.from, report.to));
            console::field("Backup", &report.backup);
            if !report.reachable {
                console::warn("the public URL did not answer; check DNS and nginx");
            }
            Ok(())
        }
        Commands::Version => {
            println!("{}", control::upgrade::current_version(&rt)?);
            Ok(())
        }
        Commands::Maintenance => {
            let report = control::maintenance::run(rt.host);
            for step in &report.succeeded {
                console::success(step);
            }
            for (step, reason) in &report.failed {
                console::warn(&format!("{}: {}", step, reason));
            }
            Ok(())
        }
        Commands::RenewCerts => control::maintenance::renew_certificates(rt.host),
        Commands::Schedule => {
            for line in scheduler::register(rt.host, &rt.paths)? {
                console::success(&line);
            }
            Ok(())
        }
    }
}

fn validate(path: &Path) -> Result<()> {
    match InstallerSettings::load_validated(path) {
        Ok(_) => {
            console::success(&format!("{} is valid", path.display()));
            Ok(())
        }
        Err(e) => Err(DeployError::validation(format!("{:#}", e))),
    }
}
