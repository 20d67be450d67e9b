//! Type-safe arguments for `docker compose`.
//!
//! All invocations pin both the project directory and the manifest file so
//! the commands behave the same no matter which directory the helper binary
//! is started from (cron runs it from `/`).

use super::{CommandArgs, argv};
use crate::paths::MANIFEST_FILE;
use std::path::{Path, PathBuf};

/// Compose sub-command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComposeAction {
    /// `up -d` for the given services (all services when empty)
    Up {
        services: Vec<String>,
        no_deps: bool,
        force_recreate: bool,
        scale: Option<(String, u32)>,
    },
    /// `down` (containers and network; volumes are kept)
    Down,
    /// `stop` the given services (all when empty)
    Stop { services: Vec<String> },
    /// `pull` images
    Pull,
    /// `ps --all --format json`
    Ps,
    /// `exec -T <service> <argv...>`
    Exec {
        service: String,
        argv: Vec<String>,
        stdin: Option<Vec<u8>>,
        mutates: bool,
    },
}

/// `docker compose` invocation against one project directory.
#[derive(Debug, Clone)]
pub struct ComposeArgs {
    /// Installation directory holding the manifest and `.env`.
    pub project_dir: PathBuf,
    /// What to do.
    pub action: ComposeAction,
}

impl ComposeArgs {
    pub fn new(project_dir: &Path, action: ComposeAction) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
            action,
        }
    }

    /// `up -d` for the named services
    pub fn up(project_dir: &Path, services: &[&str]) -> Self {
        Self::new(
            project_dir,
            ComposeAction::Up {
                services: argv(services.iter().copied()),
                no_deps: false,
                force_recreate: false,
                scale: None,
            },
        )
    }

    /// Re-apply one replicated service at `replicas` without touching its dependencies
    pub fn scale(project_dir: &Path, service: &str, replicas: u32, force_recreate: bool) -> Self {
        Self::new(
            project_dir,
            ComposeAction::Up {
                services: vec![service.to_string()],
                no_deps: true,
                force_recreate,
                scale: Some((service.to_string(), replicas)),
            },
        )
    }

    pub fn down(project_dir: &Path) -> Self {
        Self::new(project_dir, ComposeAction::Down)
    }

    pub fn pull(project_dir: &Path) -> Self {
        Self::new(project_dir, ComposeAction::Pull)
    }

    pub fn ps(project_dir: &Path) -> Self {
        Self::new(project_dir, ComposeAction::Ps)
    }

    /// Read-only `exec`
    pub fn exec(project_dir: &Path, service: &str, command: &[&str]) -> Self {
        Self::new(
            project_dir,
            ComposeAction::Exec {
                service: service.to_string(),
                argv: argv(command.iter().copied()),
                stdin: None,
                mutates: false,
            },
        )
    }

    /// State-changing `exec` fed from `stdin`
    pub fn exec_with_stdin(project_dir: &Path, service: &str, command: &[&str], stdin: Vec<u8>) -> Self {
        Self::new(
            project_dir,
            ComposeAction::Exec {
                service: service.to_string(),
                argv: argv(command.iter().copied()),
                stdin: Some(stdin),
                mutates: true,
            },
        )
    }
}

impl CommandArgs for ComposeArgs {
    fn program(&self) -> &'static str {
        "docker"
    }

    fn to_cli_args(&self) -> Vec<String> {
        let dir = self.project_dir.display().to_string();
        let file = self.project_dir.join(MANIFEST_FILE).display().to_string();
        let mut args = argv(["compose", "--project-directory", dir.as_str(), "-f", file.as_str()]);

        match &self.action {
            ComposeAction::Up {
                services,
                no_deps,
                force_recreate,
                scale,
            } => {
                args.extend(argv(["up", "-d", "--remove-orphans"]));
                if *no_deps {
                    args.push("--no-deps".to_string());
                }
                if *force_recreate {
                    args.push("--force-recreate".to_string());
                }
                if let Some((service, replicas)) = scale {
                    args.push("--scale".to_string());
                    args.push(format!("{}={}", service, replicas));
                }
                args.extend(services.iter().cloned());
            }
            ComposeAction::Down => args.push("down".to_string()),
            ComposeAction::Stop { services } => {
                args.push("stop".to_string());
                args.extend(services.iter().cloned());
            }
            ComposeAction::Pull => args.extend(argv(["pull", "--quiet"])),
            ComposeAction::Ps => args.extend(argv(["ps", "--all", "--format", "json"])),
            ComposeAction::Exec { service, argv: cmd, .. } => {
                args.extend(argv(["exec", "-T", service.as_str()]));
                args.extend(cmd.iter().cloned());
            }
        }
        args
    }

    fn stdin(&self) -> Option<Vec<u8>> {
        match &self.action {
            ComposeAction::Exec { stdin, .. } => stdin.clone(),
            _ => None,
        }
    }

    fn is_destructive(&self) -> bool {
        match &self.action {
            ComposeAction::Ps => false,
            ComposeAction::Exec { mutates, .. } => *mutates,
            _ => true,
        }
    }
}
