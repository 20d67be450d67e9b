//! Type-safe arguments for host system commands.
//!
//! - `AptArgs` for `apt-get`
//! - `DpkgQueryArgs` for `dpkg-query`
//! - `SystemctlArgs` for `systemctl`
//! - `UfwArgs` for `ufw`
//! - `ChownArgs` for `chown`
//! - `CurlArgs` for `curl`
//! - `CrontabArgs` for `crontab`
//! - `DockerArgs` for docker housekeeping outside a compose project
//! - `JournalctlArgs` for journal vacuuming
//! - `ShellPipelineArgs` for vendor install one-liners

use super::{CommandArgs, argv};
use std::path::PathBuf;

// ============================================================================
// apt-get
// ============================================================================

/// apt-get sub-command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AptAction {
    Update,
    Install(Vec<String>),
    Autoremove,
    Clean,
}

/// Type-safe arguments for `apt-get` (always non-interactive).
#[derive(Debug, Clone)]
pub struct AptArgs {
    pub action: AptAction,
}

impl CommandArgs for AptArgs {
    fn program(&self) -> &'static str {
        "apt-get"
    }

    fn to_cli_args(&self) -> Vec<String> {
        match &self.action {
            AptAction::Update => argv(["update", "-qq"]),
            AptAction::Install(packages) => {
                let mut args = argv(["install", "-y", "-qq", "--no-install-recommends"]);
                args.extend(packages.iter().cloned());
                args
            }
            AptAction::Autoremove => argv(["autoremove", "-y", "-qq"]),
            AptAction::Clean => argv(["clean"]),
        }
    }

    fn get_env_vars(&self) -> Vec<(String, String)> {
        vec![("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string())]
    }

    fn is_destructive(&self) -> bool {
        true
    }
}

// ============================================================================
// dpkg-query
// ============================================================================

/// Query whether a package is installed.
#[derive(Debug, Clone)]
pub struct DpkgQueryArgs {
    pub package: String,
}

impl DpkgQueryArgs {
    /// dpkg reports installed packages as `install ok installed`
    pub fn is_installed(stdout: &str) -> bool {
        stdout.trim() == "install ok installed"
    }
}

impl CommandArgs for DpkgQueryArgs {
    fn program(&self) -> &'static str {
        "dpkg-query"
    }

    fn to_cli_args(&self) -> Vec<String> {
        argv(["-W", "-f=${Status}", self.package.as_str()])
    }

    fn is_destructive(&self) -> bool {
        false
    }
}

// ============================================================================
// systemctl
// ============================================================================

/// systemctl sub-command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemctlAction {
    EnableNow,
    Reload,
    IsActive,
}

/// Type-safe arguments for `systemctl`.
#[derive(Debug, Clone)]
pub struct SystemctlArgs {
    pub action: SystemctlAction,
    pub unit: String,
}

impl SystemctlArgs {
    pub fn new(action: SystemctlAction, unit: &str) -> Self {
        Self {
            action,
            unit: unit.to_string(),
        }
    }
}

impl CommandArgs for SystemctlArgs {
    fn program(&self) -> &'static str {
        "systemctl"
    }

    fn to_cli_args(&self) -> Vec<String> {
        match self.action {
            SystemctlAction::EnableNow => argv(["enable", "--now", self.unit.as_str()]),
            SystemctlAction::Reload => argv(["reload", self.unit.as_str()]),
            SystemctlAction::IsActive => argv(["is-active", "--quiet", self.unit.as_str()]),
        }
    }

    fn is_destructive(&self) -> bool {
        !matches!(self.action, SystemctlAction::IsActive)
    }
}

// ============================================================================
// ufw
// ============================================================================

/// ufw sub-command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UfwAction {
    Status,
    Allow(String),
    Enable,
}

/// Type-safe arguments for `ufw`.
#[derive(Debug, Clone)]
pub struct UfwArgs {
    pub action: UfwAction,
}

impl CommandArgs for UfwArgs {
    fn program(&self) -> &'static str {
        "ufw"
    }

    fn to_cli_args(&self) -> Vec<String> {
        match &self.action {
            UfwAction::Status => argv(["status"]),
            UfwAction::Allow(rule) => argv(["allow", rule.as_str()]),
            UfwAction::Enable => argv(["--force", "enable"]),
        }
    }

    fn is_destructive(&self) -> bool {
        !matches!(self.action, UfwAction::Status)
    }
}

// ============================================================================
// chown
// ============================================================================

/// Recursive ownership reset.
#[derive(Debug, Clone)]
pub struct ChownArgs {
    pub path: PathBuf,
    pub uid: u32,
    pub gid: u32,
}

impl CommandArgs for ChownArgs {
    fn program(&self) -> &'static str {
        "chown"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "-R".to_string(),
            format!("{}:{}", self.uid, self.gid),
            self.path.display().to_string(),
        ]
    }

    fn is_destructive(&self) -> bool {
        true
    }
}

// ============================================================================
// curl
// ============================================================================

/// curl usage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CurlAction {
    /// Print only the HTTP status code of `url`
    StatusCode { url: String, timeout_secs: u32 },
    /// Print the body of `url` (fails on HTTP errors)
    Fetch { url: String, timeout_secs: u32 },
    /// Save `url` to `dest`
    Download { url: String, dest: PathBuf },
}

/// Type-safe arguments for `curl`.
#[derive(Debug, Clone)]
pub struct CurlArgs {
    pub action: CurlAction,
}

impl CurlArgs {
    pub fn status_code(url: impl Into<String>) -> Self {
        Self {
            action: CurlAction::StatusCode {
                url: url.into(),
                timeout_secs: 10,
            },
        }
    }

    pub fn fetch(url: impl Into<String>) -> Self {
        Self {
            action: CurlAction::Fetch {
                url: url.into(),
                timeout_secs: 5,
            },
        }
    }

    pub fn download(url: impl Into<String>, dest: PathBuf) -> Self {
        Self {
            action: CurlAction::Download {
                url: url.into(),
                dest,
            },
        }
    }
}

impl CommandArgs for CurlArgs {
    fn program(&self) -> &'static str {
        "curl"
    }

    fn to_cli_args(&self) -> Vec<String> {
        match &self.action {
            CurlAction::StatusCode { url, timeout_secs } => vec![
                "-s".to_string(),
                "-o".to_string(),
                "/dev/null".to_string(),
                "-w".to_string(),
                "%{http_code}".to_string(),
                "--max-time".to_string(),
                timeout_secs.to_string(),
                url.clone(),
            ],
            CurlAction::Fetch { url, timeout_secs } => vec![
                "-fsS".to_string(),
                "--max-time".to_string(),
                timeout_secs.to_string(),
                url.clone(),
            ],
            CurlAction::Download { url, dest } => vec![
                "-fsSL".to_string(),
                "-o".to_string(),
                dest.display().to_string(),
                url.clone(),
            ],
        }
    }

    fn is_destructive(&self) -> bool {
        matches!(self.action, CurlAction::Download { .. })
    }
}

// ============================================================================
// crontab
// ============================================================================

/// crontab usage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrontabAction {
    /// `crontab -l`
    List,
    /// `crontab -` with the table on stdin
    Install(String),
}

/// Type-safe arguments for root's `crontab`.
#[derive(Debug, Clone)]
pub struct CrontabArgs {
    pub action: CrontabAction,
}

impl CommandArgs for CrontabArgs {
    fn program(&self) -> &'static str {
        "crontab"
    }

    fn to_cli_args(&self) -> Vec<String> {
        match self.action {
            CrontabAction::List => argv(["-l"]),
            CrontabAction::Install(_) => argv(["-"]),
        }
    }

    fn stdin(&self) -> Option<Vec<u8>> {
        match &self.action {
            CrontabAction::Install(table) => Some(table.clone().into_bytes()),
            CrontabAction::List => None,
        }
    }

    fn is_destructive(&self) -> bool {
        matches!(self.action, CrontabAction::Install(_))
    }
}

// ============================================================================
// docker (outside a compose project)
// ============================================================================

/// Docker housekeeping and capability checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerArgs {
    /// `docker compose version`: is the compose plugin available
    ComposeVersion,
    /// `docker image prune -f [-a] [--filter until=…]`
    ImagePrune { all: bool, until: Option<String> },
    /// `docker builder prune -f [--filter until=…]`
    BuilderPrune { until: Option<String> },
}

impl CommandArgs for DockerArgs {
    fn program(&self) -> &'static str {
        "docker"
    }

    fn to_cli_args(&self) -> Vec<String> {
        match self {
            DockerArgs::ComposeVersion => argv(["compose", "version"]),
            DockerArgs::ImagePrune { all, until } => {
                let mut args = argv(["image", "prune", "-f"]);
                if *all {
                    args.push("-a".to_string());
                }
                if let Some(until) = until {
                    args.push("--filter".to_string());
                    args.push(format!("until={}", until));
                }
                args
            }
            DockerArgs::BuilderPrune { until } => {
                let mut args = argv(["builder", "prune", "-f"]);
                if let Some(until) = until {
                    args.push("--filter".to_string());
                    args.push(format!("until={}", until));
                }
                args
            }
        }
    }

    fn is_destructive(&self) -> bool {
        !matches!(self, DockerArgs::ComposeVersion)
    }
}

// ============================================================================
// journalctl
// ============================================================================

/// Shrink the systemd journal.
#[derive(Debug, Clone)]
pub struct JournalctlArgs {
    pub vacuum_time: String,
}

impl CommandArgs for JournalctlArgs {
    fn program(&self) -> &'static str {
        "journalctl"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![format!("--vacuum-time={}", self.vacuum_time)]
    }

    fn is_destructive(&self) -> bool {
        true
    }
}

// ============================================================================
// Shell pipeline
// ============================================================================

/// A fixed pipeline run under `bash -o pipefail -c`.
///
/// Only used for vendor installers that are distributed as a download piped
/// into a shell. The script text is a constant, never built from user input.
#[derive(Debug, Clone)]
pub struct ShellPipelineArgs {
    pub script: &'static str,
}

impl CommandArgs for ShellPipelineArgs {
    fn program(&self) -> &'static str {
        "bash"
    }

    fn to_cli_args(&self) -> Vec<String> {
        argv(["-o", "pipefail", "-c", self.script])
    }

    fn is_destructive(&self) -> bool {
        true
    }
}
