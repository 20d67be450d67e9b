//! Idempotent host provisioning.
//!
//! Each `ProvisionStep` checks the current state of the host before changing
//! it, so running the installer's provisioning stage again converges instead
//! of re-applying everything.

use crate::commands::system::{
    AptAction, AptArgs, ChownArgs, DockerArgs, DpkgQueryArgs, ShellPipelineArgs, SystemctlAction,
    SystemctlArgs, UfwAction, UfwArgs,
};
use crate::error::{DeployError, Result};
use crate::host::{self, Host};
use crate::manifest::APP_UID;
use crate::paths::InstallPaths;
use std::fs;
use std::path::PathBuf;

/// Debian packages the deployment needs on the host
pub const HOST_PACKAGES: &[&str] = &[
    "curl",
    "ca-certificates",
    "gnupg",
    "nginx",
    "certbot",
    "ufw",
    "cron",
    "openssl",
];

/// Services that must be enabled and running
pub const HOST_SERVICES: &[&str] = &["docker", "nginx", "cron"];

/// Firewall rules: SSH stays reachable, HTTP for the challenge, HTTPS
pub const FIREWALL_RULES: &[&str] = &["OpenSSH", "80/tcp", "443/tcp"];

const DOCKER_INSTALL_SCRIPT: &str = "curl -fsSL https://get.docker.com | sh";

/// One unit of host convergence
pub trait ProvisionStep {
    fn name(&self) -> &'static str;

    /// Read-only check of the current state
    fn is_satisfied(&self, host: &dyn Host) -> Result<bool>;

    /// Bring the host into the desired state
    fn apply(&self, host: &dyn Host) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    AlreadySatisfied,
    Applied,
}

/// Run every step whose check fails. Stops at the first error.
pub fn converge(
    host: &dyn Host,
    steps: &[Box<dyn ProvisionStep>],
) -> Result<Vec<(&'static str, StepOutcome)>> {
    let mut outcomes = Vec::with_capacity(steps.len());
    for step in steps {
        let outcome = if step.is_satisfied(host)? {
            log::info!("{}: already in place", step.name());
            StepOutcome::AlreadySatisfied
        } else {
            log::info!("{}: applying", step.name());
            step.apply(host)?;
            StepOutcome::Applied
        };
        outcomes.push((step.name(), outcome));
    }
    Ok(outcomes)
}

/// The installer's provisioning steps in execution order
pub fn host_steps(paths: &InstallPaths, helper_source: PathBuf) -> Vec<Box<dyn ProvisionStep>> {
    vec![
        Box::new(PackagesStep::new(HOST_PACKAGES)),
        Box::new(DockerStep),
        Box::new(FirewallStep::new(FIREWALL_RULES)),
        Box::new(ServicesStep::new(HOST_SERVICES)),
        Box::new(DirectoriesStep::for_install(paths)),
        Box::new(HelperBinaryStep {
            source: helper_source,
            dest: paths.helper_binary(),
        }),
    ]
}

// ============================================================================
// Packages
// ============================================================================

pub struct PackagesStep {
    packages: Vec<String>,
}

impl PackagesStep {
    pub fn new(packages: &[&str]) -> Self {
        Self {
            packages: packages.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn missing(&self, host: &dyn Host) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        for package in &self.packages {
            let out = host.run(&DpkgQueryArgs {
                package: package.clone(),
            })?;
            if !(out.success && DpkgQueryArgs::is_installed(&out.stdout)) {
                missing.push(package.clone());
            }
        }
        Ok(missing)
    }
}

impl ProvisionStep for PackagesStep {
    fn name(&self) -> &'static str {
        "packages"
    }

    fn is_satisfied(&self, host: &dyn Host) -> Result<bool> {
        Ok(self.missing(host)?.is_empty())
    }

    fn apply(&self, host: &dyn Host) -> Result<()> {
        let missing = self.missing(host)?;
        if missing.is_empty() {
            return Ok(());
        }
        log::info!("Installing {}", missing.join(" "));
        host.run_checked(&AptArgs {
            action: AptAction::Update,
        })?;
        host.run_checked(&AptArgs {
            action: AptAction::Install(missing),
        })?;
        Ok(())
    }
}

// ============================================================================
// Docker engine + compose plugin
// ============================================================================

pub struct DockerStep;

impl ProvisionStep for DockerStep {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn is_satisfied(&self, host: &dyn Host) -> Result<bool> {
        Ok(host.run(&DockerArgs::ComposeVersion)?.success)
    }

    fn apply(&self, host: &dyn Host) -> Result<()> {
        host.run_checked(&ShellPipelineArgs {
            script: DOCKER_INSTALL_SCRIPT,
        })?;
        if !host.dry_run() && !host.run(&DockerArgs::ComposeVersion)?.success {
            return Err(DeployError::state(
                "Docker was installed but `docker compose` is not available",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Firewall
// ============================================================================

pub struct FirewallStep {
    rules: Vec<String>,
}

impl FirewallStep {
    pub fn new(rules: &[&str]) -> Self {
        Self {
            rules: rules.iter().map(|r| r.to_string()).collect(),
        }
    }

    /// Active, and every rule appears at the start of a status line
    pub fn status_covers(status: &str, rules: &[String]) -> bool {
        let active = status
            .lines()
            .any(|l| l.trim().eq_ignore_ascii_case("status: active"));
        active
            && rules.iter().all(|rule| {
                status
                    .lines()
                    .any(|l| l.split_whitespace().next() == Some(rule.as_str()))
            })
    }
}

impl ProvisionStep for FirewallStep {
    fn name(&self) -> &'static str {
        "firewall"
    }

    fn is_satisfied(&self, host: &dyn Host) -> Result<bool> {
        let out = host.run(&UfwArgs {
            action: UfwAction::Status,
        })?;
        Ok(out.success && Self::status_covers(&out.stdout, &self.rules))
    }

    fn apply(&self, host: &dyn Host) -> Result<()> {
        for rule in &self.rules {
            host.run_checked(&UfwArgs {
                action: UfwAction::Allow(rule.clone()),
            })?;
        }
        host.run_checked(&UfwArgs {
            action: UfwAction::Enable,
        })?;
        Ok(())
    }
}

// ============================================================================
// System services
// ============================================================================

pub struct ServicesStep {
    units: Vec<String>,
}

impl ServicesStep {
    pub fn new(units: &[&str]) -> Self {
        Self {
            units: units.iter().map(|u| u.to_string()).collect(),
        }
    }
}

impl ProvisionStep for ServicesStep {
    fn name(&self) -> &'static str {
        "services"
    }

    fn is_satisfied(&self, host: &dyn Host) -> Result<bool> {
        for unit in &self.units {
            if !host
                .run(&SystemctlArgs::new(SystemctlAction::IsActive, unit))?
                .success
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn apply(&self, host: &dyn Host) -> Result<()> {
        for unit in &self.units {
            host.run_checked(&SystemctlArgs::new(SystemctlAction::EnableNow, unit))?;
        }
        Ok(())
    }
}

// ============================================================================
// Directories
// ============================================================================

pub struct DirectoriesStep {
    dirs: Vec<PathBuf>,
    /// Subset owned by the container user
    app_owned: Vec<PathBuf>,
}

impl DirectoriesStep {
    pub fn for_install(paths: &InstallPaths) -> Self {
        Self {
            dirs: vec![
                paths.install_dir().to_path_buf(),
                paths.backup_dir().to_path_buf(),
                paths.data_dir(),
                paths.local_files_dir(),
                paths.acme_webroot(),
            ],
            app_owned: vec![paths.data_dir(), paths.local_files_dir()],
        }
    }
}

impl ProvisionStep for DirectoriesStep {
    fn name(&self) -> &'static str {
        "directories"
    }

    fn is_satisfied(&self, _host: &dyn Host) -> Result<bool> {
        Ok(self.dirs.iter().all(|d| d.is_dir()))
    }

    fn apply(&self, host: &dyn Host) -> Result<()> {
        for dir in &self.dirs {
            host::create_dir(host, dir)?;
        }
        for dir in &self.app_owned {
            host.run_checked(&ChownArgs {
                path: dir.clone(),
                uid: APP_UID,
                gid: APP_UID,
            })?;
        }
        Ok(())
    }
}

// ============================================================================
// Helper binary
// ============================================================================

/// Installs this executable where wrappers and cron jobs expect it
pub struct HelperBinaryStep {
    pub source: PathBuf,
    pub dest: PathBuf,
}

impl ProvisionStep for HelperBinaryStep {
    fn name(&self) -> &'static str {
        "helper binary"
    }

    fn is_satisfied(&self, _host: &dyn Host) -> Result<bool> {
        if self.source == self.dest {
            return Ok(true);
        }
        match (fs::read(&self.source), fs::read(&self.dest)) {
            (Ok(src), Ok(dst)) => Ok(src == dst),
            _ => Ok(false),
        }
    }

    fn apply(&self, host: &dyn Host) -> Result<()> {
        let bytes = fs::read(&self.source).map_err(|e| {
            DeployError::state(format!("cannot read {}: {}", self.source.display(), e))
        })?;
        host::write_file(host, &self.dest, &bytes, 0o755)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandArgs;
    use crate::host::CommandOutput;
    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::time::Duration;

    /// Host whose package set and service state change as commands run
    #[derive(Default)]
    struct Fake {
        installed: RefCell<HashSet<String>>,
        log: RefCell<Vec<String>>,
    }

    impl Host for Fake {
        fn run(&self, cmd: &dyn CommandArgs) -> Result<CommandOutput> {
            let args = cmd.to_cli_args();
            self.log.borrow_mut().push(cmd.display());
            Ok(match cmd.program() {
                "dpkg-query" => {
                    let pkg = args.last().cloned().unwrap_or_default();
                    if self.installed.borrow().contains(&pkg) {
                        CommandOutput::ok("install ok installed")
                    } else {
                        CommandOutput::failed(1, "no packages found")
                    }
                }
                "apt-get" if args[0] == "install" => {
                    let mut installed = self.installed.borrow_mut();
                    for pkg in args.iter().skip(4) {
                        installed.insert(pkg.clone());
                    }
                    CommandOutput::ok("")
                }
                _ => CommandOutput::ok(""),
            })
        }

        fn sleep(&self, _duration: Duration) {}
    }

    #[test]
    fn test_packages_only_installs_missing() {
        let host = Fake::default();
        host.installed.borrow_mut().insert("curl".to_string());
        let step = PackagesStep::new(&["curl", "nginx"]);

        assert!(!step.is_satisfied(&host).unwrap());
        step.apply(&host).unwrap();
        assert!(step.is_satisfied(&host).unwrap());

        let log = host.log.borrow();
        let install = log.iter().find(|l| l.starts_with("apt-get install")).unwrap();
        assert!(install.ends_with("nginx"));
        assert!(!install.contains("curl"));
    }

    #[test]
    fn test_converge_skips_satisfied_steps() {
        let host = Fake::default();
        for pkg in HOST_PACKAGES {
            host.installed.borrow_mut().insert(pkg.to_string());
        }
        let steps: Vec<Box<dyn ProvisionStep>> = vec![Box::new(PackagesStep::new(HOST_PACKAGES))];
        let outcomes = converge(&host, &steps).unwrap();
        assert_eq!(outcomes, vec![("packages", StepOutcome::AlreadySatisfied)]);
        assert!(!host.log.borrow().iter().any(|l| l.starts_with("apt-get")));
    }

    #[test]
    fn test_firewall_status_parsing() {
        let rules: Vec<String> = FIREWALL_RULES.iter().map(|r| r.to_string()).collect();
        let status = "Status: active\n\nTo                         Action      From\n\
                      --                         ------      ----\n\
                      OpenSSH                    ALLOW       Anywhere\n\
                      80/tcp                     ALLOW       Anywhere\n\
                      443/tcp                    ALLOW       Anywhere\n";
        assert!(FirewallStep::status_covers(status, &rules));
        assert!(!FirewallStep::status_covers("Status: inactive\n", &rules));
        assert!(!FirewallStep::status_covers(
            "Status: active\nOpenSSH ALLOW Anywhere\n",
            &rules
        ));
    }

    #[test]
    fn test_directories_created_and_chowned() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = InstallPaths::under(tmp.path());
        let host = Fake::default();
        let step = DirectoriesStep::for_install(&paths);

        assert!(!step.is_satisfied(&host).unwrap());
        step.apply(&host).unwrap();
        assert!(step.is_satisfied(&host).unwrap());
        assert!(paths.data_dir().is_dir());
        assert!(paths.acme_webroot().is_dir());

        let chowns = host
            .log
            .borrow()
            .iter()
            .filter(|l| l.starts_with("chown -R 1000:1000"))
            .count();
        assert_eq!(chowns, 2);
    }

    #[test]
    fn test_helper_binary_copied_once() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("n8n-provision-build");
        fs::write(&source, b"\x7fELF-binary").unwrap();
        let step = HelperBinaryStep {
            source,
            dest: tmp.path().join("usr/local/bin/n8n-provision"),
        };
        let host = Fake::default();

        assert!(!step.is_satisfied(&host).unwrap());
        step.apply(&host).unwrap();
        assert!(step.is_satisfied(&host).unwrap());
    }
}
