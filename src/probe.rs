//! Environment probe
//!
//! Runs before anything on the host is touched. Fact gathering (`Inspector`)
//! is separate from judgement (`evaluate`) so the rules can be tested without
//! a real host:
//!
//! - **Fatal**: not root, unsupported OS, installation directory exists,
//!   required port bound, domain does not resolve
//! - **Warn**: resources below recommendation, domain not pointing at this
//!   host (the operator decides whether to continue)

use crate::commands::system::CurlArgs;
use crate::config_file::InstallerSettings;
use crate::error::{DeployError, Result};
use crate::host::Host;
use crate::paths::InstallPaths;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, ToSocketAddrs};
use std::path::Path;

pub const MIN_CPU_CORES: usize = 2;
pub const MIN_MEMORY_MB: u64 = 2048;
pub const MIN_DISK_FREE_GB: u64 = 10;
const PUBLIC_IP_URL: &str = "https://api.ipify.org";

/// Parsed `/etc/os-release`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OsRelease {
    pub id: String,
    pub id_like: Vec<String>,
    pub version_id: String,
    pub pretty_name: String,
}

impl OsRelease {
    pub fn parse(content: &str) -> Self {
        let mut os = Self::default();
        for line in content.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').trim_matches('\'').to_string();
            match key.trim() {
                "ID" => os.id = value.to_lowercase(),
                "ID_LIKE" => {
                    os.id_like = value.split_whitespace().map(str::to_lowercase).collect()
                }
                "VERSION_ID" => os.version_id = value,
                "PRETTY_NAME" => os.pretty_name = value,
                _ => {}
            }
        }
        os
    }

    /// Debian, Ubuntu, or a derivative of either
    pub fn is_supported(&self) -> bool {
        let family = |s: &str| s == "debian" || s == "ubuntu";
        family(&self.id) || self.id_like.iter().any(|s| family(s))
    }

    pub fn display_name(&self) -> &str {
        if self.pretty_name.is_empty() {
            &self.id
        } else {
            &self.pretty_name
        }
    }
}

/// Everything the probe looks at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFacts {
    pub is_root: bool,
    pub os: Option<OsRelease>,
    pub install_dir_exists: bool,
    /// Ports that were requested but are already bound
    pub busy_ports: Vec<u16>,
    /// Addresses the target domain resolves to
    pub resolved: Vec<IpAddr>,
    /// This host's public address, if it could be discovered
    pub public_ip: Option<IpAddr>,
    pub cpu_cores: usize,
    pub memory_mb: Option<u64>,
    pub disk_free_gb: Option<u64>,
}

/// Severity of one check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Pass,
    Warn,
    Fatal,
}

/// Outcome of one check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub name: &'static str,
    pub status: CheckStatus,
    pub detail: String,
    pub remediation: Option<String>,
    /// The operator must agree before installation continues
    pub needs_confirmation: bool,
}

impl CheckResult {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Pass,
            detail: detail.into(),
            remediation: None,
            needs_confirmation: false,
        }
    }

    fn warn(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Warn,
            ..Self::pass(name, detail)
        }
    }

    fn fatal(name: &'static str, detail: impl Into<String>, remediation: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Fatal,
            remediation: Some(remediation.into()),
            ..Self::pass(name, detail)
        }
    }
}

impl fmt::Display for CheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.detail)
    }
}

/// All check results, in evaluation order
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProbeReport {
    pub checks: Vec<CheckResult>,
}

impl ProbeReport {
    pub fn fatal(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| c.status == CheckStatus::Fatal)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| c.status == CheckStatus::Warn)
    }

    pub fn is_ok(&self) -> bool {
        self.fatal().next().is_none()
    }

    /// Warnings that require the operator's consent
    pub fn confirmations(&self) -> impl Iterator<Item = &CheckResult> {
        self.warnings().filter(|c| c.needs_confirmation)
    }

    /// First fatal check as a precondition error
    pub fn ensure_ok(&self) -> Result<()> {
        match self.fatal().next() {
            None => Ok(()),
            Some(check) => Err(DeployError::precondition(
                check.detail.clone(),
                check.remediation.clone().unwrap_or_default(),
            )),
        }
    }
}

/// Judge gathered facts
pub fn evaluate(facts: &HostFacts, settings: &InstallerSettings, domain: &str) -> ProbeReport {
    let mut checks = Vec::new();

    checks.push(if facts.is_root {
        CheckResult::pass("privileges", "running as root")
    } else {
        CheckResult::fatal(
            "privileges",
            "not running as root",
            "re-run with sudo: sudo n8n-provision install",
        )
    });

    checks.push(match &facts.os {
        Some(os) if os.is_supported() => CheckResult::pass("os", os.display_name().to_string()),
        Some(os) => CheckResult::fatal(
            "os",
            format!("unsupported operating system: {}", os.display_name()),
            "use a Debian or Ubuntu host",
        ),
        None => CheckResult::fatal(
            "os",
            "cannot read /etc/os-release",
            "use a Debian or Ubuntu host",
        ),
    });

    checks.push(if facts.install_dir_exists {
        CheckResult::fatal(
            "install-dir",
            format!("{} already exists", settings.install_dir.display()),
            format!(
                "an installation is already present; back up {0}/.env, then remove {0} to reinstall",
                settings.install_dir.display()
            ),
        )
    } else {
        CheckResult::pass("install-dir", format!("{} is free", settings.install_dir.display()))
    });

    for port in [settings.n8n_port, settings.postgres_port] {
        checks.push(if facts.busy_ports.contains(&port) {
            CheckResult::fatal(
                "ports",
                format!("port {} is already in use", port),
                format!("stop the process listening on {} (see: ss -ltnp 'sport = :{}')", port, port),
            )
        } else {
            CheckResult::pass("ports", format!("port {} is free", port))
        });
    }

    checks.push(dns_check(facts, domain));

    checks.push(if facts.cpu_cores >= MIN_CPU_CORES {
        CheckResult::pass("cpu", format!("{} cores", facts.cpu_cores))
    } else {
        CheckResult::warn(
            "cpu",
            format!("{} core(s), {} recommended", facts.cpu_cores, MIN_CPU_CORES),
        )
    });

    checks.push(match facts.memory_mb {
        Some(mb) if mb >= MIN_MEMORY_MB => CheckResult::pass("memory", format!("{} MB", mb)),
        Some(mb) => CheckResult::warn(
            "memory",
            format!("{} MB RAM, {} MB recommended", mb, MIN_MEMORY_MB),
        ),
        None => CheckResult::warn("memory", "could not determine installed RAM"),
    });

    checks.push(match facts.disk_free_gb {
        Some(gb) if gb >= MIN_DISK_FREE_GB => CheckResult::pass("disk", format!("{} GB free", gb)),
        Some(gb) => CheckResult::warn(
            "disk",
            format!("{} GB free, {} GB recommended", gb, MIN_DISK_FREE_GB),
        ),
        None => CheckResult::warn("disk", "could not determine free disk space"),
    });

    ProbeReport { checks }
}

fn dns_check(facts: &HostFacts, domain: &str) -> CheckResult {
    if facts.resolved.is_empty() {
        return CheckResult::fatal(
            "dns",
            format!("{} does not resolve", domain),
            format!("create an A record for {} pointing at this server", domain),
        );
    }
    let addrs = facts
        .resolved
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    match facts.public_ip {
        Some(ip) if facts.resolved.contains(&ip) => {
            CheckResult::pass("dns", format!("{} resolves to this host ({})", domain, ip))
        }
        Some(ip) => CheckResult {
            needs_confirmation: true,
            remediation: Some(format!(
                "point {} at {}; certificate issuance fails until it does",
                domain, ip
            )),
            ..CheckResult::warn(
                "dns",
                format!("{} resolves to {} but this host is {}", domain, addrs, ip),
            )
        },
        None => CheckResult::warn(
            "dns",
            format!(
                "{} resolves to {}; could not verify this host's public address",
                domain, addrs
            ),
        ),
    }
}

/// Source of host facts
pub trait Inspector {
    fn inspect(
        &self,
        host: &dyn Host,
        paths: &InstallPaths,
        settings: &InstallerSettings,
        domain: &str,
    ) -> HostFacts;
}

/// Reads facts from the running system
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInspector;

impl Inspector for SystemInspector {
    fn inspect(
        &self,
        host: &dyn Host,
        paths: &InstallPaths,
        settings: &InstallerSettings,
        domain: &str,
    ) -> HostFacts {
        let facts = HostFacts {
            is_root: nix::unistd::geteuid().is_root(),
            os: fs::read_to_string(paths.os_release())
                .ok()
                .map(|c| OsRelease::parse(&c)),
            install_dir_exists: paths.install_dir().exists(),
            busy_ports: [settings.n8n_port, settings.postgres_port]
                .into_iter()
                .filter(|p| port_in_use(*p))
                .collect(),
            resolved: resolve(domain),
            public_ip: public_ip(host),
            cpu_cores: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            memory_mb: fs::read_to_string(paths.meminfo())
                .ok()
                .and_then(|c| parse_meminfo_mb(&c)),
            disk_free_gb: free_disk_gb(paths.install_dir()),
        };
        log::debug!("Host facts: {:?}", facts);
        facts
    }
}

/// A port is busy when binding it reports `AddrInUse`
pub fn port_in_use(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    match TcpListener::bind(addr) {
        Ok(_) => false,
        Err(e) if e.kind() == ErrorKind::AddrInUse => true,
        Err(e) => {
            log::debug!("Could not test port {}: {}", port, e);
            false
        }
    }
}

/// Resolve a domain with the system resolver
pub fn resolve(domain: &str) -> Vec<IpAddr> {
    let mut addrs: Vec<IpAddr> = match (domain, 443).to_socket_addrs() {
        Ok(iter) => iter.map(|sa| sa.ip()).collect(),
        Err(e) => {
            log::debug!("Resolving {} failed: {}", domain, e);
            Vec::new()
        }
    };
    addrs.sort();
    addrs.dedup();
    addrs
}

fn public_ip(host: &dyn Host) -> Option<IpAddr> {
    match host.run(&CurlArgs::fetch(PUBLIC_IP_URL)) {
        Ok(out) if out.success => out.stdout.trim().parse().ok(),
        Ok(out) => {
            log::debug!("Public IP lookup failed: {}", out.stderr.trim());
            None
        }
        Err(e) => {
            log::debug!("Public IP lookup failed: {}", e);
            None
        }
    }
}

/// `MemTotal` in MB
pub fn parse_meminfo_mb(content: &str) -> Option<u64> {
    content
        .lines()
        .find(|l| l.starts_with("MemTotal:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb / 1024)
}

/// Free space on the filesystem that will hold `path`
fn free_disk_gb(path: &Path) -> Option<u64> {
    let existing = path.ancestors().find(|p| p.exists())?;
    match nix::sys::statvfs::statvfs(existing) {
        Ok(stat) => {
            let bytes = stat.blocks_available() as u64 * stat.fragment_size() as u64;
            Some(bytes / (1024 * 1024 * 1024))
        }
        Err(e) => {
            log::debug!("statvfs {} failed: {}", existing.display(), e);
            None
        }
    }
}
