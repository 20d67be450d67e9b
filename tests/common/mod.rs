//! Shared fixtures for integration tests.
//!
//! `FakeHost` stands in for the machine: it keeps a small model of the
//! compose project (containers per service with stable IDs), the database
//! contents, root's crontab, and the package/firewall state, and answers the
//! typed commands the provisioner issues. Files are written for real under a
//! temp-dir root through `InstallPaths::under`.

#![allow(dead_code)]

use n8n_provision::commands::CommandArgs;
use n8n_provision::env_file::{EnvironmentConfig, InstallationTarget};
use n8n_provision::paths::InstallPaths;
use n8n_provision::probe::{HostFacts, Inspector, OsRelease};
use n8n_provision::secrets::CredentialSet;
use n8n_provision::{
    CommandOutput, EnvSnapshot, Host, InstallerSettings, Result, RetryPolicy, ServiceTopology,
};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

pub const DOMAIN: &str = "n8n.example.com";
pub const EMAIL: &str = "ops@example.com";
pub const HOST_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10));

const SERVICES: &[&str] = &["postgres", "redis", "n8n", "n8n-worker"];

/// A statement the fake database rejects on replay
pub const BROKEN_STATEMENT: &str = "INSERT INTO missing_table";

#[derive(Debug, Default)]
struct Machine {
    /// service -> container IDs
    containers: BTreeMap<String, Vec<String>>,
    next_id: u32,
    schema_ready: bool,
    database: String,
    n8n_version: String,
    crontab: Option<String>,
    packages_installed: bool,
    firewall_active: bool,
    firewall_rules: Vec<String>,
    /// Commands whose display contains this substring fail
    fail_on: Option<String>,
    /// Service whose containers never leave `starting`
    stuck: Option<String>,
}

pub struct FakeHost {
    pub paths: InstallPaths,
    machine: RefCell<Machine>,
    log: RefCell<Vec<String>>,
}

impl FakeHost {
    pub fn new(paths: &InstallPaths) -> Self {
        Self {
            paths: paths.clone(),
            machine: RefCell::new(Machine {
                database: "-- workflows: initial\n".to_string(),
                n8n_version: "1.64.2".to_string(),
                ..Machine::default()
            }),
            log: RefCell::new(Vec::new()),
        }
    }

    /// Every command issued so far, rendered for display
    pub fn commands(&self) -> Vec<String> {
        self.log.borrow().clone()
    }

    pub fn clear_log(&self) {
        self.log.borrow_mut().clear();
    }

    /// Commands that change state
    pub fn mutations(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| !c.contains(" ps ") && !c.starts_with("docker compose version"))
            .filter(|c| !c.contains("--version") && !c.contains("-tAc"))
            .filter(|c| !c.starts_with("dpkg-query") && !c.starts_with("crontab -l"))
            .filter(|c| !c.contains("is-active") && !c.starts_with("ufw status"))
            .filter(|c| !c.contains("%{http_code}"))
            .collect()
    }

    /// IDs of the containers of one service
    pub fn container_ids(&self, service: &str) -> Vec<String> {
        self.machine
            .borrow()
            .containers
            .get(service)
            .cloned()
            .unwrap_or_default()
    }

    pub fn replicas(&self, service: &str) -> usize {
        self.container_ids(service).len()
    }

    pub fn database(&self) -> String {
        self.machine.borrow().database.clone()
    }

    pub fn set_database(&self, content: &str) {
        self.machine.borrow_mut().database = content.to_string();
    }

    pub fn crontab(&self) -> Option<String> {
        self.machine.borrow().crontab.clone()
    }

    pub fn set_crontab(&self, table: &str) {
        self.machine.borrow_mut().crontab = Some(table.to_string());
    }

    pub fn fail_on(&self, needle: &str) {
        self.machine.borrow_mut().fail_on = Some(needle.to_string());
    }

    pub fn keep_unhealthy(&self, service: &str) {
        self.machine.borrow_mut().stuck = Some(service.to_string());
    }

    fn new_id(machine: &mut Machine) -> String {
        machine.next_id += 1;
        format!("c{:04}", machine.next_id)
    }

    /// Replica count compose would take from the manifest/env for `service`
    fn declared_replicas(&self, service: &str) -> usize {
        if service != "n8n-worker" {
            return 1;
        }
        EnvSnapshot::load(&self.paths.env_file())
            .map(|env| env.config().worker_replicas as usize)
            .unwrap_or(1)
    }

    fn compose(&self, args: &[String], stdin: Option<Vec<u8>>) -> CommandOutput {
        // compose --project-directory <dir> -f <file> <action...>
        let action = &args[5..];
        let mut machine = self.machine.borrow_mut();
        match action.first().map(String::as_str) {
            Some("up") => {
                let force = action.iter().any(|a| a == "--force-recreate");
                let mut scale: Option<(String, usize)> = None;
                let mut services = Vec::new();
                let mut iter = action.iter().skip(1);
                while let Some(arg) = iter.next() {
                    match arg.as_str() {
                        "-d" | "--remove-orphans" | "--no-deps" | "--force-recreate" => {}
                        "--scale" => {
                            if let Some((svc, n)) = iter.next().and_then(|s| s.split_once('=')) {
                                scale = Some((svc.to_string(), n.parse().unwrap_or(0)));
                            }
                        }
                        svc => services.push(svc.to_string()),
                    }
                }
                if services.is_empty() {
                    services = SERVICES.iter().map(|s| s.to_string()).collect();
                }
                for service in services {
                    let wanted = match &scale {
                        Some((svc, n)) if *svc == service => *n,
                        _ => {
                            drop(machine);
                            let n = self.declared_replicas(&service);
                            machine = self.machine.borrow_mut();
                            n
                        }
                    };
                    let mut ids = machine.containers.remove(&service).unwrap_or_default();
                    if force {
                        ids.clear();
                    }
                    ids.truncate(wanted);
                    while ids.len() < wanted {
                        let id = Self::new_id(&mut machine);
                        ids.push(id);
                    }
                    if service == "n8n" {
                        machine.schema_ready = true;
                    }
                    machine.containers.insert(service, ids);
                }
                CommandOutput::ok("")
            }
            Some("down") => {
                machine.containers.clear();
                CommandOutput::ok("")
            }
            Some("pull") => CommandOutput::ok(""),
            Some("ps") => {
                let stuck = machine.stuck.as_deref();
                let rows: Vec<String> = machine
                    .containers
                    .iter()
                    .flat_map(|(service, ids)| {
                        let health = if stuck == Some(service.as_str()) {
                            "starting"
                        } else {
                            "healthy"
                        };
                        ids.iter().map(move |id| {
                            format!(
                                r#"{{"ID":"{}","Service":"{}","State":"running","Health":"{}"}}"#,
                                id, service, health
                            )
                        })
                    })
                    .collect();
                CommandOutput::ok(rows.join("\n"))
            }
            Some("exec") => {
                let service = action[2].as_str();
                let argv = &action[3..];
                if !machine.containers.contains_key(service) {
                    return CommandOutput::failed(1, format!("service \"{}\" is not running", service));
                }
                match argv.first().map(String::as_str) {
                    Some("n8n") => CommandOutput::ok(format!("{}\n", machine.n8n_version)),
                    Some("pg_dump") => CommandOutput::ok(machine.database.clone()),
                    Some("psql") if argv.iter().any(|a| a == "-tAc") => {
                        CommandOutput::ok(if machine.schema_ready { "t\n" } else { "f\n" })
                    }
                    Some("psql") => {
                        // psql keeps going past errors and exits 0 unless told to stop
                        let sql = String::from_utf8_lossy(&stdin.unwrap_or_default()).into_owned();
                        let stop = argv.iter().any(|a| a == "ON_ERROR_STOP=1");
                        let atomic = argv.iter().any(|a| a == "--single-transaction");
                        match sql.find(BROKEN_STATEMENT) {
                            Some(at) if stop => {
                                if !atomic {
                                    machine.database = sql[..at].to_string();
                                }
                                CommandOutput::failed(
                                    3,
                                    "ERROR:  relation \"missing_table\" does not exist",
                                )
                            }
                            _ => {
                                machine.database = sql;
                                CommandOutput::ok("")
                            }
                        }
                    }
                    _ => CommandOutput::ok(""),
                }
            }
            _ => CommandOutput::ok(""),
        }
    }

    fn touch(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let _ = fs::write(path, content);
    }

    fn arg_after(args: &[String], flag: &str) -> Option<String> {
        args.windows(2).find(|w| w[0] == flag).map(|w| w[1].clone())
    }
}

impl Host for FakeHost {
    fn run(&self, cmd: &dyn CommandArgs) -> Result<CommandOutput> {
        let display = cmd.display();
        self.log.borrow_mut().push(display.clone());
        let failing = self
            .machine
            .borrow()
            .fail_on
            .clone()
            .filter(|needle| display.contains(needle.as_str()));
        if let Some(needle) = failing {
            return Ok(CommandOutput::failed(1, format!("simulated failure: {}", needle)));
        }

        let args = cmd.to_cli_args();
        let out = match cmd.program() {
            "docker" if args.first().map(String::as_str) == Some("compose") && args.len() > 5 => {
                self.compose(&args, cmd.stdin())
            }
            "docker" => CommandOutput::ok("Docker Compose version v2.29.7\n"),
            "dpkg-query" => {
                if self.machine.borrow().packages_installed {
                    CommandOutput::ok("install ok installed")
                } else {
                    CommandOutput::failed(1, "no packages found")
                }
            }
            "apt-get" => {
                if args.first().map(String::as_str) == Some("install") {
                    self.machine.borrow_mut().packages_installed = true;
                }
                CommandOutput::ok("")
            }
            "ufw" => {
                let mut machine = self.machine.borrow_mut();
                match args.first().map(String::as_str) {
                    Some("status") => {
                        let mut status = if machine.firewall_active {
                            "Status: active\n\nTo Action From\n".to_string()
                        } else {
                            "Status: inactive\n".to_string()
                        };
                        for rule in &machine.firewall_rules {
                            status.push_str(&format!("{} ALLOW Anywhere\n", rule));
                        }
                        CommandOutput::ok(status)
                    }
                    Some("allow") => {
                        if let Some(rule) = args.get(1) {
                            machine.firewall_rules.push(rule.clone());
                        }
                        CommandOutput::ok("Rule added")
                    }
                    _ => {
                        machine.firewall_active = true;
                        CommandOutput::ok("Firewall is active")
                    }
                }
            }
            "curl" => {
                if let Some(dest) = Self::arg_after(&args, "-o").filter(|d| d != "/dev/null") {
                    Self::touch(Path::new(&dest), "# tls options\n");
                    CommandOutput::ok("")
                } else if args.iter().any(|a| a == "%{http_code}") {
                    CommandOutput::ok("200")
                } else {
                    CommandOutput::ok(HOST_IP.to_string())
                }
            }
            "openssl" => {
                if let Some(out) = Self::arg_after(&args, "-out") {
                    Self::touch(Path::new(&out), "DH PARAMETERS");
                }
                CommandOutput::ok("")
            }
            "certbot" => {
                if let Some(domain) = Self::arg_after(&args, "-d") {
                    Self::touch(&self.paths.fullchain(&domain), "CERT");
                    Self::touch(&self.paths.privkey(&domain), "KEY");
                }
                CommandOutput::ok("")
            }
            "crontab" => {
                let mut machine = self.machine.borrow_mut();
                match cmd.stdin() {
                    Some(table) => {
                        machine.crontab = Some(String::from_utf8_lossy(&table).into_owned());
                        CommandOutput::ok("")
                    }
                    None => match &machine.crontab {
                        Some(table) => CommandOutput::ok(table.clone()),
                        None => CommandOutput::failed(1, "no crontab for root"),
                    },
                }
            }
            _ => CommandOutput::ok(""),
        };
        Ok(out)
    }

    fn sleep(&self, _duration: Duration) {}
}

/// Inspector returning fixed facts
pub struct StubInspector {
    pub facts: HostFacts,
}

impl StubInspector {
    /// A host that passes every check
    pub fn healthy() -> Self {
        Self {
            facts: HostFacts {
                is_root: true,
                os: Some(OsRelease::parse(
                    "ID=ubuntu\nID_LIKE=debian\nVERSION_ID=\"24.04\"\nPRETTY_NAME=\"Ubuntu 24.04 LTS\"\n",
                )),
                install_dir_exists: false,
                busy_ports: Vec::new(),
                resolved: vec![HOST_IP],
                public_ip: Some(HOST_IP),
                cpu_cores: 4,
                memory_mb: Some(8192),
                disk_free_gb: Some(80),
            },
        }
    }
}

impl Inspector for StubInspector {
    fn inspect(
        &self,
        _host: &dyn Host,
        _paths: &InstallPaths,
        _settings: &InstallerSettings,
        _domain: &str,
    ) -> HostFacts {
        self.facts.clone()
    }
}

/// Settings with quick polls and a fixed target
pub fn settings() -> InstallerSettings {
    InstallerSettings {
        domain: Some(DOMAIN.to_string()),
        email: Some(EMAIL.to_string()),
        certificate_retry: RetryPolicy::new(2, 0),
        schema_poll: RetryPolicy::new(3, 0),
        health_poll: RetryPolicy::new(3, 0),
        ..InstallerSettings::default()
    }
}

/// Temp root with the production layout below it
pub fn sandbox() -> (TempDir, InstallPaths) {
    let dir = TempDir::new().unwrap();
    let paths = InstallPaths::under(dir.path());
    (dir, paths)
}

/// Executable the installer copies to the helper location
pub fn helper_source(root: &Path) -> PathBuf {
    let path = root.join("build/n8n-provision");
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, b"\x7fELF helper").unwrap();
    path
}

/// An installation that is already running: files emitted, services started
pub fn running_install(host: &FakeHost, paths: &InstallPaths, settings: &InstallerSettings) -> ServiceTopology {
    let target = InstallationTarget {
        domain: DOMAIN.to_string(),
        email: EMAIL.to_string(),
        host_ip: Some(HOST_IP),
    };
    let config = EnvironmentConfig::new(&target, &CredentialSet::generate(), settings);
    let emitted = n8n_provision::emitter::emit(host, paths, settings, config).unwrap();
    n8n_provision::sequencer::start_services(
        host,
        paths.install_dir(),
        &emitted.topology,
        &settings.health_poll,
    )
    .unwrap();
    host.clear_log();
    emitted.topology
}

/// Value of one key in the installation's `.env`
pub fn env_value(paths: &InstallPaths, key: &str) -> Option<String> {
    let content = fs::read_to_string(paths.env_file()).ok()?;
    content
        .lines()
        .filter_map(|l| l.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.to_string())
}
