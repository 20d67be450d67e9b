//! Orchestration sequencer and the installer flow.
//!
//! Services start tier by tier (`ServiceTopology::start_tiers`): every tier
//! that others depend on must report healthy before the next `up`. After the
//! last tier, readiness needs two independent signals:
//!
//! 1. schema readiness: n8n's migration created `public.workflow_entity`
//! 2. service health: every declared service is healthy and the loopback
//!    `/healthz` endpoint answers 200
//!
//! Neither signal implies the other. Containers can be running while the
//! migration is still pending, so success is only reported when both pass.
//!
//! A failed install is left as-is for inspection. There is no rollback.

use crate::certificate::{CertificateAcquirer, CertificateRequest};
use crate::commands::compose::ComposeArgs;
use crate::commands::system::CurlArgs;
use crate::compose::ProjectStatus;
use crate::config_file::{self, InstallerSettings};
use crate::console;
use crate::emitter::{self, WRAPPERS};
use crate::env_file::{EnvironmentConfig, InstallationTarget};
use crate::error::{DeployError, Result};
use crate::host::Host;
use crate::install_state::{InstallStage, InstallerContext};
use crate::manifest::ServiceTopology;
use crate::operator::Operator;
use crate::paths::InstallPaths;
use crate::probe::{self, Inspector};
use crate::provision;
use crate::retry::{Attempt, RetryPolicy, poll_until};
use crate::scheduler;
use crate::secrets::CredentialSet;
use crate::types::ServiceRole;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Table whose presence marks a completed n8n migration
pub const SCHEMA_MARKER_TABLE: &str = "public.workflow_entity";

/// Bounds of both readiness waits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub schema: RetryPolicy,
    pub health: RetryPolicy,
}

impl ReadinessPolicy {
    pub fn from_settings(settings: &InstallerSettings) -> Self {
        Self {
            schema: settings.schema_poll,
            health: settings.health_poll,
        }
    }
}

fn logs_hint(project_dir: &Path, services: &str) -> String {
    let mut hint = format!(
        "inspect logs: docker compose --project-directory {} logs --tail 100",
        project_dir.display()
    );
    if !services.is_empty() {
        hint.push(' ');
        hint.push_str(services);
    }
    hint
}

fn names(roles: &[ServiceRole]) -> Vec<&'static str> {
    roles.iter().map(|r| r.service_name()).collect()
}

/// Bring the topology up in dependency order
pub fn start_services(
    host: &dyn Host,
    project_dir: &Path,
    topology: &ServiceTopology,
    health: &RetryPolicy,
) -> Result<()> {
    let tiers = topology.start_tiers()?;
    let last = tiers.len().saturating_sub(1);
    for (i, tier) in tiers.iter().enumerate() {
        let services = names(tier);
        log::info!("Starting {}", services.join(", "));
        host.run_checked(&ComposeArgs::up(project_dir, &services))?;
        if i < last {
            wait_healthy(host, project_dir, tier, health)?;
        }
    }
    Ok(())
}

/// Poll until every role in `roles` reports healthy
pub fn wait_healthy(
    host: &dyn Host,
    project_dir: &Path,
    roles: &[ServiceRole],
    policy: &RetryPolicy,
) -> Result<()> {
    if host.dry_run() {
        return Ok(());
    }
    let services = names(roles).join(" ");
    poll_until(
        host,
        policy,
        &format!("{} to become healthy", services),
        &logs_hint(project_dir, &services),
        |_| {
            let pending = ProjectStatus::query(host, project_dir)?.unhealthy(roles);
            if pending.is_empty() {
                Ok(Attempt::Done(()))
            } else {
                Ok(Attempt::Retry(pending.join(", ")))
            }
        },
    )?;
    log::info!("{} healthy", services);
    Ok(())
}

/// Poll until the migration has created the marker table
pub fn wait_for_schema(
    host: &dyn Host,
    project_dir: &Path,
    config: &EnvironmentConfig,
    policy: &RetryPolicy,
) -> Result<()> {
    if host.dry_run() {
        return Ok(());
    }
    let query = format!("SELECT to_regclass('{}') IS NOT NULL", SCHEMA_MARKER_TABLE);
    let psql = ComposeArgs::exec(
        project_dir,
        ServiceRole::Database.service_name(),
        &[
            "psql",
            "-U",
            config.postgres_user.as_str(),
            "-d",
            config.postgres_db.as_str(),
            "-tAc",
            query.as_str(),
        ],
    );
    poll_until(
        host,
        policy,
        &format!("database schema ({})", SCHEMA_MARKER_TABLE),
        &logs_hint(project_dir, "n8n postgres"),
        |_| {
            let out = host.run(&psql)?;
            if !out.success {
                let reason = out
                    .stderr
                    .lines()
                    .last()
                    .unwrap_or("database not accepting connections")
                    .to_string();
                return Ok(Attempt::Retry(reason));
            }
            if out.stdout.trim() == "t" {
                Ok(Attempt::Done(()))
            } else {
                Ok(Attempt::Retry("migration not finished".to_string()))
            }
        },
    )?;
    log::info!("Database schema is ready");
    Ok(())
}

/// Poll until every service is healthy and `/healthz` answers 200
pub fn wait_for_health(
    host: &dyn Host,
    project_dir: &Path,
    topology: &ServiceTopology,
    config: &EnvironmentConfig,
    policy: &RetryPolicy,
) -> Result<()> {
    if host.dry_run() {
        return Ok(());
    }
    let roles = topology.roles();
    let health_url = config.local_health_url();
    poll_until(
        host,
        policy,
        "all services to report healthy",
        &logs_hint(project_dir, ""),
        |_| {
            let pending = ProjectStatus::query(host, project_dir)?.unhealthy(&roles);
            if !pending.is_empty() {
                return Ok(Attempt::Retry(pending.join(", ")));
            }
            let out = host.run(&CurlArgs::status_code(health_url.as_str()))?;
            match out.stdout.trim() {
                "200" => Ok(Attempt::Done(())),
                code => Ok(Attempt::Retry(format!("{} returned {}", health_url, code))),
            }
        },
    )?;
    log::info!("All services healthy");
    Ok(())
}

/// Schema readiness, then service health. Both must pass.
pub fn await_readiness(
    host: &dyn Host,
    project_dir: &Path,
    topology: &ServiceTopology,
    config: &EnvironmentConfig,
    policy: &ReadinessPolicy,
) -> Result<()> {
    wait_for_schema(host, project_dir, config, &policy.schema)?;
    wait_for_health(host, project_dir, topology, config, &policy.health)
}

// ============================================================================
// Installer flow
// ============================================================================

/// What a completed installation looks like
#[derive(Debug, Clone)]
pub struct InstallSummary {
    pub url: String,
    pub install_dir: PathBuf,
    pub env_file: PathBuf,
    pub backup_dir: PathBuf,
    pub helpers: Vec<PathBuf>,
    pub execution_mode: String,
    pub worker_replicas: u32,
    pub scheduled: Vec<String>,
}

impl InstallSummary {
    pub fn print(&self) {
        console::heading("n8n is installed");
        console::field("URL", &self.url);
        console::field("Installation", &self.install_dir.display().to_string());
        console::field("Backups", &self.backup_dir.display().to_string());
        console::field(
            "Execution mode",
            &format!("{} ({} worker(s))", self.execution_mode, self.worker_replicas),
        );
        console::heading("Helpers");
        for helper in &self.helpers {
            console::info(&helper.display().to_string());
        }
        console::heading("Scheduled jobs");
        for line in &self.scheduled {
            console::info(line);
        }
        console::heading("Important");
        console::warn(&format!(
            "Store a copy of {} somewhere safe. It holds N8N_ENCRYPTION_KEY; \
             without it stored credentials cannot be decrypted.",
            self.env_file.display()
        ));
    }
}

/// Runs the installation stages in order
pub struct Installer<'a> {
    host: &'a dyn Host,
    operator: &'a dyn Operator,
    inspector: &'a dyn Inspector,
    paths: InstallPaths,
    settings: InstallerSettings,
    helper_source: PathBuf,
    ctx: InstallerContext,
}

impl<'a> Installer<'a> {
    pub fn new(
        host: &'a dyn Host,
        operator: &'a dyn Operator,
        inspector: &'a dyn Inspector,
        paths: InstallPaths,
        settings: InstallerSettings,
        helper_source: PathBuf,
    ) -> Self {
        Self {
            host,
            operator,
            inspector,
            paths,
            settings,
            helper_source,
            ctx: InstallerContext::new(),
        }
    }

    pub fn context(&self) -> &InstallerContext {
        &self.ctx
    }

    /// Run every stage. On failure the stage is recorded and the host is left as-is.
    pub fn run(&mut self) -> Result<InstallSummary> {
        let (domain, email) = self.resolve_target()?;

        let (target, resolved) =
            self.stage(InstallStage::Probing, |me| me.probe(&domain, &email))?;

        self.stage(InstallStage::ProvisioningHost, |me| {
            let steps = provision::host_steps(&me.paths, me.helper_source.clone());
            provision::converge(me.host, &steps)?;
            console::success("host provisioned");
            Ok(())
        })?;

        let creds = self.stage(InstallStage::GeneratingSecrets, |_| {
            let creds = CredentialSet::generate();
            console::success("credentials generated");
            Ok(creds)
        })?;

        let emitted = self.stage(InstallStage::EmittingConfig, |me| {
            let config = EnvironmentConfig::new(&target, &creds, &me.settings);
            let emitted = emitter::emit(me.host, &me.paths, &me.settings, config)?;
            console::success(&format!("configuration written to {}", me.paths.install_dir().display()));
            Ok(emitted)
        })?;
        drop(creds);
        let config = emitted.snapshot.config().clone();

        self.stage(InstallStage::AcquiringCertificate, |me| {
            let request = CertificateRequest {
                domain: target.domain.clone(),
                email: target.email.clone(),
                staging: me.settings.certbot_staging,
                retry: me.settings.certificate_retry,
                resolved: resolved.clone(),
                upstream_port: config.n8n_port,
                payload_max_mib: config.payload_max_mib,
            };
            CertificateAcquirer::new(me.host, &me.paths).run(&request)?;
            console::success(&format!("TLS certificate active for {}", target.domain));
            Ok(())
        })?;

        self.stage(InstallStage::StartingServices, |me| {
            start_services(
                me.host,
                me.paths.install_dir(),
                &emitted.topology,
                &me.settings.health_poll,
            )?;
            console::success("services started");
            Ok(())
        })?;

        self.stage(InstallStage::AwaitingReadiness, |me| {
            await_readiness(
                me.host,
                me.paths.install_dir(),
                &emitted.topology,
                &config,
                &ReadinessPolicy::from_settings(&me.settings),
            )?;
            console::success("n8n is ready");
            Ok(())
        })?;

        let scheduled = self.stage(InstallStage::RegisteringSchedule, |me| {
            let lines = scheduler::register(me.host, &me.paths)?;
            console::success("backup, maintenance and renewal jobs scheduled");
            Ok(lines)
        })?;

        self.ctx.transition_to(InstallStage::Completed)?;

        Ok(InstallSummary {
            url: config.public_url(),
            install_dir: self.paths.host_view(self.paths.install_dir()),
            env_file: self.paths.host_view(&self.paths.env_file()),
            backup_dir: self.paths.host_view(self.paths.backup_dir()),
            helpers: WRAPPERS
                .iter()
                .map(|(file, _)| self.paths.host_view(&self.paths.install_dir().join(file)))
                .collect(),
            execution_mode: config.execution_mode.to_string(),
            worker_replicas: emitted.topology.worker_replicas(),
            scheduled,
        })
    }

    fn stage<T>(&mut self, stage: InstallStage, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        self.ctx.transition_to(stage)?;
        console::stage(
            stage.order(),
            InstallStage::working_stage_count(),
            stage.description(),
        );
        let span = tracing::info_span!("stage", stage = stage.key());
        let _entered = span.enter();

        match f(self) {
            Ok(value) => Ok(value),
            Err(e) => {
                if self.ctx.fail().is_ok() {
                    log::error!("Installation failed during: {}", stage.description());
                }
                if stage.mutates_host() {
                    console::fail(&format!(
                        "{} failed; the host is left as-is for inspection",
                        stage.description()
                    ));
                }
                Err(e)
            }
        }
    }

    /// Domain and email from settings, or asked for
    fn resolve_target(&self) -> Result<(String, String)> {
        let domain = match &self.settings.domain {
            Some(d) => d.clone(),
            None => self
                .operator
                .prompt("Domain name for n8n (e.g. n8n.example.com)", None)?,
        };
        let domain = domain.trim().to_lowercase();
        config_file::validate_domain(&domain).map_err(|e| DeployError::validation(e.to_string()))?;

        let email = match &self.settings.email {
            Some(e) => e.clone(),
            None => self
                .operator
                .prompt("Email for Let's Encrypt notices", None)?,
        };
        let email = email.trim().to_string();
        config_file::validate_email(&email).map_err(|e| DeployError::validation(e.to_string()))?;
        Ok((domain, email))
    }

    /// Gather and judge host facts; returns the target and the domain's addresses
    fn probe(&self, domain: &str, email: &str) -> Result<(InstallationTarget, Vec<IpAddr>)> {
        let facts = self
            .inspector
            .inspect(self.host, &self.paths, &self.settings, domain);
        let report = probe::evaluate(&facts, &self.settings, domain);
        for check in &report.checks {
            console::check(check);
        }
        report.ensure_ok()?;

        for check in report.confirmations() {
            if !self
                .operator
                .confirm(&format!("{}. Continue anyway?", check.detail))?
            {
                return Err(DeployError::aborted(
                    "installation cancelled; nothing was changed",
                ));
            }
        }

        let target = InstallationTarget {
            domain: domain.to_string(),
            email: email.to_string(),
            host_ip: facts.public_ip,
        };
        Ok((target, facts.resolved))
    }
}
