//! Version query and upgrade.

use super::{Runtime, backup};
use crate::commands::compose::ComposeArgs;
use crate::commands::system::{CurlArgs, DockerArgs};
use crate::config_file::validate_version_pin;
use crate::emitter;
use crate::env_file::keys;
use crate::error::{DeployError, Result};
use crate::operator::require_confirmation;
use crate::sequencer::{await_readiness, start_services};
use crate::types::ServiceRole;

/// Before/after of a completed upgrade
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeReport {
    pub from: String,
    pub to: String,
    pub pin: String,
    pub backup: String,
    /// Public URL answered after the restart (advisory)
    pub reachable: bool,
}

/// Version reported by the running n8n binary
pub fn current_version(rt: &Runtime) -> Result<String> {
    let out = rt.host.run(&ComposeArgs::exec(
        rt.project_dir(),
        ServiceRole::Main.service_name(),
        &["n8n", "--version"],
    ))?;
    let version = out.stdout.trim();
    if !out.success || version.is_empty() {
        return Err(DeployError::state(
            "could not query the n8n version; is the n8n container running?",
        ));
    }
    Ok(version.to_string())
}

/// Upgrade to `target`, asking for it when `None`
pub fn upgrade(rt: &Runtime, target: Option<&str>, assume_yes: bool) -> Result<UpgradeReport> {
    let mut env = rt.load_env()?;
    let from = match current_version(rt) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("{}", e);
            "unknown".to_string()
        }
    };

    let pin = match target {
        Some(t) => t.trim().to_string(),
        None => rt.operator.prompt(
            &format!("Current version {}. Target version (e.g. 1.64.2, or latest)", from),
            Some("latest"),
        )?,
    };
    validate_version_pin(&pin).map_err(|e| DeployError::validation(e.to_string()))?;

    require_confirmation(
        rt.operator,
        assume_yes,
        &format!(
            "Upgrade n8n from {} to {}? A backup is taken first and services restart",
            from, pin
        ),
    )?;

    let backup = backup::create(rt)?;
    log::info!("Pre-upgrade backup {}", backup.timestamp);

    let dir = rt.project_dir();
    rt.host.run_checked(&ComposeArgs::down(dir))?;
    env.update(rt.host, keys::N8N_VERSION, &pin)?;
    let topology = emitter::write_manifest(rt.host, &rt.paths, env.config())?;
    rt.host.run_checked(&ComposeArgs::pull(dir))?;

    start_services(rt.host, dir, &topology, &rt.settings.health_poll)?;
    await_readiness(rt.host, dir, &topology, env.config(), &rt.readiness())?;

    let to = current_version(rt).unwrap_or_else(|_| pin.clone());

    let prune = rt.host.run(&DockerArgs::ImagePrune {
        all: false,
        until: None,
    })?;
    if !prune.success {
        log::warn!("Image prune failed: {}", prune.stderr.trim());
    }

    let reachable = check_public_url(rt, &env.config().public_url());
    Ok(UpgradeReport {
        from,
        to,
        pin,
        backup: backup.timestamp,
        reachable,
    })
}

/// Advisory HTTPS check; a failure only warns
fn check_public_url(rt: &Runtime, url: &str) -> bool {
    if rt.host.dry_run() {
        return true;
    }
    match rt.host.run(&CurlArgs::status_code(url)) {
        Ok(out) if out.stdout.trim().starts_with(['2', '3']) => true,
        Ok(out) => {
            log::warn!("{} answered {}", url, out.stdout.trim());
            false
        }
        Err(e) => {
            log::warn!("{} not reachable: {}", url, e);
            false
        }
    }
}
