//! Restore a backup pair over the live installation.
//!
//! Order of operations:
//!
//! 1. both halves must exist (checked before anything is touched)
//! 2. operator confirmation
//! 3. `compose down`
//! 4. unpack the file archive over the installation directory, reset
//!    ownership of `n8n_data`
//! 5. start the database alone and wait for its health probe
//! 6. replay the dump through `psql` in one transaction, stopping at the
//!    first failed statement
//! 7. start the full topology and wait for readiness

use super::Runtime;
use super::backup::{self, BackupArtifact};
use crate::commands::compose::ComposeArgs;
use crate::commands::system::ChownArgs;
use crate::error::{DeployError, Result};
use crate::manifest::{APP_UID, ServiceTopology};
use crate::operator::require_confirmation;
use crate::sequencer::{await_readiness, start_services, wait_healthy};
use crate::types::ServiceRole;

/// Check that both halves of `timestamp` exist
pub fn locate(rt: &Runtime, timestamp: &str) -> Result<BackupArtifact> {
    backup::parse_timestamp(timestamp)?;
    let artifact = BackupArtifact::locate(rt.paths.backup_dir(), timestamp);
    let missing = artifact.missing();
    if !missing.is_empty() {
        let list = missing
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        return Err(DeployError::validation(format!(
            "backup {} is incomplete, missing: {}; nothing was changed",
            timestamp, list
        )));
    }
    Ok(artifact)
}

pub fn restore(rt: &Runtime, timestamp: &str, assume_yes: bool) -> Result<()> {
    let artifact = locate(rt, timestamp)?;

    require_confirmation(
        rt.operator,
        assume_yes,
        &format!(
            "Restore backup {}? This stops n8n and replaces the database and {}",
            timestamp,
            rt.paths.install_dir().display()
        ),
    )?;

    let dir = rt.project_dir();
    log::info!("Stopping services");
    rt.host.run_checked(&ComposeArgs::down(dir))?;

    if rt.host.dry_run() {
        log::info!("[dry-run] would extract {}", artifact.files.display());
    } else {
        backup::extract_files(&artifact.files, dir)?;
        log::info!("Restored files from {}", artifact.files.display());
    }
    rt.host.run_checked(&ChownArgs {
        path: rt.paths.data_dir(),
        uid: APP_UID,
        gid: APP_UID,
    })?;

    // configuration as it was at backup time
    let env = rt.load_env()?;
    let config = env.config();
    let topology = ServiceTopology::from_config(config);

    let database = ServiceRole::Database.service_name();
    rt.host.run_checked(&ComposeArgs::up(dir, &[database]))?;
    wait_healthy(
        rt.host,
        dir,
        &[ServiceRole::Database],
        &rt.settings.health_poll,
    )?;

    let sql = backup::read_dump(&artifact.database)?;
    log::info!("Replaying {} ({} bytes)", artifact.database.display(), sql.len());
    rt.host.run_checked(&ComposeArgs::exec_with_stdin(
        dir,
        database,
        &[
            "psql",
            "-q",
            "-v",
            "ON_ERROR_STOP=1",
            "--single-transaction",
            "-U",
            config.postgres_user.as_str(),
            "-d",
            config.postgres_db.as_str(),
        ],
        sql,
    ))
    .inspect_err(|_| {
        log::error!(
            "Replay of {} rolled back; only the database is running",
            artifact.database.display()
        )
    })?;

    start_services(rt.host, dir, &topology, &rt.settings.health_poll)?;
    await_readiness(rt.host, dir, &topology, config, &rt.readiness())?;
    log::info!("Backup {} restored", timestamp);
    Ok(())
}
