//! Writes the generated files of an installation.
//!
//! | File | Mode | Source |
//! |---|---|---|
//! | `.env` | 0600 | `EnvironmentConfig::render` |
//! | `docker-compose.yml` | 0644 | `ServiceTopology::to_yaml` |
//! | `init-data.sh` | 0755 | fixed database bootstrap |
//! | `provision.json` | 0644 | installer settings |
//! | `backup.sh`, `restore.sh`, `manage-workers.sh`, `update.sh` | 0755 | helper wrappers |
//!
//! Credentials are written exactly once. `emit` refuses to run when an
//! environment file already exists.

use crate::config_file::InstallerSettings;
use crate::env_file::{EnvSnapshot, EnvironmentConfig};
use crate::error::{DeployError, Result};
use crate::host::{self, Host};
use crate::manifest::ServiceTopology;
use crate::paths::InstallPaths;
use std::path::Path;

/// Wrapper script name and the subcommand it forwards to
pub const WRAPPERS: &[(&str, &str)] = &[
    ("backup.sh", "backup"),
    ("restore.sh", "restore"),
    ("manage-workers.sh", "workers"),
    ("update.sh", "upgrade"),
];

/// Runs once, when the database volume is first initialised. Creates the
/// unprivileged role n8n connects as.
pub const DB_INIT_SCRIPT: &str = r#"#!/bin/bash
set -e

if [ -n "${POSTGRES_NON_ROOT_USER:-}" ] && [ -n "${POSTGRES_NON_ROOT_PASSWORD:-}" ]; then
	psql -v ON_ERROR_STOP=1 --username "$POSTGRES_USER" --dbname "$POSTGRES_DB" <<-EOSQL
		CREATE USER "${POSTGRES_NON_ROOT_USER}" WITH PASSWORD '${POSTGRES_NON_ROOT_PASSWORD}';
		GRANT ALL PRIVILEGES ON DATABASE "${POSTGRES_DB}" TO "${POSTGRES_NON_ROOT_USER}";
		GRANT CREATE ON SCHEMA public TO "${POSTGRES_NON_ROOT_USER}";
	EOSQL
else
	echo "SETUP INFO: no non-root database user configured"
fi
"#;

/// Result of a fresh emission
#[derive(Debug)]
pub struct Emitted {
    pub snapshot: EnvSnapshot,
    pub topology: ServiceTopology,
}

/// Write every generated file of a new installation
pub fn emit(
    host: &dyn Host,
    paths: &InstallPaths,
    settings: &InstallerSettings,
    config: EnvironmentConfig,
) -> Result<Emitted> {
    let env_path = paths.env_file();
    if env_path.exists() {
        return Err(DeployError::state(format!(
            "{} already exists; credentials are never regenerated for an existing installation",
            env_path.display()
        )));
    }

    let snapshot = EnvSnapshot::create(host, &env_path, config)?;
    log::info!("Wrote {}", env_path.display());

    let topology = write_manifest(host, paths, snapshot.config())?;

    host::write_file(host, &paths.db_init_script(), DB_INIT_SCRIPT.as_bytes(), 0o755)?;

    let settings_json = serde_json::to_string_pretty(settings)?;
    host::write_file(host, &paths.settings_file(), settings_json.as_bytes(), 0o644)?;

    write_wrappers(host, paths)?;

    host::create_dir(host, &paths.data_dir())?;
    host::create_dir(host, &paths.local_files_dir())?;

    Ok(Emitted { snapshot, topology })
}

/// Render the manifest from the current configuration
pub fn write_manifest(
    host: &dyn Host,
    paths: &InstallPaths,
    config: &EnvironmentConfig,
) -> Result<ServiceTopology> {
    let topology = ServiceTopology::from_config(config);
    let yaml = topology.to_yaml()?;
    host::write_file(host, &paths.manifest_file(), yaml.as_bytes(), 0o644)?;
    log::info!("Wrote {}", paths.manifest_file().display());
    Ok(topology)
}

/// Shell wrapper that forwards to the installed helper binary
pub fn wrapper_script(helper: &Path, settings_file: &Path, subcommand: &str) -> String {
    format!(
        "#!/bin/sh\n\
         # Generated by n8n-provision\n\
         exec {} --settings {} {} \"$@\"\n",
        helper.display(),
        settings_file.display(),
        subcommand
    )
}

fn write_wrappers(host: &dyn Host, paths: &InstallPaths) -> Result<()> {
    let helper = paths.host_view(&paths.helper_binary());
    let settings = paths.host_view(&paths.settings_file());
    for (file, subcommand) in WRAPPERS {
        let script = wrapper_script(&helper, &settings, subcommand);
        host::write_file(host, &paths.install_dir().join(file), script.as_bytes(), 0o755)?;
    }
    Ok(())
}
