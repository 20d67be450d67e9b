//! The installation's `.env` file and its typed view.
//!
//! `.env` is read by every container at start-up and is the single source of
//! truth for topology parameters. Inside this process it is only ever seen as
//! an `EnvironmentConfig`, built once from an `EnvSnapshot`. The snapshot is
//! the one writer: `EnvSnapshot::update` changes a single key, and refuses to
//! write when the file changed on disk after the snapshot was taken.

use crate::config_file::{InstallerSettings, validate_concurrency, validate_version_pin};
use crate::error::{DeployError, Result};
use crate::host::{self, Host};
use crate::secrets::CredentialSet;
use crate::types::{BinaryDataMode, ExecutionMode};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Environment variable names
pub mod keys {
    pub const N8N_HOST: &str = "N8N_HOST";
    pub const N8N_PORT: &str = "N8N_PORT";
    pub const N8N_PROTOCOL: &str = "N8N_PROTOCOL";
    pub const WEBHOOK_URL: &str = "WEBHOOK_URL";
    pub const N8N_EDITOR_BASE_URL: &str = "N8N_EDITOR_BASE_URL";
    pub const N8N_PROXY_HOPS: &str = "N8N_PROXY_HOPS";
    pub const N8N_SECURE_COOKIE: &str = "N8N_SECURE_COOKIE";
    pub const GENERIC_TIMEZONE: &str = "GENERIC_TIMEZONE";
    pub const TZ: &str = "TZ";
    pub const N8N_VERSION: &str = "N8N_VERSION";
    pub const N8N_LOG_LEVEL: &str = "N8N_LOG_LEVEL";
    pub const N8N_DIAGNOSTICS_ENABLED: &str = "N8N_DIAGNOSTICS_ENABLED";

    pub const DB_TYPE: &str = "DB_TYPE";
    pub const DB_POSTGRESDB_HOST: &str = "DB_POSTGRESDB_HOST";
    pub const DB_POSTGRESDB_PORT: &str = "DB_POSTGRESDB_PORT";
    pub const DB_POSTGRESDB_DATABASE: &str = "DB_POSTGRESDB_DATABASE";
    pub const DB_POSTGRESDB_USER: &str = "DB_POSTGRESDB_USER";
    pub const DB_POSTGRESDB_PASSWORD: &str = "DB_POSTGRESDB_PASSWORD";
    pub const POSTGRES_USER: &str = "POSTGRES_USER";
    pub const POSTGRES_PASSWORD: &str = "POSTGRES_PASSWORD";
    pub const POSTGRES_DB: &str = "POSTGRES_DB";
    pub const POSTGRES_NON_ROOT_USER: &str = "POSTGRES_NON_ROOT_USER";
    pub const POSTGRES_NON_ROOT_PASSWORD: &str = "POSTGRES_NON_ROOT_PASSWORD";
    pub const POSTGRES_HOST_PORT: &str = "POSTGRES_HOST_PORT";

    pub const N8N_ENCRYPTION_KEY: &str = "N8N_ENCRYPTION_KEY";

    pub const EXECUTIONS_MODE: &str = "EXECUTIONS_MODE";
    pub const QUEUE_BULL_REDIS_HOST: &str = "QUEUE_BULL_REDIS_HOST";
    pub const QUEUE_BULL_REDIS_PORT: &str = "QUEUE_BULL_REDIS_PORT";
    pub const QUEUE_BULL_REDIS_PASSWORD: &str = "QUEUE_BULL_REDIS_PASSWORD";
    pub const QUEUE_HEALTH_CHECK_ACTIVE: &str = "QUEUE_HEALTH_CHECK_ACTIVE";
    pub const OFFLOAD_MANUAL_EXECUTIONS_TO_WORKERS: &str = "OFFLOAD_MANUAL_EXECUTIONS_TO_WORKERS";
    pub const N8N_WORKER_CONCURRENCY: &str = "N8N_WORKER_CONCURRENCY";
    pub const N8N_WORKER_REPLICAS: &str = "N8N_WORKER_REPLICAS";

    pub const EXECUTIONS_DATA_PRUNE: &str = "EXECUTIONS_DATA_PRUNE";
    pub const EXECUTIONS_DATA_MAX_AGE: &str = "EXECUTIONS_DATA_MAX_AGE";
    pub const EXECUTIONS_DATA_PRUNE_MAX_COUNT: &str = "EXECUTIONS_DATA_PRUNE_MAX_COUNT";

    pub const N8N_DEFAULT_BINARY_DATA_MODE: &str = "N8N_DEFAULT_BINARY_DATA_MODE";
    pub const N8N_PAYLOAD_SIZE_MAX: &str = "N8N_PAYLOAD_SIZE_MAX";
}

/// Compose service names double as container hostnames on the project network
const DB_SERVICE_HOST: &str = "postgres";
const REDIS_SERVICE_HOST: &str = "redis";
/// Ports inside the containers (host bindings are configured separately)
const DB_CONTAINER_PORT: u16 = 5432;
const REDIS_CONTAINER_PORT: u16 = 6379;

const POSTGRES_SUPERUSER: &str = "postgres";
const APP_DB_USER: &str = "n8n";
const APP_DB_NAME: &str = "n8n";

/// Where and for whom the deployment is installed. Fixed at install start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationTarget {
    pub domain: String,
    pub email: String,
    /// Public address of this host, when it could be discovered
    pub host_ip: Option<IpAddr>,
}

/// Typed view of `.env`
#[derive(Clone, PartialEq, Eq)]
pub struct EnvironmentConfig {
    pub domain: String,
    pub n8n_port: u16,
    pub proxy_hops: u32,
    pub timezone: String,
    pub n8n_version: String,
    pub log_level: String,

    pub postgres_user: String,
    pub postgres_password: String,
    pub postgres_db: String,
    pub app_db_user: String,
    pub app_db_password: String,
    pub postgres_host_port: u16,

    pub encryption_key: String,

    pub execution_mode: ExecutionMode,
    pub redis_password: String,
    pub worker_concurrency: u32,
    pub worker_replicas: u32,

    pub execution_max_age_hours: u32,
    pub execution_max_count: u32,

    pub binary_data_mode: BinaryDataMode,
    pub payload_max_mib: u32,
}

impl EnvironmentConfig {
    /// Assemble the configuration of a new installation
    pub fn new(
        target: &InstallationTarget,
        creds: &CredentialSet,
        settings: &InstallerSettings,
    ) -> Self {
        Self {
            domain: target.domain.clone(),
            n8n_port: settings.n8n_port,
            proxy_hops: settings.proxy_hops,
            timezone: settings.timezone.clone(),
            n8n_version: settings.n8n_version.clone(),
            log_level: settings.log_level.clone(),
            postgres_user: POSTGRES_SUPERUSER.to_string(),
            postgres_password: creds.postgres_password.clone(),
            postgres_db: APP_DB_NAME.to_string(),
            app_db_user: APP_DB_USER.to_string(),
            app_db_password: creds.app_db_password.clone(),
            postgres_host_port: settings.postgres_port,
            encryption_key: creds.encryption_key.clone(),
            execution_mode: settings.execution_mode,
            redis_password: creds.redis_password.clone(),
            worker_concurrency: settings.worker_concurrency,
            worker_replicas: if settings.execution_mode.uses_workers() {
                settings.worker_replicas
            } else {
                0
            },
            execution_max_age_hours: settings.execution_max_age_hours,
            execution_max_count: settings.execution_max_count,
            binary_data_mode: settings.binary_data_mode,
            payload_max_mib: settings.payload_max_mib,
        }
    }

    /// Public URL of the editor and webhooks
    pub fn public_url(&self) -> String {
        format!("https://{}/", self.domain)
    }

    /// Loopback health endpoint of the main service
    pub fn local_health_url(&self) -> String {
        format!("http://127.0.0.1:{}/healthz", self.n8n_port)
    }

    /// Ordered sections of `KEY=VALUE` pairs
    fn sections(&self) -> Vec<(&'static str, Vec<(&'static str, String)>)> {
        use keys::*;
        let url = self.public_url();
        vec![
            (
                "Site",
                vec![
                    (N8N_HOST, self.domain.clone()),
                    (N8N_PORT, self.n8n_port.to_string()),
                    (N8N_PROTOCOL, "https".to_string()),
                    (WEBHOOK_URL, url.clone()),
                    (N8N_EDITOR_BASE_URL, url),
                    (N8N_PROXY_HOPS, self.proxy_hops.to_string()),
                    (N8N_SECURE_COOKIE, "true".to_string()),
                    (GENERIC_TIMEZONE, self.timezone.clone()),
                    (TZ, self.timezone.clone()),
                    (N8N_VERSION, self.n8n_version.clone()),
                    (N8N_LOG_LEVEL, self.log_level.clone()),
                    (N8N_DIAGNOSTICS_ENABLED, "false".to_string()),
                ],
            ),
            (
                "Database",
                vec![
                    (DB_TYPE, "postgresdb".to_string()),
                    (DB_POSTGRESDB_HOST, DB_SERVICE_HOST.to_string()),
                    (DB_POSTGRESDB_PORT, DB_CONTAINER_PORT.to_string()),
                    (DB_POSTGRESDB_DATABASE, self.postgres_db.clone()),
                    (DB_POSTGRESDB_USER, self.app_db_user.clone()),
                    (DB_POSTGRESDB_PASSWORD, self.app_db_password.clone()),
                    (POSTGRES_USER, self.postgres_user.clone()),
                    (POSTGRES_PASSWORD, self.postgres_password.clone()),
                    (POSTGRES_DB, self.postgres_db.clone()),
                    (POSTGRES_NON_ROOT_USER, self.app_db_user.clone()),
                    (POSTGRES_NON_ROOT_PASSWORD, self.app_db_password.clone()),
                    (POSTGRES_HOST_PORT, self.postgres_host_port.to_string()),
                ],
            ),
            (
                "Encryption (store a copy safely: losing it makes saved credentials unreadable)",
                vec![(N8N_ENCRYPTION_KEY, self.encryption_key.clone())],
            ),
            (
                "Queue",
                vec![
                    (EXECUTIONS_MODE, self.execution_mode.to_string()),
                    (QUEUE_BULL_REDIS_HOST, REDIS_SERVICE_HOST.to_string()),
                    (QUEUE_BULL_REDIS_PORT, REDIS_CONTAINER_PORT.to_string()),
                    (QUEUE_BULL_REDIS_PASSWORD, self.redis_password.clone()),
                    (QUEUE_HEALTH_CHECK_ACTIVE, "true".to_string()),
                    (
                        OFFLOAD_MANUAL_EXECUTIONS_TO_WORKERS,
                        self.execution_mode.uses_workers().to_string(),
                    ),
                    (N8N_WORKER_CONCURRENCY, self.worker_concurrency.to_string()),
                    (N8N_WORKER_REPLICAS, self.worker_replicas.to_string()),
                ],
            ),
            (
                "Execution history",
                vec![
                    (EXECUTIONS_DATA_PRUNE, "true".to_string()),
                    (EXECUTIONS_DATA_MAX_AGE, self.execution_max_age_hours.to_string()),
                    (
                        EXECUTIONS_DATA_PRUNE_MAX_COUNT,
                        self.execution_max_count.to_string(),
                    ),
                ],
            ),
            (
                "Binary data",
                vec![
                    (N8N_DEFAULT_BINARY_DATA_MODE, self.binary_data_mode.to_string()),
                    (N8N_PAYLOAD_SIZE_MAX, self.payload_max_mib.to_string()),
                ],
            ),
        ]
    }

    /// Render the file contents
    pub fn render(&self) -> String {
        let mut out = String::from("# Generated by n8n-provision. Change values with n8n-provision, not by hand.\n");
        for (title, entries) in self.sections() {
            out.push_str(&format!("\n# {}\n", title));
            for (key, value) in entries {
                out.push_str(key);
                out.push('=');
                out.push_str(&value);
                out.push('\n');
            }
        }
        out
    }

    /// Parse file contents
    pub fn parse(content: &str) -> Result<Self> {
        let map = parse_pairs(content)?;
        Self::from_pairs(&map)
    }

    fn from_pairs(map: &BTreeMap<String, String>) -> Result<Self> {
        use keys::*;

        let config = Self {
            domain: required(map, N8N_HOST)?,
            n8n_port: number(map, N8N_PORT)?,
            proxy_hops: number(map, N8N_PROXY_HOPS)?,
            timezone: required(map, GENERIC_TIMEZONE)?,
            n8n_version: required(map, N8N_VERSION)?,
            log_level: map
                .get(N8N_LOG_LEVEL)
                .cloned()
                .unwrap_or_else(|| "info".to_string()),
            postgres_user: required(map, POSTGRES_USER)?,
            postgres_password: required(map, POSTGRES_PASSWORD)?,
            postgres_db: required(map, POSTGRES_DB)?,
            app_db_user: required(map, DB_POSTGRESDB_USER)?,
            app_db_password: required(map, DB_POSTGRESDB_PASSWORD)?,
            postgres_host_port: number(map, POSTGRES_HOST_PORT)?,
            encryption_key: required(map, N8N_ENCRYPTION_KEY)?,
            execution_mode: number(map, EXECUTIONS_MODE)?,
            redis_password: required(map, QUEUE_BULL_REDIS_PASSWORD)?,
            worker_concurrency: number(map, N8N_WORKER_CONCURRENCY)?,
            worker_replicas: number(map, N8N_WORKER_REPLICAS)?,
            execution_max_age_hours: number(map, EXECUTIONS_DATA_MAX_AGE)?,
            execution_max_count: number(map, EXECUTIONS_DATA_PRUNE_MAX_COUNT)?,
            binary_data_mode: number(map, N8N_DEFAULT_BINARY_DATA_MODE)?,
            payload_max_mib: number(map, N8N_PAYLOAD_SIZE_MAX)?,
        };
        config.check()?;
        Ok(config)
    }

    /// Invariants a readable `.env` must hold
    fn check(&self) -> Result<()> {
        validate_concurrency(self.worker_concurrency)
            .map_err(|e| DeployError::config(format!("{}: {}", keys::N8N_WORKER_CONCURRENCY, e)))?;
        validate_version_pin(&self.n8n_version)
            .map_err(|e| DeployError::config(format!("{}: {}", keys::N8N_VERSION, e)))?;
        if self.execution_mode.uses_workers() && self.worker_replicas < 1 {
            return Err(DeployError::config(format!(
                "{} must be at least 1 in queue mode",
                keys::N8N_WORKER_REPLICAS
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for EnvironmentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvironmentConfig")
            .field("domain", &self.domain)
            .field("n8n_port", &self.n8n_port)
            .field("n8n_version", &self.n8n_version)
            .field("execution_mode", &self.execution_mode)
            .field("worker_replicas", &self.worker_replicas)
            .field("worker_concurrency", &self.worker_concurrency)
            .field("postgres_password", &"<redacted>")
            .field("app_db_password", &"<redacted>")
            .field("encryption_key", &"<redacted>")
            .field("redis_password", &"<redacted>")
            .finish_non_exhaustive()
    }
}

fn required(map: &BTreeMap<String, String>, key: &str) -> Result<String> {
    match map.get(key) {
        Some(value) if !value.is_empty() => Ok(value.clone()),
        _ => Err(DeployError::config(format!("{} is missing from .env", key))),
    }
}

fn number<T: FromStr>(map: &BTreeMap<String, String>, key: &str) -> Result<T> {
    let raw = required(map, key)?;
    raw.parse()
        .map_err(|_| DeployError::config(format!("{}={} is not a valid value", key, raw)))
}

/// Parse `KEY=VALUE` lines, skipping blanks and comments
pub fn parse_pairs(content: &str) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(DeployError::config(format!(
                ".env line {} is not KEY=VALUE",
                idx + 1
            )));
        };
        map.insert(key.trim().to_string(), unquote(value.trim()).to_string());
    }
    Ok(map)
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

fn revision_of(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

/// `EnvironmentConfig` plus the revision of the file it was read from
#[derive(Debug, Clone)]
pub struct EnvSnapshot {
    path: PathBuf,
    config: EnvironmentConfig,
    revision: u64,
}

impl EnvSnapshot {
    /// Read and parse the file
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| {
            DeployError::state(format!(
                "cannot read {} ({}); is n8n installed?",
                path.display(),
                e
            ))
        })?;
        let content = String::from_utf8_lossy(&bytes);
        Ok(Self {
            path: path.to_path_buf(),
            config: EnvironmentConfig::parse(&content)?,
            revision: revision_of(&bytes),
        })
    }

    /// Write a fresh file for a new installation
    pub fn create(host: &dyn Host, path: &Path, config: EnvironmentConfig) -> Result<Self> {
        let rendered = config.render();
        host::write_file(host, path, rendered.as_bytes(), 0o600)?;
        Ok(Self {
            path: path.to_path_buf(),
            config,
            revision: revision_of(rendered.as_bytes()),
        })
    }

    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the value of one key.
    ///
    /// The file is re-read and must still match the snapshot's revision. The
    /// new content must parse into a valid configuration before it is written.
    pub fn update(&mut self, host: &dyn Host, key: &str, value: &str) -> Result<()> {
        if value.contains('\n') || value.contains('\r') {
            return Err(DeployError::validation(format!("{} value contains a newline", key)));
        }

        let bytes = fs::read(&self.path)?;
        if revision_of(&bytes) != self.revision {
            return Err(DeployError::state(format!(
                "{} changed on disk since it was read; re-run the command",
                self.path.display()
            )));
        }

        let current = String::from_utf8_lossy(&bytes).into_owned();
        let prefix = format!("{}=", key);
        let matches = current
            .lines()
            .filter(|l| l.trim_start().starts_with(&prefix))
            .count();
        if matches != 1 {
            return Err(DeployError::config(format!(
                "expected exactly one {} line in {}, found {}",
                key,
                self.path.display(),
                matches
            )));
        }

        let mut updated = String::with_capacity(current.len() + value.len());
        for line in current.lines() {
            if line.trim_start().starts_with(&prefix) {
                updated.push_str(&prefix);
                updated.push_str(value);
            } else {
                updated.push_str(line);
            }
            updated.push('\n');
        }

        let config = EnvironmentConfig::parse(&updated)?;
        host::write_file(host, &self.path, updated.as_bytes(), 0o600)?;
        log::info!("Set {} in {}", key, self.path.display());

        self.config = config;
        self.revision = revision_of(updated.as_bytes());
        Ok(())
    }
}

/// Fixed configuration for unit tests across the crate
#[cfg(test)]
pub(crate) fn sample_config() -> EnvironmentConfig {
    let target = InstallationTarget {
        domain: "n8n.example.com".to_string(),
        email: "ops@example.com".to_string(),
        host_ip: None,
    };
    let creds = CredentialSet {
        postgres_password: "rootpw".to_string(),
        app_db_password: "apppw".to_string(),
        encryption_key: "enckey".to_string(),
        redis_password: "redispw".to_string(),
    };
    EnvironmentConfig::new(&target, &creds, &InstallerSettings::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::SystemHost;

    #[test]
    fn test_render_parse_roundtrip() {
        let config = sample_config();
        let parsed = EnvironmentConfig::parse(&config.render()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_render_contains_each_secret_once() {
        let rendered = sample_config().render();
        assert_eq!(rendered.matches("N8N_ENCRYPTION_KEY=").count(), 1);
        assert_eq!(rendered.matches("POSTGRES_PASSWORD=rootpw").count(), 1);
        assert!(rendered.contains("WEBHOOK_URL=https://n8n.example.com/\n"));
        assert!(rendered.contains("EXECUTIONS_MODE=queue\n"));
        assert!(rendered.contains("N8N_PROXY_HOPS=1\n"));
        assert!(rendered.contains("EXECUTIONS_DATA_MAX_AGE=336\n"));
    }

    #[test]
    fn test_parse_reports_missing_key() {
        let rendered = sample_config().render().replace("N8N_ENCRYPTION_KEY=", "# gone=");
        let err = EnvironmentConfig::parse(&rendered).unwrap_err();
        assert!(err.to_string().contains("N8N_ENCRYPTION_KEY"));
    }

    #[test]
    fn test_parse_rejects_garbage_line() {
        assert!(parse_pairs("JUST_A_WORD\n").is_err());
        let map = parse_pairs("# c\n\nA=\"quoted\"\nB=x=y\n").unwrap();
        assert_eq!(map["A"], "quoted");
        assert_eq!(map["B"], "x=y");
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let debug = format!("{:?}", sample_config());
        assert!(!debug.contains("enckey"));
        assert!(!debug.contains("rootpw"));
        assert!(debug.contains("n8n.example.com"));
    }

    #[test]
    fn test_update_replaces_single_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        let host = SystemHost::new(false);
        let mut snap = EnvSnapshot::create(&host, &path, sample_config()).unwrap();
        let before = snap.revision();

        snap.update(&host, keys::N8N_WORKER_CONCURRENCY, "5").unwrap();

        assert_eq!(snap.config().worker_concurrency, 5);
        assert_ne!(snap.revision(), before);
        let on_disk = EnvSnapshot::load(&path).unwrap();
        assert_eq!(on_disk.config().worker_concurrency, 5);
        assert_eq!(on_disk.revision(), snap.revision());
        // everything else unchanged
        let mut expected = sample_config();
        expected.worker_concurrency = 5;
        assert_eq!(on_disk.config(), &expected);
    }

    #[test]
    fn test_update_refuses_stale_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        let host = SystemHost::new(false);
        let mut snap = EnvSnapshot::create(&host, &path, sample_config()).unwrap();

        let mut edited = fs::read_to_string(&path).unwrap();
        edited.push_str("# touched\n");
        fs::write(&path, edited).unwrap();

        let err = snap.update(&host, keys::N8N_VERSION, "1.70.0").unwrap_err();
        assert!(matches!(err, DeployError::State(_)));
    }

    #[test]
    fn test_update_rejects_invalid_value_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        let host = SystemHost::new(false);
        let mut snap = EnvSnapshot::create(&host, &path, sample_config()).unwrap();
        let before = fs::read(&path).unwrap();

        assert!(snap.update(&host, keys::N8N_WORKER_CONCURRENCY, "50").is_err());
        assert!(snap.update(&host, "NOT_A_KEY", "1").is_err());
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn test_regular_mode_has_no_workers() {
        let target = InstallationTarget {
            domain: "a.example.com".to_string(),
            email: "a@example.com".to_string(),
            host_ip: None,
        };
        let settings = InstallerSettings {
            execution_mode: ExecutionMode::Regular,
            ..Default::default()
        };
        let config = EnvironmentConfig::new(&target, &CredentialSet::generate(), &settings);
        assert_eq!(config.worker_replicas, 0);
        assert!(config.render().contains("OFFLOAD_MANUAL_EXECUTIONS_TO_WORKERS=false"));
    }
}
