//! Installer settings: tuning defaults loaded from an optional JSON file.
//!
//! Every knob has a default, so a settings file only needs the keys it
//! changes. Unknown keys are rejected to catch typos early.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::retry::RetryPolicy;
use crate::types::{BinaryDataMode, ExecutionMode};

/// Lowest accepted worker concurrency
pub const MIN_CONCURRENCY: u32 = 1;
/// Highest accepted worker concurrency
pub const MAX_CONCURRENCY: u32 = 20;

/// Installer tuning that ends up in the generated configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstallerSettings {
    // Target (prompted for when absent)
    pub domain: Option<String>,
    pub email: Option<String>,

    // Layout
    pub install_dir: PathBuf,
    pub backup_dir: Option<PathBuf>,

    // Ports bound on the loopback interface
    pub n8n_port: u16,
    pub postgres_port: u16,

    // Application
    pub n8n_version: String,
    pub timezone: String,
    pub log_level: String,
    pub execution_mode: ExecutionMode,
    pub worker_replicas: u32,
    pub worker_concurrency: u32,

    // Execution history retention (pruned by n8n itself)
    pub execution_max_age_hours: u32,
    pub execution_max_count: u32,

    // Binary payloads
    pub binary_data_mode: BinaryDataMode,
    pub payload_max_mib: u32,

    // Reverse proxy
    pub proxy_hops: u32,

    // Operations
    pub backup_retention_days: u32,
    pub certbot_staging: bool,
    pub certificate_retry: RetryPolicy,
    pub schema_poll: RetryPolicy,
    pub health_poll: RetryPolicy,
}

impl Default for InstallerSettings {
    fn default() -> Self {
        Self {
            domain: None,
            email: None,
            install_dir: PathBuf::from("/opt/n8n"),
            backup_dir: None,
            n8n_port: 5678,
            postgres_port: 5432,
            n8n_version: "latest".to_string(),
            timezone: "UTC".to_string(),
            log_level: "info".to_string(),
            execution_mode: ExecutionMode::Queue,
            worker_replicas: 1,
            worker_concurrency: 10,
            execution_max_age_hours: 336,
            execution_max_count: 10_000,
            binary_data_mode: BinaryDataMode::Filesystem,
            payload_max_mib: 16,
            proxy_hops: 1,
            backup_retention_days: 14,
            certbot_staging: false,
            certificate_retry: RetryPolicy::new(3, 30),
            schema_poll: RetryPolicy::new(60, 5),
            health_poll: RetryPolicy::new(30, 10),
        }
    }
}

impl InstallerSettings {
    /// Save settings to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json =
            serde_json::to_string_pretty(self).context("Failed to serialize settings to JSON")?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write settings to {:?}", path.as_ref()))?;
        Ok(())
    }

    /// Load settings from a JSON file, without validating them
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read settings from {:?}", path.as_ref()))?;
        let settings: Self =
            serde_json::from_str(&content).context("Failed to parse settings JSON")?;
        Ok(settings.normalized())
    }

    /// Load, normalize, and validate
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = Self::load_from_file(&path)?;
        settings
            .validate()
            .with_context(|| format!("Invalid settings in {:?}", path.as_ref()))?;
        Ok(settings)
    }

    /// Regular mode runs no workers
    pub fn normalized(mut self) -> Self {
        if !self.execution_mode.uses_workers() {
            self.worker_replicas = 0;
        }
        self
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        if let Some(domain) = &self.domain {
            validate_domain(domain)?;
        }
        if let Some(email) = &self.email {
            validate_email(email)?;
        }

        if !self.install_dir.is_absolute() {
            anyhow::bail!("install_dir must be an absolute path");
        }
        if let Some(dir) = &self.backup_dir {
            if !dir.is_absolute() {
                anyhow::bail!("backup_dir must be an absolute path");
            }
        }

        if self.n8n_port == 0 || self.postgres_port == 0 {
            anyhow::bail!("Ports must be non-zero");
        }
        if self.n8n_port == self.postgres_port {
            anyhow::bail!("n8n_port and postgres_port must differ");
        }

        validate_version_pin(&self.n8n_version)?;
        validate_concurrency(self.worker_concurrency)?;

        if self.execution_mode.uses_workers() && self.worker_replicas < 1 {
            anyhow::bail!("Queue mode needs at least 1 worker replica");
        }

        if self.timezone.trim().is_empty() || self.timezone.contains(char::is_whitespace) {
            anyhow::bail!("timezone must be an IANA name such as Europe/Berlin");
        }
        if !matches!(
            self.log_level.as_str(),
            "error" | "warn" | "info" | "debug"
        ) {
            anyhow::bail!("log_level must be one of error, warn, info, debug");
        }

        if self.execution_max_age_hours < 1 {
            anyhow::bail!("execution_max_age_hours must be at least 1");
        }
        if self.execution_max_count < 1 {
            anyhow::bail!("execution_max_count must be at least 1");
        }
        if self.payload_max_mib < 1 {
            anyhow::bail!("payload_max_mib must be at least 1");
        }
        if self.proxy_hops < 1 {
            anyhow::bail!("proxy_hops must be at least 1");
        }
        if self.backup_retention_days < 1 {
            anyhow::bail!("backup_retention_days must be at least 1");
        }

        for (name, policy) in [
            ("certificate_retry", &self.certificate_retry),
            ("schema_poll", &self.schema_poll),
            ("health_poll", &self.health_poll),
        ] {
            if policy.attempts < 1 {
                anyhow::bail!("{}.attempts must be at least 1", name);
            }
        }

        Ok(())
    }
}

/// Worker concurrency must be within 1-20
pub fn validate_concurrency(value: u32) -> Result<()> {
    if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&value) {
        anyhow::bail!(
            "Worker concurrency must be between {} and {} (got {})",
            MIN_CONCURRENCY,
            MAX_CONCURRENCY,
            value
        );
    }
    Ok(())
}

/// `latest`, `next`, or a dotted numeric version such as `1.64.2`
pub fn validate_version_pin(version: &str) -> Result<()> {
    if version == "latest" || version == "next" {
        return Ok(());
    }
    let parts: Vec<&str> = version.split('.').collect();
    let numeric = parts.len() >= 2
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
    if !numeric {
        anyhow::bail!(
            "Version must be 'latest', 'next', or a version number like 1.64.2 (got '{}')",
            version
        );
    }
    Ok(())
}

/// Fully-qualified hostname: at least two labels of letters, digits, and hyphens
pub fn validate_domain(domain: &str) -> Result<()> {
    let domain = domain.trim();
    if domain.is_empty() {
        anyhow::bail!("Domain must be specified");
    }
    if domain.len() > 253 {
        anyhow::bail!("Domain is longer than 253 characters");
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        anyhow::bail!("Domain must be fully qualified (e.g. n8n.example.com)");
    }
    for label in labels {
        if label.is_empty() || label.len() > 63 {
            anyhow::bail!("Domain label '{}' must be 1-63 characters", label);
        }
        if label.starts_with('-') || label.ends_with('-') {
            anyhow::bail!("Domain label '{}' cannot start or end with a hyphen", label);
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            anyhow::bail!("Domain can only contain letters, numbers, hyphens, and dots");
        }
    }
    Ok(())
}

/// Contact address for the certificate authority
pub fn validate_email(email: &str) -> Result<()> {
    let email = email.trim();
    match email.split_once('@') {
        Some((local, host))
            if !local.is_empty()
                && host.contains('.')
                && !email.contains(char::is_whitespace) =>
        {
            Ok(())
        }
        _ => anyhow::bail!("Email address '{}' is not valid", email),
    }
}
