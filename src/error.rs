//! Error handling module for n8n-provision
//!
//! Provides centralized error handling with proper error types using thiserror.
//! Variants follow the failure taxonomy of the provisioner: precondition
//! failures are detected before any mutation, transient failures are retried
//! with a bound, readiness timeouts and command failures are fatal and never
//! rolled back automatically.

use std::net::IpAddr;
use thiserror::Error;

/// Main error type for n8n-provision
#[derive(Error, Debug)]
pub enum DeployError {
    /// Host precondition not met (not root, unsupported OS, port in use, ...).
    /// Raised before anything on the host has been touched.
    #[error("Precondition failed: {check}\n  → {remediation}")]
    Precondition { check: String, remediation: String },

    /// Operator input rejected (out-of-range value, missing argument, ...)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operator declined a destructive operation
    #[error("Aborted: {0}")]
    Aborted(String),

    /// Certificate authority kept rejecting the challenge
    #[error(
        "Certificate issuance for {domain} failed after {attempts} attempt(s): {last_error}\n  \
         → domain resolves to: {}\n  \
         → retry manually: certbot certonly --webroot -w /var/www/certbot -d {domain}",
        format_addrs(resolved)
    )]
    CertificateIssuance {
        domain: String,
        attempts: u32,
        resolved: Vec<IpAddr>,
        last_error: String,
    },

    /// A readiness signal never appeared within its bound
    #[error("Timed out after {waited_secs}s waiting for {signal}\n  → {hint}")]
    ReadinessTimeout {
        signal: String,
        waited_secs: u64,
        hint: String,
    },

    /// External command exited non-zero
    #[error("Command `{command}` failed (exit code {code}): {stderr}")]
    Command {
        command: String,
        code: i32,
        stderr: String,
    },

    /// Configuration errors (settings file, environment file, rendering)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unexpected on-disk or runtime state
    #[error("State error: {0}")]
    State(String),

    /// Install state machine transition errors
    #[error("Install transition error: {0}")]
    InstallTransition(String),

    /// IO errors (file operations, terminal, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type alias for provisioning operations
pub type Result<T> = std::result::Result<T, DeployError>;

fn format_addrs(addrs: &[IpAddr]) -> String {
    if addrs.is_empty() {
        "nothing (no DNS records)".to_string()
    } else {
        addrs
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

// Convenient error constructors
impl DeployError {
    /// Create a precondition error with remediation text
    pub fn precondition(check: impl Into<String>, remediation: impl Into<String>) -> Self {
        Self::Precondition {
            check: check.into(),
            remediation: remediation.into(),
        }
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an aborted error
    pub fn aborted(msg: impl Into<String>) -> Self {
        Self::Aborted(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a state error
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Create a readiness timeout error
    pub fn readiness_timeout(
        signal: impl Into<String>,
        waited_secs: u64,
        hint: impl Into<String>,
    ) -> Self {
        Self::ReadinessTimeout {
            signal: signal.into(),
            waited_secs,
            hint: hint.into(),
        }
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        1
    }

    /// True when nothing on the host was changed before the error surfaced
    pub fn is_side_effect_free(&self) -> bool {
        matches!(
            self,
            Self::Precondition { .. } | Self::Validation(_) | Self::Aborted(_)
        )
    }
}

impl From<anyhow::Error> for DeployError {
    fn from(err: anyhow::Error) -> Self {
        DeployError::Config(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DeployError::validation("concurrency must be between 1 and 20");
        assert_eq!(
            err.to_string(),
            "Validation error: concurrency must be between 1 and 20"
        );

        let err = DeployError::config("missing N8N_ENCRYPTION_KEY");
        assert_eq!(err.to_string(), "Configuration error: missing N8N_ENCRYPTION_KEY");
    }

    #[test]
    fn test_precondition_carries_remediation() {
        let err = DeployError::precondition("port 5678 in use", "stop the process bound to 5678");
        let msg = err.to_string();
        assert!(msg.contains("port 5678 in use"));
        assert!(msg.contains("stop the process"));
        assert!(err.is_side_effect_free());
    }

    #[test]
    fn test_certificate_error_lists_resolved_addresses() {
        let err = DeployError::CertificateIssuance {
            domain: "n8n.example.com".to_string(),
            attempts: 3,
            resolved: vec!["203.0.113.7".parse().unwrap()],
            last_error: "unauthorized".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("203.0.113.7"));
        assert!(msg.contains("3 attempt(s)"));
        assert!(msg.contains("certbot certonly"));
    }

    #[test]
    fn test_certificate_error_without_records() {
        let err = DeployError::CertificateIssuance {
            domain: "n8n.example.com".to_string(),
            attempts: 1,
            resolved: vec![],
            last_error: "dns".to_string(),
        };
        assert!(err.to_string().contains("no DNS records"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: DeployError = io_err.into();
        assert!(matches!(err, DeployError::Io(_)));
        assert!(!err.is_side_effect_free());
    }

    #[test]
    fn test_exit_code_is_nonzero() {
        assert_eq!(DeployError::aborted("declined").exit_code(), 1);
        assert_eq!(DeployError::state("x").exit_code(), 1);
    }
}
