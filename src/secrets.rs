//! Install-time credential generation.
//!
//! Secrets are drawn from the operating system's CSPRNG and restricted to
//! ASCII alphanumerics so they survive unquoted in `.env`, connection URLs,
//! shell scripts, and YAML without escaping.
//!
//! Generation happens exactly once per installation. The installer refuses to
//! run against an existing installation directory, so an encryption key that
//! already protects stored n8n credentials is never replaced.

use rand::rngs::OsRng;
use rand::{Rng, distributions::Alphanumeric};
use std::fmt;

pub const DB_PASSWORD_LEN: usize = 32;
pub const ENCRYPTION_KEY_LEN: usize = 40;
pub const REDIS_PASSWORD_LEN: usize = 32;

/// The four secrets of one installation
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialSet {
    /// PostgreSQL superuser (`POSTGRES_PASSWORD`)
    pub postgres_password: String,
    /// Least-privilege application role used by n8n
    pub app_db_password: String,
    /// `N8N_ENCRYPTION_KEY`, protects credentials stored by n8n
    pub encryption_key: String,
    /// Redis `requirepass`
    pub redis_password: String,
}

impl CredentialSet {
    /// Draw four independent secrets
    pub fn generate() -> Self {
        let creds = Self {
            postgres_password: random_token(DB_PASSWORD_LEN),
            app_db_password: random_token(DB_PASSWORD_LEN),
            encryption_key: random_token(ENCRYPTION_KEY_LEN),
            redis_password: random_token(REDIS_PASSWORD_LEN),
        };
        log::info!("Generated installation credentials");
        creds
    }
}

impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSet")
            .field("postgres_password", &"<redacted>")
            .field("app_db_password", &"<redacted>")
            .field("encryption_key", &"<redacted>")
            .field("redis_password", &"<redacted>")
            .finish()
    }
}

/// Alphanumeric token of `len` characters from `OsRng`
pub fn random_token(len: usize) -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lengths_and_charset() {
        let creds = CredentialSet::generate();
        assert_eq!(creds.postgres_password.len(), DB_PASSWORD_LEN);
        assert_eq!(creds.app_db_password.len(), DB_PASSWORD_LEN);
        assert_eq!(creds.encryption_key.len(), ENCRYPTION_KEY_LEN);
        assert_eq!(creds.redis_password.len(), REDIS_PASSWORD_LEN);
        for secret in [
            &creds.postgres_password,
            &creds.app_db_password,
            &creds.encryption_key,
            &creds.redis_password,
        ] {
            assert!(secret.chars().all(|c| c.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn test_secrets_are_independent() {
        let creds = CredentialSet::generate();
        assert_ne!(creds.postgres_password, creds.app_db_password);
        assert_ne!(creds.postgres_password, creds.redis_password);
        assert_ne!(creds, CredentialSet::generate());
    }

    #[test]
    fn test_debug_redacts() {
        let creds = CredentialSet::generate();
        let debug = format!("{:?}", creds);
        assert!(!debug.contains(&creds.encryption_key));
        assert!(debug.contains("<redacted>"));
    }
}
