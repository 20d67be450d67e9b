//! Type-safe arguments for TLS tooling: certbot, nginx, openssl.

use super::{CommandArgs, argv};
use std::path::PathBuf;

/// certbot usage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertbotAction {
    /// `certonly --webroot` for one domain (HTTP-01 challenge)
    CertOnly {
        domain: String,
        email: String,
        webroot: PathBuf,
        staging: bool,
    },
    /// `renew` every certificate due, reloading nginx after a successful renewal
    Renew,
}

/// Type-safe arguments for `certbot`.
#[derive(Debug, Clone)]
pub struct CertbotArgs {
    pub action: CertbotAction,
}

impl CommandArgs for CertbotArgs {
    fn program(&self) -> &'static str {
        "certbot"
    }

    fn to_cli_args(&self) -> Vec<String> {
        match &self.action {
            CertbotAction::CertOnly {
                domain,
                email,
                webroot,
                staging,
            } => {
                let mut args = vec![
                    "certonly".to_string(),
                    "--webroot".to_string(),
                    "-w".to_string(),
                    webroot.display().to_string(),
                    "-d".to_string(),
                    domain.clone(),
                    "--email".to_string(),
                    email.clone(),
                    "--agree-tos".to_string(),
                    "--no-eff-email".to_string(),
                    "--non-interactive".to_string(),
                    "--keep-until-expiring".to_string(),
                ];
                if *staging {
                    args.push("--staging".to_string());
                }
                args
            }
            CertbotAction::Renew => argv([
                "renew",
                "--quiet",
                "--deploy-hook",
                "systemctl reload nginx",
            ]),
        }
    }

    fn is_destructive(&self) -> bool {
        true
    }
}

/// `nginx -t`: validate the configuration before a reload.
#[derive(Debug, Clone, Default)]
pub struct NginxTestArgs;

impl CommandArgs for NginxTestArgs {
    fn program(&self) -> &'static str {
        "nginx"
    }

    fn to_cli_args(&self) -> Vec<String> {
        argv(["-t", "-q"])
    }

    fn is_destructive(&self) -> bool {
        false
    }
}

/// `openssl dhparam`: one-time Diffie-Hellman parameter generation.
#[derive(Debug, Clone)]
pub struct OpensslDhparamArgs {
    pub out: PathBuf,
    pub bits: u32,
}

impl CommandArgs for OpensslDhparamArgs {
    fn program(&self) -> &'static str {
        "openssl"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "dhparam".to_string(),
            "-out".to_string(),
            self.out.display().to_string(),
            self.bits.to_string(),
        ]
    }

    fn is_destructive(&self) -> bool {
        true
    }
}
