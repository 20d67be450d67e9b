//! Certificate acquisition.
//!
//! ```text
//! (none) ──serve_challenge──▶ Challenge ──obtain──▶ certificate on disk
//!                                 │                        │
//!                                 │ (retries exhausted)    └──activate_production──▶ Production
//!                                 ▼
//!                           stays Challenge
//! ```
//!
//! The production site is only written once the certificate file exists.
//! When the production configuration fails `nginx -t`, the challenge site is
//! put back so the proxy never serves a half-written configuration.

use crate::commands::system::{CurlArgs, SystemctlAction, SystemctlArgs};
use crate::commands::tls::{CertbotAction, CertbotArgs, NginxTestArgs, OpensslDhparamArgs};
use crate::error::{DeployError, Result};
use crate::host::{self, Host};
use crate::paths::InstallPaths;
use crate::proxy::{self, NginxConfig, ProxySite, ProxyState};
use crate::retry::{Attempt, RetryPolicy, retry};
use std::fs;
use std::io::ErrorKind;
use std::net::IpAddr;

/// Recommended TLS parameters published by the certbot project
pub const SSL_OPTIONS_URL: &str = "https://raw.githubusercontent.com/certbot/certbot/master/certbot-nginx/certbot_nginx/_internal/tls_configs/options-ssl-nginx.conf";
pub const DHPARAM_BITS: u32 = 2048;

/// What to ask the certificate authority for
#[derive(Debug, Clone)]
pub struct CertificateRequest {
    pub domain: String,
    pub email: String,
    pub staging: bool,
    pub retry: RetryPolicy,
    /// Reported when issuance fails
    pub resolved: Vec<IpAddr>,
    pub upstream_port: u16,
    pub payload_max_mib: u32,
}

/// Installed site state, read from the marker in the site file
pub fn current_state(paths: &InstallPaths) -> Option<ProxyState> {
    fs::read_to_string(paths.nginx_site())
        .ok()
        .and_then(|content| ProxyState::detect(&content))
}

pub struct CertificateAcquirer<'a> {
    host: &'a dyn Host,
    paths: &'a InstallPaths,
}

impl<'a> CertificateAcquirer<'a> {
    pub fn new(host: &'a dyn Host, paths: &'a InstallPaths) -> Self {
        Self { host, paths }
    }

    /// Challenge, issuance, production
    pub fn run(&self, request: &CertificateRequest) -> Result<()> {
        self.serve_challenge(&request.domain)?;
        self.obtain(request)?;
        self.ensure_tls_parameters()?;
        self.activate_production(&self.site(request))
    }

    /// Install the port 80 challenge responder and make it the only site
    pub fn serve_challenge(&self, domain: &str) -> Result<()> {
        host::create_dir(self.host, &self.paths.acme_webroot())?;
        let webroot = self.paths.host_view(&self.paths.acme_webroot());
        self.install_site(&proxy::challenge_config(domain, &webroot))?;
        self.enable_site()?;
        self.reload()?;
        log::info!("Serving ACME challenges for {}", domain);
        Ok(())
    }

    /// Request the certificate unless one is already on disk
    pub fn obtain(&self, request: &CertificateRequest) -> Result<()> {
        let fullchain = self.paths.fullchain(&request.domain);
        if fullchain.exists() {
            log::info!(
                "Certificate for {} already present, skipping issuance",
                request.domain
            );
            return Ok(());
        }

        let certbot = CertbotArgs {
            action: CertbotAction::CertOnly {
                domain: request.domain.clone(),
                email: request.email.clone(),
                webroot: self.paths.host_view(&self.paths.acme_webroot()),
                staging: request.staging,
            },
        };

        retry(
            self.host,
            &request.retry,
            "certificate issuance",
            |_| {
                let out = self.host.run(&certbot)?;
                if out.success {
                    Ok(Attempt::Done(()))
                } else {
                    Ok(Attempt::Retry(last_line(&out.stderr)))
                }
            },
            |exhausted| DeployError::CertificateIssuance {
                domain: request.domain.clone(),
                attempts: exhausted.attempts,
                resolved: request.resolved.clone(),
                last_error: exhausted.last_reason,
            },
        )?;

        if !self.host.dry_run() && !fullchain.exists() {
            return Err(DeployError::CertificateIssuance {
                domain: request.domain.clone(),
                attempts: 1,
                resolved: request.resolved.clone(),
                last_error: format!(
                    "certbot reported success but {} is missing",
                    fullchain.display()
                ),
            });
        }
        log::info!("Certificate issued for {}", request.domain);
        Ok(())
    }

    /// Download recommended TLS options and generate DH parameters, once
    pub fn ensure_tls_parameters(&self) -> Result<()> {
        let options = self.paths.ssl_options();
        if !options.exists() {
            host::create_dir(self.host, &self.paths.letsencrypt_dir())?;
            self.host
                .run_checked(&CurlArgs::download(SSL_OPTIONS_URL, self.paths.host_view(&options)))?;
        }
        let dhparam = self.paths.dhparam();
        if !dhparam.exists() {
            log::info!("Generating {}-bit DH parameters, this takes a while", DHPARAM_BITS);
            self.host.run_checked(&OpensslDhparamArgs {
                out: self.paths.host_view(&dhparam),
                bits: DHPARAM_BITS,
            })?;
        }
        Ok(())
    }

    /// Replace the challenge responder with the TLS site
    pub fn activate_production(&self, site: &ProxySite) -> Result<()> {
        let fullchain = self.paths.fullchain(&site.domain);
        if !self.host.dry_run() && !fullchain.exists() {
            return Err(DeployError::state(format!(
                "refusing to enable TLS without {}",
                fullchain.display()
            )));
        }

        self.install_site(&proxy::production_config(site))?;
        if let Err(e) = self.test_config() {
            log::warn!("Production proxy configuration rejected, restoring challenge site");
            let webroot = self.paths.host_view(&self.paths.acme_webroot());
            self.install_site(&proxy::challenge_config(&site.domain, &webroot))?;
            return Err(e);
        }
        self.host
            .run_checked(&SystemctlArgs::new(SystemctlAction::Reload, "nginx"))?;
        log::info!("Reverse proxy serving https://{}", site.domain);
        Ok(())
    }

    /// Production site inputs with paths as seen on the host
    pub fn site(&self, request: &CertificateRequest) -> ProxySite {
        let view = |p: std::path::PathBuf| self.paths.host_view(&p);
        ProxySite {
            domain: request.domain.clone(),
            upstream_port: request.upstream_port,
            payload_max_mib: request.payload_max_mib,
            webroot: view(self.paths.acme_webroot()),
            fullchain: view(self.paths.fullchain(&request.domain)),
            privkey: view(self.paths.privkey(&request.domain)),
            ssl_options: view(self.paths.ssl_options()),
            dhparam: view(self.paths.dhparam()),
        }
    }

    fn install_site(&self, config: &NginxConfig) -> Result<()> {
        host::write_file(
            self.host,
            &self.paths.nginx_site(),
            config.render().as_bytes(),
            0o644,
        )
    }

    /// Link our site into sites-enabled and drop the distribution default
    fn enable_site(&self) -> Result<()> {
        if self.host.dry_run() {
            log::info!("[dry-run] would enable nginx site {}", self.paths.nginx_site().display());
            return Ok(());
        }
        let link = self.paths.nginx_site_link();
        if fs::symlink_metadata(&link).is_err() {
            if let Some(parent) = link.parent() {
                fs::create_dir_all(parent)?;
            }
            std::os::unix::fs::symlink(self.paths.nginx_site(), &link)?;
        }
        match fs::remove_file(self.paths.nginx_default_site_link()) {
            Ok(()) => log::info!("Disabled the default nginx site"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn test_config(&self) -> Result<()> {
        if self.host.dry_run() {
            return Ok(());
        }
        self.host.run_checked(&NginxTestArgs)?;
        Ok(())
    }

    fn reload(&self) -> Result<()> {
        self.test_config()?;
        self.host
            .run_checked(&SystemctlArgs::new(SystemctlAction::Reload, "nginx"))?;
        Ok(())
    }
}

fn last_line(stderr: &str) -> String {
    stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("certbot failed")
        .trim()
        .to_string()
}
