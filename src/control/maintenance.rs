//! Scheduled housekeeping: weekly cleanup and certificate renewal.

use crate::commands::CommandArgs;
use crate::commands::system::{AptAction, AptArgs, DockerArgs, JournalctlArgs};
use crate::commands::tls::{CertbotAction, CertbotArgs};
use crate::error::Result;
use crate::host::Host;

/// Images and build cache younger than this are kept
pub const PRUNE_AGE: &str = "168h";
pub const JOURNAL_RETENTION: &str = "14d";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub succeeded: Vec<String>,
    /// (step, reason)
    pub failed: Vec<(String, String)>,
}

fn steps() -> Vec<(&'static str, Box<dyn CommandArgs>)> {
    vec![
        (
            "prune unused images",
            Box::new(DockerArgs::ImagePrune {
                all: true,
                until: Some(PRUNE_AGE.to_string()),
            }),
        ),
        (
            "prune build cache",
            Box::new(DockerArgs::BuilderPrune {
                until: Some(PRUNE_AGE.to_string()),
            }),
        ),
        (
            "remove unused packages",
            Box::new(AptArgs {
                action: AptAction::Autoremove,
            }),
        ),
        (
            "clean package cache",
            Box::new(AptArgs {
                action: AptAction::Clean,
            }),
        ),
        (
            "vacuum journal",
            Box::new(JournalctlArgs {
                vacuum_time: JOURNAL_RETENTION.to_string(),
            }),
        ),
    ]
}

/// Run every cleanup step. A failing step is recorded and the rest still run.
pub fn run(host: &dyn Host) -> MaintenanceReport {
    let mut report = MaintenanceReport::default();
    for (name, cmd) in steps() {
        match host.run_checked(&*cmd) {
            Ok(_) => {
                log::info!("{}: done", name);
                report.succeeded.push(name.to_string());
            }
            Err(e) => {
                log::warn!("{}: {}", name, e);
                report.failed.push((name.to_string(), e.to_string()));
            }
        }
    }
    report
}

/// Renew due certificates; nginx reloads after a renewal
pub fn renew_certificates(host: &dyn Host) -> Result<()> {
    host.run_checked(&CertbotArgs {
        action: CertbotAction::Renew,
    })?;
    log::info!("Certificate renewal check finished");
    Ok(())
}
