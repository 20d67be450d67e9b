//! Scheduler registrar: root crontab entries for recurring jobs.
//!
//! Every entry carries a trailing `# n8n-provision:<job>` marker. Registering
//! drops every line that contains the marker prefix and appends the current
//! set, so repeated registration never duplicates and foreign entries survive.

use crate::commands::system::{CrontabAction, CrontabArgs};
use crate::error::Result;
use crate::host::Host;
use crate::paths::InstallPaths;

pub const MARKER_PREFIX: &str = "n8n-provision:";

/// One recurring job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledJob {
    pub marker: &'static str,
    /// Five-field cron expression
    pub schedule: &'static str,
    pub subcommand: &'static str,
    pub log_file: &'static str,
}

pub const JOBS: &[ScheduledJob] = &[
    ScheduledJob {
        marker: "backup",
        schedule: "0 2 * * *",
        subcommand: "backup",
        log_file: "n8n-backup.log",
    },
    ScheduledJob {
        marker: "maintenance",
        schedule: "0 3 * * 0",
        subcommand: "maintenance",
        log_file: "n8n-maintenance.log",
    },
    ScheduledJob {
        marker: "renew-certs",
        schedule: "30 4 * * *",
        subcommand: "renew-certs",
        log_file: "n8n-certbot-renew.log",
    },
];

impl ScheduledJob {
    /// Crontab line for this job on the host described by `paths`
    pub fn line(&self, paths: &InstallPaths) -> String {
        let helper = paths.host_view(&paths.helper_binary());
        let settings = paths.host_view(&paths.settings_file());
        let log = paths.host_view(&paths.log_dir().join(self.log_file));
        format!(
            "{} {} --settings {} {} >> {} 2>&1 # {}{}",
            self.schedule,
            helper.display(),
            settings.display(),
            self.subcommand,
            log.display(),
            MARKER_PREFIX,
            self.marker
        )
    }
}

/// Replace every owned line of `existing` with `lines`
pub fn merge(existing: &str, lines: &[String]) -> String {
    let mut table: Vec<&str> = existing
        .lines()
        .filter(|l| !l.contains(MARKER_PREFIX))
        .collect();
    while table.last().is_some_and(|l| l.trim().is_empty()) {
        table.pop();
    }
    let mut out = String::new();
    for line in table {
        out.push_str(line);
        out.push('\n');
    }
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Current root crontab; a missing table reads as empty
pub fn current_table(host: &dyn Host) -> Result<String> {
    let out = host.run(&CrontabArgs {
        action: CrontabAction::List,
    })?;
    if out.success {
        Ok(out.stdout)
    } else if out.stderr.contains("no crontab") {
        Ok(String::new())
    } else {
        out.ensure_success("crontab -l")?;
        Ok(String::new())
    }
}

/// Install the recurring jobs. Returns the lines now owned by us.
pub fn register(host: &dyn Host, paths: &InstallPaths) -> Result<Vec<String>> {
    let lines: Vec<String> = JOBS.iter().map(|job| job.line(paths)).collect();
    let table = merge(&current_table(host)?, &lines);
    host.run_checked(&CrontabArgs {
        action: CrontabAction::Install(table),
    })?;
    for job in JOBS {
        log::info!("Scheduled {} ({})", job.marker, job.schedule);
    }
    Ok(lines)
}
