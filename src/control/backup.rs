//! Backups.
//!
//! One backup is a pair of files sharing a timestamp:
//!
//! - `n8n_db_<ts>.sql.gz`: gzip'd `pg_dump` of the n8n database
//! - `n8n_files_<ts>.tar.gz`: `.env`, manifest, bootstrap script, settings
//!   and the `n8n_data` directory
//!
//! Retention is by age: pairs older than `backup_retention_days` are removed
//! after each successful backup. The age comes from the timestamp in the file
//! name, not the file's mtime.

use super::Runtime;
use crate::commands::CommandArgs;
use crate::commands::compose::ComposeArgs;
use crate::env_file::EnvSnapshot;
use crate::error::{DeployError, Result};
use crate::host::{self, Host};
use crate::paths::{DATA_DIR, DB_INIT_FILE, ENV_FILE, InstallPaths, MANIFEST_FILE, SETTINGS_FILE};
use crate::types::ServiceRole;
use anyhow::Context;
use chrono::{Local, NaiveDateTime, TimeDelta};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const DB_PREFIX: &str = "n8n_db_";
const DB_SUFFIX: &str = ".sql.gz";
const FILES_PREFIX: &str = "n8n_files_";
const FILES_SUFFIX: &str = ".tar.gz";

/// Top-level files of the installation directory that are archived
pub const ARCHIVED_FILES: &[&str] = &[ENV_FILE, MANIFEST_FILE, DB_INIT_FILE, SETTINGS_FILE];

/// The two halves of one backup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArtifact {
    pub timestamp: String,
    pub database: PathBuf,
    pub files: PathBuf,
}

impl BackupArtifact {
    /// Expected paths for `timestamp` in `dir`
    pub fn locate(dir: &Path, timestamp: &str) -> Self {
        Self {
            timestamp: timestamp.to_string(),
            database: dir.join(format!("{}{}{}", DB_PREFIX, timestamp, DB_SUFFIX)),
            files: dir.join(format!("{}{}{}", FILES_PREFIX, timestamp, FILES_SUFFIX)),
        }
    }

    /// Halves that do not exist on disk
    pub fn missing(&self) -> Vec<&Path> {
        [self.database.as_path(), self.files.as_path()]
            .into_iter()
            .filter(|p| !p.is_file())
            .collect()
    }
}

/// Parse a backup timestamp such as `20250101_020000`
pub fn parse_timestamp(timestamp: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).map_err(|_| {
        DeployError::validation(format!(
            "'{}' is not a backup timestamp (expected YYYYMMDD_HHMMSS)",
            timestamp
        ))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Half {
    Database,
    Files,
}

/// Timestamp and half encoded in a backup file name
fn classify(name: &str) -> Option<(Half, &str)> {
    if let Some(ts) = name
        .strip_prefix(DB_PREFIX)
        .and_then(|r| r.strip_suffix(DB_SUFFIX))
    {
        return Some((Half::Database, ts));
    }
    name.strip_prefix(FILES_PREFIX)
        .and_then(|r| r.strip_suffix(FILES_SUFFIX))
        .map(|ts| (Half::Files, ts))
}

/// Back up now
pub fn create(rt: &Runtime) -> Result<BackupArtifact> {
    let timestamp = Local::now().format(TIMESTAMP_FORMAT).to_string();
    create_at(rt, &timestamp)
}

/// Back up under an explicit timestamp, then prune old pairs
pub fn create_at(rt: &Runtime, timestamp: &str) -> Result<BackupArtifact> {
    let now = parse_timestamp(timestamp)?;
    let env = rt.load_env()?;
    let backup_dir = rt.paths.backup_dir();
    host::create_dir(rt.host, backup_dir)?;
    let artifact = BackupArtifact::locate(backup_dir, timestamp);

    dump_database(rt, &env, &artifact.database)?;
    log::info!("Database dumped to {}", artifact.database.display());

    if rt.host.dry_run() {
        log::info!("[dry-run] would archive files to {}", artifact.files.display());
    } else {
        archive_files(&rt.paths, &artifact.files)?;
        log::info!("Files archived to {}", artifact.files.display());
    }

    let removed = prune(rt.host, backup_dir, rt.settings.backup_retention_days, now)?;
    if !removed.is_empty() {
        log::info!("Removed {} expired backup file(s)", removed.len());
    }
    Ok(artifact)
}

fn dump_database(rt: &Runtime, env: &EnvSnapshot, dest: &Path) -> Result<()> {
    let config = env.config();
    let cmd = ComposeArgs::exec(
        rt.project_dir(),
        ServiceRole::Database.service_name(),
        &[
            "pg_dump",
            "-U",
            config.postgres_user.as_str(),
            "-d",
            config.postgres_db.as_str(),
            "--clean",
            "--if-exists",
        ],
    );
    if rt.host.dry_run() {
        log::info!("[dry-run] would dump the database to {}", dest.display());
        return Ok(());
    }

    let tmp = dest.with_extension("partial");
    let result = stream_dump(rt.host, &cmd, &tmp).and_then(|()| fs::rename(&tmp, dest).map_err(DeployError::from));
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Pipe `pg_dump` stdout through gzip into `path` (0600)
fn stream_dump(host: &dyn Host, cmd: &ComposeArgs, path: &Path) -> Result<()> {
    let file = File::create(path)?;
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    let (out, bytes) = host.run_to_writer(cmd, &mut encoder)?;
    out.ensure_success(&cmd.display())?;
    if bytes == 0 {
        return Err(DeployError::state("pg_dump produced no output"));
    }
    encoder.finish()?.sync_all()?;
    Ok(())
}

/// Archive the configuration files and `n8n_data` into `dest` (0600)
pub fn archive_files(paths: &InstallPaths, dest: &Path) -> Result<()> {
    build_archive(paths, dest)
        .with_context(|| format!("Failed to archive files to {}", dest.display()))
        .map_err(DeployError::from)
}

fn build_archive(paths: &InstallPaths, dest: &Path) -> anyhow::Result<()> {
    let tmp = dest.with_extension("partial");
    let file = File::create(&tmp)?;
    file.set_permissions(fs::Permissions::from_mode(0o600))?;

    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder.follow_symlinks(false);
    for name in ARCHIVED_FILES {
        let path = paths.install_dir().join(name);
        if path.is_file() {
            builder.append_path_with_name(&path, name)?;
        }
    }
    let data = paths.data_dir();
    if data.is_dir() {
        builder.append_dir_all(DATA_DIR, &data)?;
    }
    let encoder = builder.into_inner()?;
    encoder.finish()?.sync_all()?;
    fs::rename(&tmp, dest)?;
    Ok(())
}

/// Unpack a files archive into `install_dir`, replacing `n8n_data`
pub fn extract_files(archive: &Path, install_dir: &Path) -> Result<()> {
    unpack(archive, install_dir)
        .with_context(|| format!("Failed to extract {}", archive.display()))
        .map_err(DeployError::from)
}

fn unpack(archive: &Path, install_dir: &Path) -> anyhow::Result<()> {
    let data = install_dir.join(DATA_DIR);
    if data.exists() {
        fs::remove_dir_all(&data)?;
    }
    let mut tar = tar::Archive::new(GzDecoder::new(File::open(archive)?));
    tar.set_preserve_permissions(true);
    tar.set_overwrite(true);
    tar.unpack(install_dir)?;
    Ok(())
}

/// Decompressed contents of a database dump
pub fn read_dump(path: &Path) -> Result<Vec<u8>> {
    let mut sql = Vec::new();
    GzDecoder::new(File::open(path)?).read_to_end(&mut sql)?;
    Ok(sql)
}

/// Delete backup files whose timestamp is older than `retention_days` before `now`
pub fn prune(
    host: &dyn Host,
    dir: &Path,
    retention_days: u32,
    now: NaiveDateTime,
) -> Result<Vec<PathBuf>> {
    let cutoff = now - TimeDelta::days(i64::from(retention_days));
    let mut removed = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(removed),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some((_, ts)) = classify(&name) else {
            continue;
        };
        let Ok(taken) = NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT) else {
            continue;
        };
        if taken < cutoff {
            if host.dry_run() {
                log::info!("[dry-run] would remove {}", name);
            } else {
                fs::remove_file(entry.path())?;
                log::debug!("Removed expired backup {}", name);
            }
            removed.push(entry.path());
        }
    }
    Ok(removed)
}

/// One timestamp found in the backup directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSet {
    pub timestamp: String,
    pub database: Option<PathBuf>,
    pub files: Option<PathBuf>,
}

impl BackupSet {
    pub fn is_complete(&self) -> bool {
        self.database.is_some() && self.files.is_some()
    }
}

/// Backups in `dir`, oldest first
pub fn list(dir: &Path) -> Result<Vec<BackupSet>> {
    let mut sets: BTreeMap<String, BackupSet> = BTreeMap::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some((half, ts)) = classify(&name) else {
            continue;
        };
        let set = sets.entry(ts.to_string()).or_insert_with(|| BackupSet {
            timestamp: ts.to_string(),
            database: None,
            files: None,
        });
        match half {
            Half::Database => set.database = Some(entry.path()),
            Half::Files => set.files = Some(entry.path()),
        }
    }
    Ok(sets.into_values().collect())
}
