//! Command-line dispatch against the fake host.

mod common;

use clap::Parser;
use common::{FakeHost, StubInspector, running_install, sandbox, settings};
use n8n_provision::cli::{self, Cli, Session};
use n8n_provision::control::backup;
use n8n_provision::{DeployError, InstallPaths, ScriptedOperator};
use std::fs;
use std::path::PathBuf;

fn run(host: &FakeHost, base: &InstallPaths, args: &[&str]) -> n8n_provision::Result<()> {
    let cli = Cli::try_parse_from(std::iter::once("n8n-provision").chain(args.iter().copied()))
        .unwrap();
    let operator = ScriptedOperator::default();
    let inspector = StubInspector::healthy();
    let session = Session {
        host,
        operator: &operator,
        inspector: &inspector,
        base: base.clone(),
        helper_source: PathBuf::from("/nonexistent"),
    };
    cli::run(&cli, &session)
}

#[test]
fn test_validate_settings_file() {
    let (dir, paths) = sandbox();
    let host = FakeHost::new(&paths);

    let good = dir.path().join("good.json");
    fs::write(&good, r#"{"domain": "n8n.example.com", "worker_replicas": 2}"#).unwrap();
    run(&host, &paths, &["validate", good.to_str().unwrap()]).unwrap();

    let bad = dir.path().join("bad.json");
    fs::write(&bad, r#"{"worker_concurrency": 50}"#).unwrap();
    let err = run(&host, &paths, &["validate", bad.to_str().unwrap()]).unwrap_err();
    assert!(matches!(err, DeployError::Validation(_)), "{err}");
    assert_eq!(err.exit_code(), 1);

    let unknown = dir.path().join("unknown.json");
    fs::write(&unknown, r#"{"domian": "typo.example.com"}"#).unwrap();
    assert!(run(&host, &paths, &["validate", unknown.to_str().unwrap()]).is_err());
    assert!(host.commands().is_empty());
}

#[test]
fn test_runtime_commands_find_installation_settings() {
    let (_dir, paths) = sandbox();
    let host = FakeHost::new(&paths);
    running_install(&host, &paths, &settings());

    run(&host, &paths, &["workers", "add"]).unwrap();
    assert_eq!(host.replicas("n8n-worker"), 2);

    run(&host, &paths, &["workers", "concurrency", "7"]).unwrap();
    assert_eq!(
        common::env_value(&paths, "N8N_WORKER_CONCURRENCY").as_deref(),
        Some("7")
    );
}

#[test]
fn test_explicit_settings_file_wins() {
    let (dir, paths) = sandbox();
    let host = FakeHost::new(&paths);
    let mut custom = settings();
    custom.install_dir = PathBuf::from("/srv/n8n");
    let custom_paths = cli::paths_for(&paths, &custom);
    let host_for_custom = FakeHost::new(&custom_paths);
    running_install(&host_for_custom, &custom_paths, &custom);

    let file = dir.path().join("custom.json");
    custom.save_to_file(&file).unwrap();

    run(&host_for_custom, &paths, &["--settings", file.to_str().unwrap(), "backup"]).unwrap();
    let sets = backup::list(&dir.path().join("srv/n8n/backups")).unwrap();
    assert_eq!(sets.len(), 1);
    assert!(sets[0].is_complete());
    assert!(host.commands().is_empty());
}

#[test]
fn test_missing_settings_file_fails() {
    let (dir, paths) = sandbox();
    let host = FakeHost::new(&paths);
    let missing = dir.path().join("missing.json");
    let err = run(&host, &paths, &["--settings", missing.to_str().unwrap(), "backups"]).unwrap_err();
    assert_eq!(err.exit_code(), 1);
}

#[test]
fn test_schedule_keeps_foreign_entries() {
    let (_dir, paths) = sandbox();
    let host = FakeHost::new(&paths);
    host.set_crontab("MAILTO=ops@example.com\n15 * * * * /usr/bin/other-job\n");

    run(&host, &paths, &["schedule"]).unwrap();
    run(&host, &paths, &["schedule"]).unwrap();

    let table = host.crontab().unwrap();
    assert!(table.starts_with("MAILTO=ops@example.com\n15 * * * * /usr/bin/other-job\n"));
    assert_eq!(table.matches("# n8n-provision:").count(), 3);
}

#[test]
fn test_restore_unknown_backup_is_validation_error() {
    let (_dir, paths) = sandbox();
    let host = FakeHost::new(&paths);
    running_install(&host, &paths, &settings());

    let err = run(&host, &paths, &["restore", "20240101_000000", "--yes"]).unwrap_err();
    assert!(matches!(err, DeployError::Validation(_)));
    assert!(err.is_side_effect_free());
    assert!(host.commands().is_empty());
}

#[test]
fn test_maintenance_reports_but_never_fails() {
    let (_dir, paths) = sandbox();
    let host = FakeHost::new(&paths);
    host.fail_on("image prune");

    run(&host, &paths, &["maintenance"]).unwrap();
    assert_eq!(host.commands().len(), 5);
}

#[test]
fn test_version_reads_running_container() {
    let (_dir, paths) = sandbox();
    let host = FakeHost::new(&paths);
    running_install(&host, &paths, &settings());
    run(&host, &paths, &["version"]).unwrap();

    host.fail_on("--version");
    let err = run(&host, &paths, &["version"]).unwrap_err();
    assert!(matches!(err, DeployError::State(_)));
}
