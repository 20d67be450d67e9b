//! Property-based tests
//!
//! These tests verify:
//! - generated secrets stay inside the safe alphabet
//! - `.env` rendering parses back to the same configuration
//! - concurrency bounds
//! - crontab merging is idempotent and keeps foreign entries
//! - worker scaling lands on the requested count without touching other services

mod common;

use n8n_provision::config_file::{MAX_CONCURRENCY, MIN_CONCURRENCY, validate_concurrency};
use n8n_provision::control::{Runtime, workers};
use n8n_provision::env_file::InstallationTarget;
use n8n_provision::scheduler::{self, JOBS};
use n8n_provision::secrets::{CredentialSet, random_token};
use n8n_provision::{
    EnvironmentConfig, ExecutionMode, InstallPaths, InstallerSettings, ScriptedOperator,
};
use proptest::prelude::*;

// =============================================================================
// Secrets
// =============================================================================

proptest! {
    /// Tokens have the requested length and only ASCII alphanumerics
    #[test]
    fn token_charset(len in 1usize..128) {
        let token = random_token(len);
        prop_assert_eq!(token.len(), len);
        prop_assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}

// =============================================================================
// Environment file
// =============================================================================

fn settings_strategy() -> impl Strategy<Value = InstallerSettings> {
    (
        1024u16..65535,
        MIN_CONCURRENCY..=MAX_CONCURRENCY,
        1u32..32,
        prop_oneof![Just(ExecutionMode::Queue), Just(ExecutionMode::Regular)],
        prop_oneof![
            Just("latest".to_string()),
            (0u32..3, 0u32..200, 0u32..20).prop_map(|(a, b, c)| format!("{}.{}.{}", a, b, c)),
        ],
    )
        .prop_map(|(port, concurrency, replicas, mode, version)| {
            InstallerSettings {
                n8n_port: port,
                worker_concurrency: concurrency,
                worker_replicas: replicas,
                execution_mode: mode,
                n8n_version: version,
                ..InstallerSettings::default()
            }
            .normalized()
        })
}

proptest! {
    /// render → parse yields the same configuration
    #[test]
    fn env_render_parses_back(settings in settings_strategy(), domain in "[a-z]{1,12}\\.example\\.com") {
        let target = InstallationTarget {
            domain,
            email: "ops@example.com".to_string(),
            host_ip: None,
        };
        let config = EnvironmentConfig::new(&target, &CredentialSet::generate(), &settings);
        let parsed = EnvironmentConfig::parse(&config.render()).unwrap();
        prop_assert_eq!(parsed, config);
    }

    /// Regular mode never declares workers
    #[test]
    fn regular_mode_has_no_workers(settings in settings_strategy()) {
        if settings.execution_mode == ExecutionMode::Regular {
            prop_assert_eq!(settings.worker_replicas, 0);
        }
    }
}

// =============================================================================
// Concurrency
// =============================================================================

proptest! {
    #[test]
    fn concurrency_bounds(value in 0u32..1000) {
        let accepted = validate_concurrency(value).is_ok();
        prop_assert_eq!(accepted, (MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&value));
    }
}

// =============================================================================
// Crontab merge
// =============================================================================

fn foreign_line() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9*/][a-zA-Z0-9 */=.-]{0,40}"
}

proptest! {
    /// Merging twice equals merging once, and foreign lines survive in order
    #[test]
    fn crontab_merge_idempotent(foreign in prop::collection::vec(foreign_line(), 0..8)) {
        let paths = InstallPaths::system();
        let lines: Vec<String> = JOBS.iter().map(|job| job.line(&paths)).collect();
        let existing = foreign.iter().map(|l| format!("{}\n", l)).collect::<String>();

        let once = scheduler::merge(&existing, &lines);
        let twice = scheduler::merge(&once, &lines);
        prop_assert_eq!(&once, &twice);

        let kept: Vec<&str> = once
            .lines()
            .filter(|l| !l.contains(scheduler::MARKER_PREFIX))
            .collect();
        let expected: Vec<&str> = {
            let mut v: Vec<&str> = foreign.iter().map(String::as_str).collect();
            while v.last().is_some_and(|l| l.trim().is_empty()) {
                v.pop();
            }
            v
        };
        prop_assert_eq!(kept, expected);
        prop_assert_eq!(
            once.lines().filter(|l| l.contains(scheduler::MARKER_PREFIX)).count(),
            JOBS.len()
        );
    }
}

// =============================================================================
// Worker scaling
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Any sequence of scale targets ends at the last target; main, database
    /// and queue containers are never replaced
    #[test]
    fn scaling_converges(targets in prop::collection::vec(1u32..8, 1..5)) {
        let (_dir, paths) = common::sandbox();
        let host = common::FakeHost::new(&paths);
        let settings = common::settings();
        common::running_install(&host, &paths, &settings);
        let operator = ScriptedOperator::default();
        let rt = Runtime::new(&host, &operator, paths.clone(), settings);

        let stable: Vec<_> = ["n8n", "postgres", "redis"].iter().map(|s| host.container_ids(s)).collect();
        for target in &targets {
            prop_assert_eq!(workers::scale_to(&rt, *target).unwrap(), *target);
            prop_assert_eq!(host.replicas("n8n-worker"), *target as usize);
        }
        let after: Vec<_> = ["n8n", "postgres", "redis"].iter().map(|s| host.container_ids(s)).collect();
        prop_assert_eq!(stable, after);
        let last = targets.last().copied().unwrap_or(1).to_string();
        prop_assert_eq!(
            common::env_value(&paths, n8n_provision::env_file::keys::N8N_WORKER_REPLICAS),
            Some(last)
        );
    }
}
