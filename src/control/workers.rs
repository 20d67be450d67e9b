//! Worker fleet control.
//!
//! Scaling re-applies only the worker service (`up --no-deps --scale`), so
//! main, database and queue containers keep running untouched. The replica
//! count is persisted in `.env` and the manifest so a later full `up` keeps it.
//! A value is only left recorded once compose has accepted it.

use super::Runtime;
use crate::commands::compose::ComposeArgs;
use crate::compose::ProjectStatus;
use crate::config_file::validate_concurrency;
use crate::console;
use crate::emitter;
use crate::env_file::{EnvSnapshot, keys};
use crate::error::{DeployError, Result};
use crate::sequencer::wait_healthy;
use crate::types::ServiceRole;

/// Fewest workers a queue-mode deployment may run
pub const MIN_WORKERS: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    /// Worker containers currently running
    pub running: u32,
    /// Healthy worker containers
    pub healthy: u32,
    /// Replica count recorded in `.env`
    pub declared: u32,
    pub concurrency: u32,
}

fn require_queue_mode(env: &EnvSnapshot) -> Result<()> {
    if env.config().execution_mode.uses_workers() {
        Ok(())
    } else {
        Err(DeployError::validation(
            "workers are only used in queue mode; this installation runs in regular mode",
        ))
    }
}

/// Running worker count
pub fn running_workers(rt: &Runtime) -> Result<u32> {
    Ok(ProjectStatus::query(rt.host, rt.project_dir())?.running(ServiceRole::Worker))
}

pub fn status(rt: &Runtime) -> Result<WorkerStatus> {
    let env = rt.load_env()?;
    require_queue_mode(&env)?;
    let ps = ProjectStatus::query(rt.host, rt.project_dir())?;
    Ok(WorkerStatus {
        running: ps.running(ServiceRole::Worker),
        healthy: ps
            .of(ServiceRole::Worker)
            .filter(|c| c.is_healthy())
            .count() as u32,
        declared: env.config().worker_replicas,
        concurrency: env.config().worker_concurrency,
    })
}

/// Re-apply the worker service at `replicas`
pub fn scale_to(rt: &Runtime, replicas: u32) -> Result<u32> {
    if replicas < MIN_WORKERS {
        return Err(DeployError::validation(format!(
            "at least {} worker must keep running in queue mode; executions stall without one",
            MIN_WORKERS
        )));
    }
    let mut env = rt.load_env()?;
    require_queue_mode(&env)?;

    // nothing is recorded until compose accepts the new count
    rt.host.run_checked(&ComposeArgs::scale(
        rt.project_dir(),
        ServiceRole::Worker.service_name(),
        replicas,
        false,
    ))?;
    env.update(rt.host, keys::N8N_WORKER_REPLICAS, &replicas.to_string())?;
    emitter::write_manifest(rt.host, &rt.paths, env.config())?;
    wait_healthy(
        rt.host,
        rt.project_dir(),
        &[ServiceRole::Worker],
        &rt.settings.health_poll,
    )?;
    log::info!("Worker replicas: {}", replicas);
    Ok(replicas)
}

/// One more worker than currently running
pub fn add(rt: &Runtime) -> Result<u32> {
    let current = running_workers(rt)?;
    scale_to(rt, current + 1)
}

/// One worker fewer; refuses to remove the last one
pub fn remove(rt: &Runtime) -> Result<u32> {
    let current = running_workers(rt)?;
    if current <= MIN_WORKERS {
        return Err(DeployError::validation(format!(
            "cannot remove the last worker ({} running)",
            current
        )));
    }
    scale_to(rt, current - 1)
}

/// Change per-worker concurrency and recreate only the workers
pub fn set_concurrency(rt: &Runtime, value: u32) -> Result<()> {
    validate_concurrency(value).map_err(|e| DeployError::validation(e.to_string()))?;
    let mut env = rt.load_env()?;
    require_queue_mode(&env)?;

    let replicas = running_workers(rt)?.max(MIN_WORKERS);
    let previous = env.config().worker_concurrency.to_string();
    // workers read the value from `.env` when recreated
    env.update(rt.host, keys::N8N_WORKER_CONCURRENCY, &value.to_string())?;
    emitter::write_manifest(rt.host, &rt.paths, env.config())?;
    let recreate = rt.host.run_checked(&ComposeArgs::scale(
        rt.project_dir(),
        ServiceRole::Worker.service_name(),
        replicas,
        true,
    ));
    if let Err(e) = recreate {
        env.update(rt.host, keys::N8N_WORKER_CONCURRENCY, &previous)?;
        emitter::write_manifest(rt.host, &rt.paths, env.config())?;
        log::warn!("Worker concurrency left at {}", previous);
        return Err(e);
    }
    wait_healthy(
        rt.host,
        rt.project_dir(),
        &[ServiceRole::Worker],
        &rt.settings.health_poll,
    )?;
    log::info!("Worker concurrency: {}", value);
    Ok(())
}

pub fn print_status(status: &WorkerStatus) {
    console::heading("Workers");
    console::field("Running", &status.running.to_string());
    console::field("Healthy", &status.healthy.to_string());
    console::field("Configured", &status.declared.to_string());
    console::field("Concurrency", &status.concurrency.to_string());
}

const MENU: &[&str] = &[
    "Add a worker",
    "Remove a worker",
    "Change worker concurrency",
    "Show status",
    "Quit",
];

/// Interactive worker manager. Errors from one action are shown and the menu continues.
pub fn menu(rt: &Runtime) -> Result<()> {
    loop {
        let choice = rt.operator.choose("n8n worker manager", MENU)?;
        let outcome = match choice {
            0 => add(rt).map(|n| console::success(&format!("{} worker(s) running", n))),
            1 => remove(rt).map(|n| console::success(&format!("{} worker(s) running", n))),
            2 => rt
                .operator
                .prompt("Concurrency per worker (1-20)", None)
                .and_then(|answer| {
                    answer.trim().parse::<u32>().map_err(|_| {
                        DeployError::validation(format!("'{}' is not a number", answer.trim()))
                    })
                })
                .and_then(|value| set_concurrency(rt, value))
                .map(|()| console::success("workers recreated with the new concurrency")),
            3 => status(rt).map(|s| print_status(&s)),
            _ => return Ok(()),
        };
        if let Err(e) = outcome {
            if matches!(e, DeployError::Aborted(_)) {
                return Err(e);
            }
            console::fail(&e.to_string());
        }
    }
}
