//! Running-state queries against the compose project.
//!
//! `docker compose ps --format json` prints a JSON array on older Compose v2
//! releases and one JSON object per line on newer ones; both are accepted.

use crate::commands::compose::ComposeArgs;
use crate::error::{DeployError, Result};
use crate::host::Host;
use crate::types::ServiceRole;
use serde::Deserialize;
use std::path::Path;

/// One container as reported by `docker compose ps`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ContainerStatus {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Service")]
    pub service: String,
    #[serde(rename = "State", default)]
    pub state: String,
    /// `healthy`, `unhealthy`, `starting`, or empty when no probe is declared
    #[serde(rename = "Health", default)]
    pub health: String,
    #[serde(rename = "CreatedAt", default)]
    pub created_at: String,
}

impl ContainerStatus {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }

    pub fn is_healthy(&self) -> bool {
        self.is_running() && self.health == "healthy"
    }
}

/// Parse `docker compose ps --format json` output
pub fn parse_ps(stdout: &str) -> Result<Vec<ContainerStatus>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        return Ok(serde_json::from_str(trimmed)?);
    }
    trimmed
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(DeployError::from))
        .collect()
}

/// Snapshot of every container in the project
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectStatus {
    pub containers: Vec<ContainerStatus>,
}

impl ProjectStatus {
    /// Ask Docker for the current state
    pub fn query(host: &dyn Host, project_dir: &Path) -> Result<Self> {
        let output = host.run_checked(&ComposeArgs::ps(project_dir))?;
        Ok(Self {
            containers: parse_ps(&output.stdout)?,
        })
    }

    pub fn of(&self, role: ServiceRole) -> impl Iterator<Item = &ContainerStatus> {
        let name = role.service_name();
        self.containers.iter().filter(move |c| c.service == name)
    }

    /// Number of running containers of a service
    pub fn running(&self, role: ServiceRole) -> u32 {
        self.of(role).filter(|c| c.is_running()).count() as u32
    }

    /// At least one container exists and every one of them is healthy
    pub fn is_healthy(&self, role: ServiceRole) -> bool {
        let mut any = false;
        for container in self.of(role) {
            if !container.is_healthy() {
                return false;
            }
            any = true;
        }
        any
    }

    /// Services among `roles` that are not healthy yet, with their states
    pub fn unhealthy(&self, roles: &[ServiceRole]) -> Vec<String> {
        roles
            .iter()
            .filter(|role| !self.is_healthy(**role))
            .map(|role| {
                let states: Vec<String> = self
                    .of(*role)
                    .map(|c| {
                        if c.health.is_empty() {
                            c.state.clone()
                        } else {
                            format!("{}/{}", c.state, c.health)
                        }
                    })
                    .collect();
                if states.is_empty() {
                    format!("{} (no container)", role)
                } else {
                    format!("{} ({})", role, states.join(", "))
                }
            })
            .collect()
    }
}
