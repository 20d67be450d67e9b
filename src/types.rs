//! Type-safe configuration types for n8n-provision
//!
//! These enums replace stringly-typed configuration values. The strum
//! serializations are the exact strings written to the environment file and
//! the compose manifest, so `to_string()` / `parse()` round-trip through them.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// How n8n executes workflows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Main process executes workflows inline
    #[strum(serialize = "regular")]
    Regular,
    /// Main process enqueues, worker processes dequeue and execute
    #[default]
    #[strum(serialize = "queue")]
    Queue,
}

impl ExecutionMode {
    /// Queue mode needs the queue service and at least one worker replica
    pub fn uses_workers(self) -> bool {
        matches!(self, Self::Queue)
    }
}

/// Where n8n stores binary payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
pub enum BinaryDataMode {
    /// Inline in the database
    #[strum(serialize = "default")]
    Default,
    /// On the filesystem under the n8n data directory
    #[default]
    #[strum(serialize = "filesystem")]
    Filesystem,
}

/// Container restart policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
pub enum RestartPolicy {
    #[strum(serialize = "no")]
    #[serde(rename = "no")]
    No,
    #[strum(serialize = "always")]
    #[serde(rename = "always")]
    Always,
    #[default]
    #[strum(serialize = "unless-stopped")]
    #[serde(rename = "unless-stopped")]
    UnlessStopped,
}

/// Role of a service in the deployment topology.
///
/// The strum serialization is the compose service name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(Display, EnumString, EnumIter)]
pub enum ServiceRole {
    #[strum(serialize = "postgres")]
    Database,
    #[strum(serialize = "redis")]
    Queue,
    #[strum(serialize = "n8n")]
    Main,
    #[strum(serialize = "n8n-worker")]
    Worker,
}

impl ServiceRole {
    /// Compose service name
    pub fn service_name(self) -> &'static str {
        match self {
            Self::Database => "postgres",
            Self::Queue => "redis",
            Self::Main => "n8n",
            Self::Worker => "n8n-worker",
        }
    }

    /// Stateful services keep data in volumes and must declare a health probe
    pub fn is_stateful(self) -> bool {
        matches!(self, Self::Database | Self::Queue)
    }

    /// Only the worker is a replicated template
    pub fn is_replicated(self) -> bool {
        matches!(self, Self::Worker)
    }
}
