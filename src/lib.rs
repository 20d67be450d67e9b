//! n8n-provision
//!
//! Provisions a single Debian/Ubuntu host with a containerized n8n deployment
//! (main process, queue workers, PostgreSQL, Redis) behind nginx with a
//! Let's Encrypt certificate, and operates it afterwards: worker scaling,
//! backup and restore, upgrades, scheduled housekeeping.
//!
//! Every side effect goes through the [`host::Host`] seam so the whole
//! install and runtime flow can be exercised against a scripted host.

pub mod certificate;
pub mod cli;
pub mod commands;
pub mod compose;
pub mod config_file;
pub mod console;
pub mod control;
pub mod emitter;
pub mod env_file;
pub mod error;
pub mod host;
pub mod install_state;
pub mod manifest;
pub mod operator;
pub mod paths;
pub mod probe;
pub mod process_guard;
pub mod provision;
pub mod proxy;
pub mod retry;
pub mod scheduler;
pub mod secrets;
pub mod sequencer;
pub mod types;

pub use config_file::InstallerSettings;
pub use env_file::{EnvSnapshot, EnvironmentConfig};
pub use error::{DeployError, Result};
pub use host::{CommandOutput, Host, SystemHost};
pub use install_state::{InstallStage, InstallerContext};
pub use manifest::ServiceTopology;
pub use operator::{Operator, ScriptedOperator, TerminalOperator};
pub use paths::InstallPaths;
pub use probe::{HostFacts, Inspector, ProbeReport, SystemInspector};
pub use retry::RetryPolicy;
pub use sequencer::{InstallSummary, Installer};
pub use types::{BinaryDataMode, ExecutionMode, RestartPolicy, ServiceRole};
