//! Runtime control of an installed deployment.
//!
//! Every operation here runs against an existing installation, reads the
//! environment file once into an `EnvSnapshot`, and changes it only through
//! `EnvSnapshot::update`.
//!
//! - `workers`: replica scaling, concurrency, interactive menu
//! - `backup`: database dump + file archive, retention, listing
//! - `restore`: replay a backup pair
//! - `upgrade`: version query and version change
//! - `maintenance`: weekly cleanup and certificate renewal

pub mod backup;
pub mod maintenance;
pub mod restore;
pub mod upgrade;
pub mod workers;

use crate::config_file::InstallerSettings;
use crate::env_file::EnvSnapshot;
use crate::error::Result;
use crate::host::Host;
use crate::operator::Operator;
use crate::paths::InstallPaths;
use crate::sequencer::ReadinessPolicy;
use std::path::Path;

/// Shared handles for runtime operations
pub struct Runtime<'a> {
    pub host: &'a dyn Host,
    pub operator: &'a dyn Operator,
    pub paths: InstallPaths,
    pub settings: InstallerSettings,
}

impl<'a> Runtime<'a> {
    pub fn new(
        host: &'a dyn Host,
        operator: &'a dyn Operator,
        paths: InstallPaths,
        settings: InstallerSettings,
    ) -> Self {
        Self {
            host,
            operator,
            paths,
            settings,
        }
    }

    /// Directory holding the compose manifest
    pub fn project_dir(&self) -> &Path {
        self.paths.install_dir()
    }

    /// Read the installation's environment file
    pub fn load_env(&self) -> Result<EnvSnapshot> {
        EnvSnapshot::load(&self.paths.env_file())
    }

    pub fn readiness(&self) -> ReadinessPolicy {
        ReadinessPolicy::from_settings(&self.settings)
    }
}
