//! Install stage machine
//!
//! The installer's progress lives in one `InstallerContext` that only moves
//! forward, one stage at a time. A failure records the stage it happened in,
//! which is what the operator needs to know when inspecting a partially
//! provisioned host.
//!
//! ```text
//! NotStarted → Probing → ProvisioningHost → GeneratingSecrets → EmittingConfig
//!   → AcquiringCertificate → StartingServices → AwaitingReadiness
//!   → RegisteringSchedule → Completed
//!
//! (any non-terminal stage can move to Failed)
//! ```

use std::fmt;
use thiserror::Error;

/// Install stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InstallStage {
    NotStarted = 0,
    /// Read-only host inspection; nothing is mutated before this passes
    Probing = 1,
    /// Packages, Docker, firewall, system services, directories
    ProvisioningHost = 2,
    GeneratingSecrets = 3,
    /// `.env`, compose manifest, database bootstrap, helper wrappers
    EmittingConfig = 4,
    /// Challenge responder, certbot, production proxy
    AcquiringCertificate = 5,
    /// Tiered `docker compose up`
    StartingServices = 6,
    /// Schema readiness, then service health
    AwaitingReadiness = 7,
    RegisteringSchedule = 8,
    Completed = 9,
    Failed = 255,
}

impl InstallStage {
    #[inline]
    pub const fn order(self) -> u8 {
        self as u8
    }

    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// True once the host may have been changed
    #[inline]
    pub const fn mutates_host(self) -> bool {
        !matches!(self, Self::NotStarted | Self::Probing)
    }

    pub const fn next(self) -> Option<Self> {
        match self {
            Self::NotStarted => Some(Self::Probing),
            Self::Probing => Some(Self::ProvisioningHost),
            Self::ProvisioningHost => Some(Self::GeneratingSecrets),
            Self::GeneratingSecrets => Some(Self::EmittingConfig),
            Self::EmittingConfig => Some(Self::AcquiringCertificate),
            Self::AcquiringCertificate => Some(Self::StartingServices),
            Self::StartingServices => Some(Self::AwaitingReadiness),
            Self::AwaitingReadiness => Some(Self::RegisteringSchedule),
            Self::RegisteringSchedule => Some(Self::Completed),
            Self::Completed | Self::Failed => None,
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::NotStarted => "Not started",
            Self::Probing => "Checking host",
            Self::ProvisioningHost => "Provisioning host",
            Self::GeneratingSecrets => "Generating credentials",
            Self::EmittingConfig => "Writing configuration",
            Self::AcquiringCertificate => "Obtaining TLS certificate",
            Self::StartingServices => "Starting services",
            Self::AwaitingReadiness => "Waiting for n8n to become ready",
            Self::RegisteringSchedule => "Scheduling maintenance jobs",
            Self::Completed => "Installation complete",
            Self::Failed => "Installation failed",
        }
    }

    /// Short identifier used as the tracing span field
    pub const fn key(self) -> &'static str {
        match self {
            Self::NotStarted => "not-started",
            Self::Probing => "probe",
            Self::ProvisioningHost => "provision",
            Self::GeneratingSecrets => "secrets",
            Self::EmittingConfig => "emit",
            Self::AcquiringCertificate => "certificate",
            Self::StartingServices => "start",
            Self::AwaitingReadiness => "readiness",
            Self::RegisteringSchedule => "schedule",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Number of working stages between NotStarted and Completed
    pub const fn working_stage_count() -> u8 {
        Self::Completed.order() - 1
    }

    pub const fn all_stages() -> &'static [Self] {
        &[
            Self::NotStarted,
            Self::Probing,
            Self::ProvisioningHost,
            Self::GeneratingSecrets,
            Self::EmittingConfig,
            Self::AcquiringCertificate,
            Self::StartingServices,
            Self::AwaitingReadiness,
            Self::RegisteringSchedule,
            Self::Completed,
        ]
    }
}

impl fmt::Display for InstallStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Errors that can occur during stage transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InstallTransitionError {
    #[error("Cannot skip from {from} to {to}")]
    SkippedStage { from: InstallStage, to: InstallStage },

    #[error("Cannot go backwards from {from} to {to}")]
    BackwardTransition { from: InstallStage, to: InstallStage },

    #[error("Cannot leave terminal stage {from}")]
    FromTerminalState { from: InstallStage },

    #[error("Already at stage {stage}")]
    AlreadyAtStage { stage: InstallStage },
}

/// Owns the installer's current stage
#[derive(Debug, Clone)]
pub struct InstallerContext {
    current: InstallStage,
    failed_at: Option<InstallStage>,
    /// (stage, unix seconds) for every stage entered
    stage_history: Vec<(InstallStage, u64)>,
}

impl Default for InstallerContext {
    fn default() -> Self {
        Self::new()
    }
}

impl InstallerContext {
    pub fn new() -> Self {
        Self {
            current: InstallStage::NotStarted,
            failed_at: None,
            stage_history: Vec::with_capacity(InstallStage::all_stages().len()),
        }
    }

    #[inline]
    pub fn current_stage(&self) -> InstallStage {
        self.current
    }

    #[inline]
    pub fn failed_at(&self) -> Option<InstallStage> {
        self.failed_at
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.current == InstallStage::Completed
    }

    pub fn stage_history(&self) -> &[(InstallStage, u64)] {
        &self.stage_history
    }

    /// Move to the next stage
    pub fn advance(&mut self) -> Result<InstallStage, InstallTransitionError> {
        let next = self
            .current
            .next()
            .ok_or(InstallTransitionError::FromTerminalState { from: self.current })?;
        self.enter(next);
        Ok(next)
    }

    /// Move to `target`, which must be the immediate next stage
    pub fn transition_to(
        &mut self,
        target: InstallStage,
    ) -> Result<InstallStage, InstallTransitionError> {
        if self.current.is_terminal() {
            return Err(InstallTransitionError::FromTerminalState { from: self.current });
        }
        if target == self.current {
            return Err(InstallTransitionError::AlreadyAtStage { stage: target });
        }
        if target != InstallStage::Failed && target.order() < self.current.order() {
            return Err(InstallTransitionError::BackwardTransition {
                from: self.current,
                to: target,
            });
        }
        if self.current.next() != Some(target) {
            return Err(InstallTransitionError::SkippedStage {
                from: self.current,
                to: target,
            });
        }
        self.enter(target);
        Ok(target)
    }

    /// Record a failure at the current stage
    pub fn fail(&mut self) -> Result<(), InstallTransitionError> {
        if self.current.is_terminal() {
            return Err(InstallTransitionError::FromTerminalState { from: self.current });
        }
        self.failed_at = Some(self.current);
        self.enter(InstallStage::Failed);
        Ok(())
    }

    fn enter(&mut self, stage: InstallStage) {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.stage_history.push((stage, timestamp));
        self.current = stage;
    }
}

impl From<InstallTransitionError> for crate::error::DeployError {
    fn from(err: InstallTransitionError) -> Self {
        crate::error::DeployError::InstallTransition(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_is_sequential() {
        for (i, stage) in InstallStage::all_stages().iter().enumerate() {
            assert_eq!(stage.order() as usize, i, "{:?}", stage);
        }
    }

    #[test]
    fn test_next_chain_reaches_completed() {
        let mut current = InstallStage::NotStarted;
        let mut steps = 0;
        while let Some(next) = current.next() {
            current = next;
            steps += 1;
        }
        assert_eq!(current, InstallStage::Completed);
        assert_eq!(steps, 9);
        assert_eq!(InstallStage::working_stage_count(), 8);
    }

    #[test]
    fn test_advance_through_all_stages() {
        let mut ctx = InstallerContext::new();
        while !ctx.is_complete() {
            ctx.advance().unwrap();
        }
        assert_eq!(ctx.stage_history().len(), 9);
        assert!(ctx.advance().is_err());
    }

    #[test]
    fn test_cannot_skip_or_go_back() {
        let mut ctx = InstallerContext::new();
        ctx.advance().unwrap();
        assert!(matches!(
            ctx.transition_to(InstallStage::GeneratingSecrets),
            Err(InstallTransitionError::SkippedStage { .. })
        ));
        ctx.transition_to(InstallStage::ProvisioningHost).unwrap();
        assert!(matches!(
            ctx.transition_to(InstallStage::Probing),
            Err(InstallTransitionError::BackwardTransition { .. })
        ));
        assert!(matches!(
            ctx.transition_to(InstallStage::ProvisioningHost),
            Err(InstallTransitionError::AlreadyAtStage { .. })
        ));
    }

    #[test]
    fn test_fail_records_stage() {
        let mut ctx = InstallerContext::new();
        ctx.advance().unwrap();
        ctx.advance().unwrap();
        ctx.fail().unwrap();
        assert_eq!(ctx.current_stage(), InstallStage::Failed);
        assert_eq!(ctx.failed_at(), Some(InstallStage::ProvisioningHost));
        assert!(ctx.fail().is_err());
        assert!(ctx.advance().is_err());
    }

    #[test]
    fn test_probe_is_only_read_only_stage() {
        assert!(!InstallStage::Probing.mutates_host());
        assert!(InstallStage::ProvisioningHost.mutates_host());
    }

    #[test]
    fn test_transition_error_converts() {
        let err: crate::error::DeployError = InstallTransitionError::AlreadyAtStage {
            stage: InstallStage::Probing,
        }
        .into();
        assert!(err.to_string().contains("Checking host"));
    }
}
