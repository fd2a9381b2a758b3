//! Installer error types

use thiserror::Error;

use crate::report::ErrorClass;

/// Why a single (user, instance) pair failed to converge.
///
/// These never escape a pair: the installer turns them into a failed
/// [`ProvisioningOutcome`](crate::report::ProvisioningOutcome).
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum InstallError {
    /// Connection attempts exhausted.
    #[error("Instance {instance_id} unreachable after {attempts} attempt(s): {reason}")]
    Unreachable {
        instance_id: String,
        attempts: u32,
        reason: String,
    },

    /// A remote step exited non-zero.
    #[error("Step '{step}' failed with exit code {exit_code}: {stderr}")]
    StepFailed {
        step: &'static str,
        exit_code: i32,
        stderr: String,
    },

    /// A remote step succeeded but reported something unexpected.
    #[error("Step '{step}' returned unexpected output: {output}")]
    UnexpectedOutput { step: &'static str, output: String },

    /// The host refused the key.
    #[error("Step '{step}' was refused: {reason}")]
    AuthRejected { step: &'static str, reason: String },

    #[error("Step '{step}' timed out: {reason}")]
    Timeout { step: &'static str, reason: String },

    /// The local transport failed (e.g. `ssh` missing).
    #[error("Step '{step}' could not run: {reason}")]
    Transport { step: &'static str, reason: String },
}

impl InstallError {
    /// Report classification for this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            InstallError::Unreachable { .. } => ErrorClass::Connectivity,
            InstallError::Timeout { .. } => ErrorClass::Timeout,
            InstallError::AuthRejected { .. } => ErrorClass::Auth,
            _ => ErrorClass::Install,
        }
    }

    pub fn is_connectivity(&self) -> bool {
        matches!(self, InstallError::Unreachable { .. })
    }

    /// Remote step that failed, if known.
    pub fn step(&self) -> Option<&'static str> {
        match self {
            InstallError::StepFailed { step, .. }
            | InstallError::UnexpectedOutput { step, .. }
            | InstallError::AuthRejected { step, .. }
            | InstallError::Timeout { step, .. }
            | InstallError::Transport { step, .. } => Some(step),
            InstallError::Unreachable { .. } => None,
        }
    }
}

impl From<InstallError> for crate::Error {
    fn from(err: InstallError) -> Self {
        crate::Error::Install(err)
    }
}
