//! Error types for instance resolution
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while building the set of target instances.
///
/// All of these abort the run before any host is touched.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ResolutionError {
    /// Neither the marker query nor the fallback produced an eligible host.
    #[error("No eligible running instances found (marker {marker}, scope {scope})")]
    NoEligibleInstances { marker: String, scope: String },

    #[error("Failed to read inventory {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse inventory {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Unsupported inventory format '{extension}' (expected .json or .toml)")]
    UnsupportedFormat { extension: String },

    /// `terraform output -json` could not be run or failed.
    #[error("terraform output failed: {reason}")]
    Terraform { reason: String },

    /// The Terraform outputs lack the expected `instance_details` output.
    #[error("Terraform outputs have no '{output}' output")]
    MissingOutput { output: String },

    #[error("Invalid marker tag '{marker}'")]
    InvalidMarker { marker: String },

    /// The inventory source could not be queried.
    #[error("Instance source unavailable: {reason}")]
    SourceUnavailable { reason: String },

    #[error("Instance source timed out after {seconds}s")]
    Timeout { seconds: u64 },
}

impl ResolutionError {
    /// Check if resolution succeeded but found nothing to provision.
    pub fn is_empty_result(&self) -> bool {
        matches!(self, ResolutionError::NoEligibleInstances { .. })
    }

    /// Check if the inventory itself could not be obtained.
    pub fn is_source_error(&self) -> bool {
        matches!(
            self,
            ResolutionError::Read { .. }
                | ResolutionError::Terraform { .. }
                | ResolutionError::SourceUnavailable { .. }
                | ResolutionError::Timeout { .. }
        )
    }
}

impl From<ResolutionError> for crate::Error {
    fn from(err: ResolutionError) -> Self {
        crate::Error::Resolution(err)
    }
}
