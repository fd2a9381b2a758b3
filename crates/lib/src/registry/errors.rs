//! Error types for the user registry
use std::path::PathBuf;

use thiserror::Error;

/// Configuration errors raised while loading the desired-state user list.
///
/// Every variant is fatal: the run aborts before any key is created or any
/// host is touched.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Failed to read user list {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse user list {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Unsupported user list format '{extension}' (expected .json, .toml, .yaml or .yml)")]
    UnsupportedFormat { extension: String },

    #[error("User entry #{index} is missing a username")]
    MissingUsername { index: usize },

    #[error("User '{username}' is missing an email address")]
    MissingEmail { username: String },

    #[error("User '{username}' has an invalid email address: {email}")]
    InvalidEmail { username: String, email: String },

    #[error(
        "Invalid username '{username}': must start with a lowercase letter or '_' and contain only [a-z0-9_-], at most 32 characters"
    )]
    InvalidUsername { username: String },

    #[error("Username listed more than once: {username}")]
    DuplicateUsername { username: String },

    #[error("User list is empty")]
    Empty,
}

impl RegistryError {
    /// Check if this error came from reading or decoding the input document
    /// rather than from validating its entries.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            RegistryError::Read { .. }
                | RegistryError::Parse { .. }
                | RegistryError::UnsupportedFormat { .. }
        )
    }

    /// Username the error refers to, if any.
    pub fn username(&self) -> Option<&str> {
        match self {
            RegistryError::MissingEmail { username }
            | RegistryError::InvalidEmail { username, .. }
            | RegistryError::InvalidUsername { username }
            | RegistryError::DuplicateUsername { username } => Some(username),
            _ => None,
        }
    }
}

impl From<RegistryError> for crate::Error {
    fn from(err: RegistryError) -> Self {
        crate::Error::Registry(err)
    }
}
