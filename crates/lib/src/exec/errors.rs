//! Remote execution errors

use thiserror::Error;

/// Transport-level failures while running a host operation.
///
/// A command that ran and exited non-zero is not an `ExecError`; it is
/// reported through [`ExecOutput::exit_code`](super::ExecOutput).
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ExecError {
    /// The host could not be reached or the session could not be
    /// established.
    #[error("Cannot connect to {host}: {reason}")]
    Connect { host: String, reason: String },

    /// The session was reached but the server refused the credentials.
    #[error("Authentication rejected by {host}: {reason}")]
    AuthRejected { host: String, reason: String },

    /// The command did not finish within the command timeout.
    #[error("Command on {host} timed out after {seconds}s")]
    Timeout { host: String, seconds: u64 },

    /// The local transport process could not be started.
    #[error("Failed to start remote command: {reason}")]
    Spawn {
        reason: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Remote execution I/O error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl ExecError {
    /// Transient reachability problem, worth retrying.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, ExecError::Connect { .. })
    }

    /// Not retried: the same key will be refused again.
    pub fn is_auth_rejected(&self) -> bool {
        matches!(self, ExecError::AuthRejected { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecError::Timeout { .. })
    }
}
