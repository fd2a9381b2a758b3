//! Notification errors

use thiserror::Error;

/// Failures delivering a first-time access message.
///
/// Notification errors are per user: they are recorded in the run report and
/// never roll back an installation.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum NotifyError {
    /// Invalid or incomplete notifier configuration.
    #[error("Invalid notifier configuration: {reason}")]
    Config { reason: String },

    #[error("Invalid email address '{address}': {reason}")]
    Address { address: String, reason: String },

    /// The message could not be assembled.
    #[error("Failed to build message: {reason}")]
    Build { reason: String },

    /// The transport rejected or failed to send the message.
    #[error("Failed to deliver to {recipient}: {reason}")]
    Send { recipient: String, reason: String },

    #[error("Delivery to {recipient} timed out")]
    Timeout { recipient: String },
}

impl NotifyError {
    pub fn is_config_error(&self) -> bool {
        matches!(self, NotifyError::Config { .. })
    }

    /// Check if the message was built but not delivered.
    pub fn is_delivery_error(&self) -> bool {
        matches!(self, NotifyError::Send { .. } | NotifyError::Timeout { .. })
    }
}

impl From<NotifyError> for crate::Error {
    fn from(err: NotifyError) -> Self {
        crate::Error::Notify(err)
    }
}
