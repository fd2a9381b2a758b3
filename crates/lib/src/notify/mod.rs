//! Notifier
//!
//! Delivers a first-time access message, with the private key attached, to
//! users whose key was created during the current run. Delivery is attempted
//! at most once per user per run.

pub mod errors;
pub mod message;
#[cfg(feature = "smtp")]
pub mod smtp;

use async_trait::async_trait;

pub use errors::NotifyError;
pub use message::compose_notification;
#[cfg(feature = "smtp")]
pub use smtp::{SmtpConfig, SmtpNotifier};

use crate::{registry::User, secret::SecretString};

/// File attached to a notification.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub content: SecretString,
}

/// A composed message, ready for any transport.
#[derive(Debug, Clone)]
pub struct Notification {
    pub subject: String,
    pub text_body: String,
    pub html_body: String,
    pub attachment: Attachment,
}

/// Message delivery transport.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Address the message for `user` will actually go to.
    fn recipient(&self, user: &User) -> String {
        user.email.clone()
    }

    /// Deliver `notification` to `user`. Called at most once per user per run.
    async fn deliver(&self, user: &User, notification: &Notification) -> Result<(), NotifyError>;
}

/// Logs deliveries instead of sending them. The key itself is never logged.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, user: &User, notification: &Notification) -> Result<(), NotifyError> {
        tracing::info!(
            user = %user.username,
            recipient = %user.email,
            subject = %notification.subject,
            attachment = %notification.attachment.filename,
            "notification not sent (no mail transport configured)"
        );
        Ok(())
    }
}
