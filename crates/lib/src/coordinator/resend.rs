//! Re-delivery of a stored key
//!
//! Used when a first-time notification failed, or a user lost the message.
//! Never creates a key and never touches a host.

use std::sync::Arc;

use crate::{
    Result,
    instance::InstanceResolver,
    keystore::{KeyStore, KeyStoreError},
    notify::{Notifier, compose_notification},
    registry::User,
    report::{NotificationRecord, NotificationStatus},
};

pub struct KeyResend {
    keystore: KeyStore,
    resolver: InstanceResolver,
    notifier: Arc<dyn Notifier>,
}

impl std::fmt::Debug for KeyResend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyResend")
            .field("keystore", &self.keystore)
            .field("resolver", &self.resolver)
            .finish_non_exhaustive()
    }
}

impl KeyResend {
    pub fn new(keystore: KeyStore, resolver: InstanceResolver, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            keystore,
            resolver,
            notifier,
        }
    }

    /// Send `user` their stored key again, listing the current eligible
    /// instances.
    ///
    /// A user with no stored key is an error. With `dry_run` the message is
    /// composed but not delivered and the record is `Suppressed`. A failed
    /// delivery is reported in the record, not as an error.
    #[tracing::instrument(skip(self, user), fields(user = %user.username))]
    pub async fn send(&self, user: &User, dry_run: bool) -> Result<NotificationRecord> {
        let keypair = self
            .keystore
            .peek(&user.username)
            .await?
            .ok_or_else(|| KeyStoreError::NotFound {
                username: user.username.clone(),
            })?;
        let resolution = self.resolver.resolve().await?;

        let recipient = self.notifier.recipient(user);
        let username = user.username.clone();
        let notification =
            compose_notification(user, &keypair, &resolution.instances, keypair.created_at);

        if dry_run {
            tracing::info!(%recipient, instances = resolution.instances.len(), "resend planned");
            return Ok(NotificationRecord {
                username,
                recipient,
                status: NotificationStatus::Suppressed,
                error: None,
            });
        }

        match self.notifier.deliver(user, &notification).await {
            Ok(()) => {
                tracing::info!(%recipient, "key resent");
                Ok(NotificationRecord {
                    username,
                    recipient,
                    status: NotificationStatus::Delivered,
                    error: None,
                })
            }
            Err(err) => {
                tracing::error!(%recipient, error = %err, "resend failed");
                Ok(NotificationRecord {
                    username,
                    recipient,
                    status: NotificationStatus::Failed,
                    error: Some(err.to_string()),
                })
            }
        }
    }
}
