//! SMTP delivery via lettre.

use std::{env, time::Duration};

use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Attachment as MailAttachment, Mailbox, MultiPart, SinglePart, header::ContentType},
    transport::smtp::authentication::Credentials,
};

use super::{Notification, Notifier, NotifyError};
use crate::{registry::User, secret::SecretString};

/// Port on which mail is relayed in plain text without authentication.
pub const UNAUTHENTICATED_PORT: u16 = 25;

const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub from_address: String,
    pub from_name: String,
    /// Deliver every message here instead of to the user.
    pub test_recipient: Option<String>,
    pub send_timeout: Duration,
}

impl SmtpConfig {
    pub fn new(host: impl Into<String>, from_address: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 587,
            username: None,
            password: None,
            from_address: from_address.into(),
            from_name: "SSH Provisioning".to_string(),
            test_recipient: None,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    /// Read configuration from `KEYFLEET_SMTP_*` variables.
    pub fn from_env() -> Result<Self, NotifyError> {
        let host = env::var("KEYFLEET_SMTP_HOST").map_err(|_| NotifyError::Config {
            reason: "KEYFLEET_SMTP_HOST is required".to_string(),
        })?;

        let port = env::var("KEYFLEET_SMTP_PORT")
            .unwrap_or_else(|_| "587".into())
            .parse()
            .map_err(|_| NotifyError::Config {
                reason: "KEYFLEET_SMTP_PORT must be a valid port number".to_string(),
            })?;

        let from_address = env::var("KEYFLEET_SMTP_FROM").unwrap_or_else(|_| format!("noreply@{host}"));

        Ok(Self {
            port,
            username: env::var("KEYFLEET_SMTP_USER").ok(),
            password: env::var("KEYFLEET_SMTP_PASSWORD").ok().map(SecretString::new),
            from_name: env::var("KEYFLEET_SMTP_FROM_NAME")
                .unwrap_or_else(|_| "SSH Provisioning".into()),
            test_recipient: env::var("KEYFLEET_TEST_EMAIL").ok(),
            ..Self::new(host, from_address)
        })
    }

    pub fn requires_auth(&self) -> bool {
        self.port != UNAUTHENTICATED_PORT
    }
}

pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from_mailbox: Mailbox,
    test_recipient: Option<String>,
    send_timeout: Duration,
}

impl std::fmt::Debug for SmtpNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpNotifier")
            .field("from", &self.from_mailbox.to_string())
            .field("test_recipient", &self.test_recipient)
            .finish_non_exhaustive()
    }
}

impl SmtpNotifier {
    #[tracing::instrument(
        name = "smtp_notifier_new",
        skip(config),
        fields(host = %config.host, port = config.port)
    )]
    pub fn new(config: SmtpConfig) -> Result<Self, NotifyError> {
        let from = format!("{} <{}>", config.from_name, config.from_address);
        let from_mailbox: Mailbox = from.parse().map_err(|e| NotifyError::Address {
            address: from.clone(),
            reason: format!("{e}"),
        })?;

        if let Some(test) = &config.test_recipient {
            test.parse::<Mailbox>().map_err(|e| NotifyError::Address {
                address: test.clone(),
                reason: format!("{e}"),
            })?;
        }

        let transport = if config.requires_auth() {
            let (Some(username), Some(password)) = (config.username, config.password) else {
                return Err(NotifyError::Config {
                    reason: format!(
                        "SMTP credentials are required on port {}",
                        config.port
                    ),
                });
            };
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| NotifyError::Config {
                    reason: format!("{e}"),
                })?
                .port(config.port)
                .credentials(Credentials::new(username, password.into_inner()))
                .build()
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
                .port(config.port)
                .build()
        };

        tracing::debug!("SMTP notifier initialized");

        Ok(Self {
            transport,
            from_mailbox,
            test_recipient: config.test_recipient,
            send_timeout: config.send_timeout,
        })
    }

    #[tracing::instrument(name = "smtp_check_health", skip(self))]
    pub async fn check_health(&self) -> Result<(), NotifyError> {
        self.transport
            .test_connection()
            .await
            .map_err(|e| NotifyError::Send {
                recipient: "-".to_string(),
                reason: format!("{e}"),
            })?;
        Ok(())
    }

    fn build(&self, to: Mailbox, notification: &Notification) -> Result<Message, NotifyError> {
        let octet_stream =
            ContentType::parse("application/octet-stream").map_err(|e| NotifyError::Build {
                reason: format!("{e}"),
            })?;
        let attachment = MailAttachment::new(notification.attachment.filename.clone()).body(
            notification.attachment.content.expose().as_bytes().to_vec(),
            octet_stream,
        );

        Message::builder()
            .from(self.from_mailbox.clone())
            .to(to)
            .subject(notification.subject.as_str())
            .multipart(
                MultiPart::mixed()
                    .multipart(
                        MultiPart::alternative()
                            .singlepart(
                                SinglePart::builder()
                                    .header(ContentType::TEXT_PLAIN)
                                    .body(notification.text_body.clone()),
                            )
                            .singlepart(
                                SinglePart::builder()
                                    .header(ContentType::TEXT_HTML)
                                    .body(notification.html_body.clone()),
                            ),
                    )
                    .singlepart(attachment),
            )
            .map_err(|e| NotifyError::Build {
                reason: format!("{e}"),
            })
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    fn recipient(&self, user: &User) -> String {
        self.test_recipient
            .clone()
            .unwrap_or_else(|| user.email.clone())
    }

    #[tracing::instrument(
        name = "smtp_deliver",
        skip_all,
        fields(user = %user.username, subject = %notification.subject)
    )]
    async fn deliver(&self, user: &User, notification: &Notification) -> Result<(), NotifyError> {
        let recipient = self.recipient(user);
        let to: Mailbox = recipient.parse().map_err(|e| NotifyError::Address {
            address: recipient.clone(),
            reason: format!("{e}"),
        })?;

        let message = self.build(to, notification)?;

        match tokio::time::timeout(self.send_timeout, self.transport.send(message)).await {
            Ok(Ok(_)) => {
                tracing::info!(recipient = %recipient, "notification sent");
                Ok(())
            }
            Ok(Err(e)) => Err(NotifyError::Send {
                recipient,
                reason: format!("{e}"),
            }),
            Err(_) => Err(NotifyError::Timeout { recipient }),
        }
    }
}
