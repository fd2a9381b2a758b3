//! Installer
//!
//! Converges one (user, instance) pair: the account exists, the user's public
//! key is in `authorized_keys` exactly once, and ownership and modes are
//! correct. Steps run strictly in order and every step is idempotent, so a
//! re-run after a partial failure only finishes what is missing.

pub mod errors;

use std::{sync::Arc, time::Duration};

pub use errors::InstallError;

use crate::{
    exec::{ExecError, ExecOutput, HostOp, RemoteExec},
    instance::Instance,
    keystore::KeyPair,
    registry::User,
    report::ProvisioningOutcome,
};

/// Retry and verification settings for the installer.
#[derive(Debug, Clone)]
pub struct InstallerOptions {
    /// Total tries per step when the host is unreachable.
    pub connect_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub backoff_base: Duration,
    /// Log in as the user after installing.
    pub verify_login: bool,
}

impl Default for InstallerOptions {
    fn default() -> Self {
        Self {
            connect_attempts: 3,
            backoff_base: Duration::from_secs(1),
            verify_login: false,
        }
    }
}

impl InstallerOptions {
    /// Delay before retry number `attempt` (1-based), capped at 64x the base.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base * 2u32.pow(attempt.saturating_sub(1).min(6))
    }
}

#[derive(Clone)]
pub struct Installer {
    exec: Arc<dyn RemoteExec>,
    options: InstallerOptions,
}

impl std::fmt::Debug for Installer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Installer")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Installer {
    pub fn new(exec: Arc<dyn RemoteExec>, options: InstallerOptions) -> Self {
        Self { exec, options }
    }

    pub fn options(&self) -> &InstallerOptions {
        &self.options
    }

    /// Converge one pair. Never fails: errors become a failed outcome.
    #[tracing::instrument(
        name = "install",
        skip_all,
        fields(user = %user.username, instance = %instance.id)
    )]
    pub async fn install(
        &self,
        user: &User,
        instance: &Instance,
        keypair: &KeyPair,
    ) -> ProvisioningOutcome {
        match self.converge(user, instance, keypair).await {
            Ok(appended) => {
                tracing::info!(
                    status = if appended { "installed" } else { "already_present" },
                    "pair converged"
                );
                ProvisioningOutcome::converged(&user.username, &instance.id, appended)
            }
            Err(err) => {
                tracing::warn!(class = %err.class(), error = %err, "pair failed");
                ProvisioningOutcome::failed(
                    &user.username,
                    &instance.id,
                    err.class(),
                    err.to_string(),
                )
            }
        }
    }

    /// Returns whether the key was appended.
    async fn converge(
        &self,
        user: &User,
        instance: &Instance,
        keypair: &KeyPair,
    ) -> Result<bool, InstallError> {
        let username = user.username.clone();

        self.run(instance, &HostOp::Probe).await?;

        let account = self
            .run(
                instance,
                &HostOp::EnsureAccount {
                    username: username.clone(),
                },
            )
            .await?;
        match account.status_word() {
            "created" => tracing::debug!("account created"),
            "present" => tracing::debug!("account already present"),
            other => {
                return Err(InstallError::UnexpectedOutput {
                    step: "ensure_account",
                    output: other.to_string(),
                });
            }
        }

        let credential = self
            .run(
                instance,
                &HostOp::EnsureCredential {
                    username: username.clone(),
                    public_key: keypair.public_key.clone(),
                },
            )
            .await?;
        let appended = match credential.status_word() {
            "installed" => true,
            "present" => false,
            other => {
                return Err(InstallError::UnexpectedOutput {
                    step: "ensure_credential",
                    output: other.to_string(),
                });
            }
        };

        self.run(
            instance,
            &HostOp::VerifyPermissions {
                username: username.clone(),
            },
        )
        .await?;

        if self.options.verify_login {
            self.run(
                instance,
                &HostOp::VerifyLogin {
                    username,
                    private_key: keypair.private_key.clone(),
                },
            )
            .await?;
        }

        Ok(appended)
    }

    /// Run one step, retrying while the host is unreachable.
    async fn run(&self, instance: &Instance, op: &HostOp) -> Result<ExecOutput, InstallError> {
        let step = op.name();
        let max_attempts = self.options.connect_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.exec.exec(instance, op).await {
                Ok(output) if output.is_success() => return Ok(output),
                Ok(output) => {
                    return Err(InstallError::StepFailed {
                        step,
                        exit_code: output.exit_code,
                        stderr: output.stderr.trim().to_string(),
                    });
                }
                Err(err) if err.is_connectivity() => {
                    if attempt >= max_attempts {
                        return Err(InstallError::Unreachable {
                            instance_id: instance.id.clone(),
                            attempts: attempt,
                            reason: err.to_string(),
                        });
                    }
                    let delay = self.options.backoff(attempt);
                    tracing::debug!(
                        step,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "host unreachable, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err @ ExecError::AuthRejected { .. }) => {
                    return Err(InstallError::AuthRejected {
                        step,
                        reason: err.to_string(),
                    });
                }
                Err(err @ ExecError::Timeout { .. }) => {
                    return Err(InstallError::Timeout {
                        step,
                        reason: err.to_string(),
                    });
                }
                Err(err) => {
                    return Err(InstallError::Transport {
                        step,
                        reason: err.to_string(),
                    });
                }
            }
        }
    }
}
