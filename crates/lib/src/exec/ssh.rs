//! [`RemoteExec`] over the system OpenSSH client.
//!
//! Admin operations run as `ssh <admin>@<host> sudo -n sh -s` with the
//! script on stdin. `ssh` exits 255 when it cannot establish the session;
//! a refused key maps to [`ExecError::AuthRejected`], anything else to
//! [`ExecError::Connect`]. Child processes are killed when
//! their future is dropped, so cancelling a run does not leak sessions.

use std::{path::PathBuf, process::Stdio, time::Duration};

use async_trait::async_trait;
use tokio::{io::AsyncWriteExt, process::Command};

use super::{ExecError, ExecOutput, HostOp, RemoteExec};
use crate::{instance::Instance, secret::SecretString};

/// Exit status `ssh` uses for its own errors.
const SSH_ERROR_EXIT: i32 = 255;

/// Connection settings for the administrative SSH session.
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Remote admin user; `None` uses the local `ssh` default.
    pub user: Option<String>,
    /// Identity file for the admin user.
    pub identity: Option<PathBuf>,
    pub port: u16,
    /// Bound on establishing the session (`ssh -o ConnectTimeout`).
    pub connect_timeout: Duration,
    /// Bound on a whole command, connection included.
    pub command_timeout: Duration,
    /// Prefix admin scripts with `sudo -n`.
    pub use_sudo: bool,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: None,
            identity: None,
            port: 22,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(60),
            use_sudo: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SshExec {
    config: SshConfig,
}

impl SshExec {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.config.connect_timeout.as_secs().max(1)
            ))
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-p")
            .arg(self.config.port.to_string());
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn admin_target(&self, instance: &Instance) -> String {
        match &self.config.user {
            Some(user) => format!("{user}@{}", instance.address),
            None => instance.address.clone(),
        }
    }

    async fn run_script(&self, instance: &Instance, script: &str) -> Result<ExecOutput, ExecError> {
        let mut cmd = self.base_command();
        if let Some(identity) = &self.config.identity {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg("--").arg(self.admin_target(instance));
        if self.config.use_sudo {
            cmd.args(["sudo", "-n", "sh", "-s"]);
        } else {
            cmd.args(["sh", "-s"]);
        }
        self.run(instance, cmd, Some(script)).await
    }

    async fn verify_login(
        &self,
        instance: &Instance,
        username: &str,
        private_key: &SecretString,
    ) -> Result<ExecOutput, ExecError> {
        let key_file = write_identity(private_key).await?;

        let mut cmd = self.base_command();
        cmd.arg("-o")
            .arg("IdentitiesOnly=yes")
            .arg("-i")
            .arg(key_file.path())
            .arg("--")
            .arg(format!("{username}@{}", instance.address))
            .arg("true");
        let result = self.run(instance, cmd, None).await;
        drop(key_file);
        result
    }

    async fn run(
        &self,
        instance: &Instance,
        mut cmd: Command,
        stdin: Option<&str>,
    ) -> Result<ExecOutput, ExecError> {
        let host = instance.address.clone();
        let seconds = self.config.command_timeout.as_secs();

        let work = async {
            let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
                reason: "could not start ssh".to_string(),
                source,
            })?;

            if let Some(mut pipe) = child.stdin.take() {
                if let Some(input) = stdin {
                    pipe.write_all(input.as_bytes())
                        .await
                        .map_err(|source| ExecError::Io {
                            context: format!("writing script to {host}"),
                            source,
                        })?;
                }
                drop(pipe);
            }

            child
                .wait_with_output()
                .await
                .map_err(|source| ExecError::Io {
                    context: format!("waiting for ssh to {host}"),
                    source,
                })
        };

        let output = tokio::time::timeout(self.config.command_timeout, work)
            .await
            .map_err(|_| ExecError::Timeout {
                host: host.clone(),
                seconds,
            })??;

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if exit_code == SSH_ERROR_EXIT {
            return Err(session_error(host, &stderr));
        }

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
        })
    }
}

#[async_trait]
impl RemoteExec for SshExec {
    async fn exec(&self, instance: &Instance, op: &HostOp) -> Result<ExecOutput, ExecError> {
        tracing::debug!(instance = %instance.id, op = op.name(), "running host operation");
        match op {
            HostOp::VerifyLogin {
                username,
                private_key,
            } => self.verify_login(instance, username, private_key).await,
            other => match other.to_script() {
                Some(script) => self.run_script(instance, &script).await,
                None => Ok(ExecOutput::default()),
            },
        }
    }
}

/// Classify an `ssh` exit 255 from its stderr.
fn session_error(host: String, stderr: &str) -> ExecError {
    let reason = stderr.trim().to_string();
    if reason.contains("Permission denied") {
        ExecError::AuthRejected { host, reason }
    } else {
        ExecError::Connect { host, reason }
    }
}

/// Write the private key to a 0600 temp file for `ssh -i`.
async fn write_identity(private_key: &SecretString) -> Result<tempfile::NamedTempFile, ExecError> {
    let contents = private_key.clone();
    tokio::task::spawn_blocking(move || {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().map_err(|source| ExecError::Io {
            context: "creating identity file".to_string(),
            source,
        })?;
        file.write_all(contents.expose().as_bytes())
            .and_then(|()| file.flush())
            .map_err(|source| ExecError::Io {
                context: "writing identity file".to_string(),
                source,
            })?;
        Ok::<_, ExecError>(file)
    })
    .await
    .map_err(|e| ExecError::Io {
        context: "identity file task".to_string(),
        source: std::io::Error::other(e),
    })?
}
