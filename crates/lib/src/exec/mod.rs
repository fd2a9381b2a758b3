//! Remote execution
//!
//! Host mutations are expressed as structured [`HostOp`] values and rendered
//! to POSIX shell scripts only at the transport edge. Every value that ends
//! up in a script goes through [`shell_quote`].

pub mod errors;
pub mod script;
pub mod ssh;

use async_trait::async_trait;

pub use errors::ExecError;
pub use ssh::{SshConfig, SshExec};

use crate::{instance::Instance, secret::SecretString};

/// A single idempotent operation against one host.
#[derive(Debug, Clone)]
pub enum HostOp {
    /// Reachability check; succeeds without side effects.
    Probe,
    /// Create the local account if it does not exist.
    /// Prints `created` or `present`.
    EnsureAccount { username: String },
    /// Make sure `authorized_keys` contains the public key.
    /// Prints `installed` or `present`.
    EnsureCredential {
        username: String,
        public_key: String,
    },
    /// Check owner and mode of `~/.ssh` and `authorized_keys`.
    VerifyPermissions { username: String },
    /// Log in as the user with their private key and run `true`.
    VerifyLogin {
        username: String,
        private_key: SecretString,
    },
}

impl HostOp {
    pub fn name(&self) -> &'static str {
        match self {
            HostOp::Probe => "probe",
            HostOp::EnsureAccount { .. } => "ensure_account",
            HostOp::EnsureCredential { .. } => "ensure_credential",
            HostOp::VerifyPermissions { .. } => "verify_permissions",
            HostOp::VerifyLogin { .. } => "verify_login",
        }
    }

    /// Script executed with administrative privileges on the host.
    ///
    /// `VerifyLogin` has no admin script; the transport logs in as the user
    /// instead.
    pub fn to_script(&self) -> Option<String> {
        match self {
            HostOp::Probe => Some(script::probe()),
            HostOp::EnsureAccount { username } => Some(script::ensure_account(username)),
            HostOp::EnsureCredential {
                username,
                public_key,
            } => Some(script::ensure_credential(username, public_key)),
            HostOp::VerifyPermissions { username } => Some(script::verify_permissions(username)),
            HostOp::VerifyLogin { .. } => None,
        }
    }
}

/// Captured result of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last non-empty stdout line, which is where scripts report their
    /// result word.
    pub fn status_word(&self) -> &str {
        self.stdout
            .lines()
            .map(str::trim)
            .rfind(|line| !line.is_empty())
            .unwrap_or("")
    }
}

/// Runs host operations over some secure channel.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    async fn exec(&self, instance: &Instance, op: &HostOp) -> Result<ExecOutput, ExecError>;
}

/// Quote `value` for a POSIX shell: wrap in single quotes and escape embedded
/// single quotes as `'\''`.
pub fn shell_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if c == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}
