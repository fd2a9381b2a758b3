//! CLI argument definitions for the Keyfleet binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::output::OutputFormat;

/// Key Store backend type
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StoreBackend {
    /// One file per user in the store directory (default)
    File,
    /// SQLite database in the store directory
    Sqlite,
}

/// Key algorithm for newly created keys
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Algorithm {
    /// RSA 4096-bit (default)
    Rsa,
    Ed25519,
}

/// Per-user SSH key provisioning across a fleet of instances
#[derive(Parser, Debug)]
#[command(name = "keyfleet")]
#[command(about = "Keyfleet: issue per-user SSH keys and install them across a fleet")]
#[command(version)]
pub struct Cli {
    /// Output format
    #[arg(long, global = true, default_value = "human", env = "KEYFLEET_OUTPUT")]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Provision every user onto every eligible instance
    Run(Box<RunArgs>),
    /// Inspect the Key Store or re-deliver stored keys
    #[command(subcommand)]
    Keys(KeysCommand),
}

#[derive(Subcommand, Debug)]
pub enum KeysCommand {
    /// List stored keys without secrets
    List(KeysListArgs),
    /// Send a user their stored key again
    Send(Box<KeysSendArgs>),
}

/// Key Store location and encryption
#[derive(clap::Args, Debug)]
pub struct StoreArgs {
    /// Key Store backend
    #[arg(long, default_value = "file", env = "KEYFLEET_STORE_BACKEND")]
    pub store_backend: StoreBackend,

    /// Directory holding the Key Store.
    /// For File: one `<user>.key.json` per user
    /// For SQLite: keyfleet.db
    #[arg(long, default_value = "./keys", env = "KEYFLEET_STORE_DIR")]
    pub store_dir: PathBuf,

    /// Passphrase encrypting private keys at rest
    #[arg(long, env = "KEYFLEET_STORE_PASSPHRASE", hide_env_values = true)]
    pub store_passphrase: String,
}

/// Where instances come from and which are eligible
#[derive(clap::Args, Debug)]
pub struct SourceArgs {
    /// Static inventory file (.json or .toml)
    #[arg(long, env = "KEYFLEET_INVENTORY", group = "source")]
    pub inventory: Option<PathBuf>,

    /// Saved `terraform output -json` document
    #[arg(long, env = "KEYFLEET_TERRAFORM_OUTPUT", group = "source")]
    pub terraform_output: Option<PathBuf>,

    /// Terraform working directory to query with `terraform output -json`
    #[arg(long, env = "KEYFLEET_TERRAFORM_DIR", group = "source")]
    pub terraform_dir: Option<PathBuf>,

    /// Only provision instances in this scope (e.g. a region)
    #[arg(long, env = "KEYFLEET_SCOPE")]
    pub scope: Option<String>,

    /// Marker tag selecting instances, as `key=value` or `key`
    #[arg(long, default_value = "ssh-provisioning=enabled", env = "KEYFLEET_MARKER")]
    pub marker: String,

    /// Fail instead of provisioning every running instance when none carry the marker
    #[arg(long, env = "KEYFLEET_NO_FALLBACK")]
    pub no_fallback: bool,
}

/// Mail transport for user notifications
#[derive(clap::Args, Debug)]
pub struct SmtpArgs {
    /// SMTP relay; messages are only logged when unset
    #[arg(long, env = "KEYFLEET_SMTP_HOST")]
    pub smtp_host: Option<String>,

    /// SMTP port; 25 sends without authentication
    #[arg(long, default_value_t = 587, env = "KEYFLEET_SMTP_PORT")]
    pub smtp_port: u16,

    #[arg(long, env = "KEYFLEET_SMTP_USER")]
    pub smtp_user: Option<String>,

    #[arg(long, env = "KEYFLEET_SMTP_PASSWORD", hide_env_values = true)]
    pub smtp_password: Option<String>,

    /// Sender address (defaults to noreply@<smtp host>)
    #[arg(long, env = "KEYFLEET_SMTP_FROM")]
    pub smtp_from: Option<String>,

    /// Send every message to this address instead of the user
    #[arg(long, env = "KEYFLEET_TEST_EMAIL")]
    pub test_email: Option<String>,
}

/// Arguments for the run command
#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// User list (.json, .toml or .yaml)
    #[arg(long, env = "KEYFLEET_USERS")]
    pub users: PathBuf,

    #[command(flatten)]
    pub source: SourceArgs,

    #[command(flatten)]
    pub store: StoreArgs,

    /// Algorithm for newly created keys
    #[arg(long, default_value = "rsa", env = "KEYFLEET_KEY_ALGORITHM")]
    pub key_algorithm: Algorithm,

    /// Plan only; touch neither hosts nor the Key Store
    #[arg(long, env = "KEYFLEET_DRY_RUN")]
    pub dry_run: bool,

    /// Pairs converged at once
    #[arg(long, default_value_t = 8, env = "KEYFLEET_CONCURRENCY")]
    pub concurrency: usize,

    /// Do not send first-time access messages
    #[arg(long, env = "KEYFLEET_NO_NOTIFY")]
    pub no_notify: bool,

    /// Abort pairs still running after this many seconds
    #[arg(long, env = "KEYFLEET_DEADLINE_SECS")]
    pub deadline_secs: Option<u64>,

    /// SSH connection timeout in seconds
    #[arg(long, default_value_t = 10, env = "KEYFLEET_CONNECT_TIMEOUT_SECS")]
    pub connect_timeout_secs: u64,

    /// Per-command timeout in seconds
    #[arg(long, default_value_t = 60, env = "KEYFLEET_COMMAND_TIMEOUT_SECS")]
    pub command_timeout_secs: u64,

    /// Connection attempts per step before an instance is unreachable
    #[arg(long, default_value_t = 3, env = "KEYFLEET_CONNECT_ATTEMPTS")]
    pub connect_attempts: u32,

    /// Log in as each user after installing
    #[arg(long, env = "KEYFLEET_VERIFY_LOGIN")]
    pub verify_login: bool,

    /// Administrative SSH login
    #[arg(long, env = "KEYFLEET_SSH_USER")]
    pub ssh_user: Option<String>,

    /// Administrative SSH identity file
    #[arg(long, env = "KEYFLEET_SSH_IDENTITY")]
    pub ssh_identity: Option<PathBuf>,

    #[arg(long, default_value_t = 22, env = "KEYFLEET_SSH_PORT")]
    pub ssh_port: u16,

    /// Run remote steps without sudo (admin login is root)
    #[arg(long, env = "KEYFLEET_NO_SUDO")]
    pub no_sudo: bool,

    #[command(flatten)]
    pub smtp: SmtpArgs,
}

/// Arguments for `keys list`
#[derive(clap::Args, Debug)]
pub struct KeysListArgs {
    #[command(flatten)]
    pub store: StoreArgs,
}

/// Arguments for `keys send`
#[derive(clap::Args, Debug)]
pub struct KeysSendArgs {
    /// User to send the stored key to
    pub username: String,

    /// User list the user is looked up in (.json, .toml or .yaml)
    #[arg(long, env = "KEYFLEET_USERS")]
    pub users: PathBuf,

    #[command(flatten)]
    pub source: SourceArgs,

    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub smtp: SmtpArgs,

    /// Compose the message without sending it
    #[arg(long, env = "KEYFLEET_DRY_RUN")]
    pub dry_run: bool,
}
