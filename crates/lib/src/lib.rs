//!
//! Keyfleet: SSH key provisioning for a fleet of hosts.
//! This library provides the components for issuing per-user SSH keypairs and
//! converging them onto a set of hosts.
//!
//! ## Core Concepts
//!
//! * **Users (`registry::UserRegistry`)**: The validated, ordered list of people who need access.
//! * **Key Store (`keystore::KeyStore`)**: Durable, encrypted storage of exactly one keypair per user. Resolving a key reports whether it was created by this call.
//! * **Instances (`instance::InstanceResolver`)**: Selects the running hosts to provision, by marker tag and optional scope, from a pluggable `InstanceSource`.
//! * **Remote execution (`exec::RemoteExec`)**: Runs idempotent host operations; `exec::SshExec` drives the system `ssh` client.
//! * **Installer (`installer::Installer`)**: Converges one (user, instance) pair: account, `authorized_keys` entry, ownership and modes.
//! * **Notifier (`notify::Notifier`)**: Delivers the first-time access message, with the private key attached, to users whose key was just created.
//! * **Coordinator (`coordinator::Coordinator`)**: Orchestrates a run and produces a `report::RunReport`.

pub mod clock;
pub mod coordinator;
pub mod exec;
pub mod installer;
pub mod instance;
pub mod keystore;
pub mod notify;
pub mod registry;
pub mod report;
pub mod secret;

#[cfg(any(test, feature = "testing"))]
pub use clock::FixedClock;
pub use clock::{Clock, SystemClock};
pub use coordinator::{Coordinator, KeyResend, RunOptions};
pub use registry::{User, UserRegistry};
pub use report::RunReport;
pub use secret::SecretString;

/// Result type used throughout the Keyfleet library.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for the Keyfleet library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Invalid user input from the registry module
    #[error(transparent)]
    Registry(registry::RegistryError),

    /// Structured key store errors from the keystore module
    #[error(transparent)]
    KeyStore(keystore::KeyStoreError),

    /// Instance resolution errors from the instance module
    #[error(transparent)]
    Resolution(instance::ResolutionError),

    /// Pair-level installation errors from the installer module
    #[error(transparent)]
    Install(installer::InstallError),

    /// Delivery errors from the notify module
    #[error(transparent)]
    Notify(notify::NotifyError),

    /// The run was cancelled before any host was touched.
    #[error("Run cancelled")]
    Cancelled,
}

impl Error {
    /// Get the originating module for this error.
    pub fn module(&self) -> &'static str {
        match self {
            Error::Registry(_) => "registry",
            Error::KeyStore(_) => "keystore",
            Error::Resolution(_) => "instance",
            Error::Install(_) => "installer",
            Error::Notify(_) => "notify",
            Error::Cancelled => "coordinator",
            Error::Io(_) => "io",
            Error::Serialize(_) => "serialize",
        }
    }

    /// Check if this error aborts a run.
    ///
    /// Installation and notification errors are scoped to one pair or one
    /// user and are reported instead.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Install(_) | Error::Notify(_))
    }

    /// Check if this error stems from invalid operator input.
    pub fn is_config_error(&self) -> bool {
        match self {
            Error::Registry(_) => true,
            Error::Resolution(err) => !err.is_source_error() && !err.is_empty_result(),
            Error::KeyStore(err) => matches!(
                err,
                keystore::KeyStoreError::MissingPassphrase
                    | keystore::KeyStoreError::InvalidUsername { .. }
            ),
            Error::Notify(err) => err.is_config_error(),
            _ => false,
        }
    }

    /// Check if this error indicates a resource was not found.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Resolution(err) => err.is_empty_result(),
            Error::KeyStore(err) => err.is_not_found(),
            Error::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Check if this error is key store-related.
    pub fn is_keystore_error(&self) -> bool {
        matches!(self, Error::KeyStore(_))
    }

    /// Check if this error indicates a data integrity issue.
    pub fn is_integrity_error(&self) -> bool {
        match self {
            Error::KeyStore(err) => err.is_integrity_error(),
            _ => false,
        }
    }

    /// Check if this error indicates a timeout.
    pub fn is_timeout_error(&self) -> bool {
        match self {
            Error::KeyStore(keystore::KeyStoreError::Timeout { .. })
            | Error::Resolution(instance::ResolutionError::Timeout { .. }) => true,
            Error::Install(err) => err.class() == report::ErrorClass::Timeout,
            Error::Notify(notify::NotifyError::Timeout { .. }) => true,
            _ => false,
        }
    }
}
