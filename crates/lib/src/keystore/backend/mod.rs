//! Key store backends
//!
//! A backend persists [`StoredKeyPair`] records keyed by username. Records
//! are already encrypted when they reach the backend, so backends never see
//! private key plaintext.
//!
//! The only write primitive is [`KeyBackend::create_if_absent`]. It must be
//! atomic: when several writers race for the same username exactly one gets
//! [`CreateOutcome::Created`] and every other writer gets
//! [`CreateOutcome::AlreadyExists`]. Backends never overwrite a record.

use std::any::Any;

use async_trait::async_trait;

use super::{errors::KeyStoreError, types::StoredKeyPair};

pub mod file;
pub mod in_memory;
#[cfg(feature = "sqlite")]
pub mod sql;

pub use file::FileStore;
pub use in_memory::InMemory;
#[cfg(feature = "sqlite")]
pub use sql::SqliteStore;

/// Result of [`KeyBackend::create_if_absent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// This call wrote the record.
    Created,
    /// A record for the username already existed; nothing was written.
    AlreadyExists,
}

/// Storage abstraction for encrypted keypair records.
///
/// All backends must be `Send` and `Sync` to be shared between workers, and
/// implement `Any` to allow downcasting in tests and tooling.
#[async_trait]
pub trait KeyBackend: Send + Sync + Any {
    /// Short name for logs (`memory`, `file`, `sqlite`).
    fn kind(&self) -> &'static str;

    /// Fetch the record for `username`, if any.
    async fn get(&self, username: &str) -> Result<Option<StoredKeyPair>, KeyStoreError>;

    /// Persist `record` unless a record for the same username exists.
    async fn create_if_absent(
        &self,
        record: &StoredKeyPair,
    ) -> Result<CreateOutcome, KeyStoreError>;

    async fn exists(&self, username: &str) -> Result<bool, KeyStoreError> {
        Ok(self.get(username).await?.is_some())
    }

    /// All records, sorted by username.
    async fn list(&self) -> Result<Vec<StoredKeyPair>, KeyStoreError>;

    /// Verify that the backing store is reachable and writable.
    async fn check(&self) -> Result<(), KeyStoreError> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any;
}

/// Reject usernames that could escape a storage namespace.
///
/// Registry validation already guarantees this for normal runs; backends
/// check again because they may be driven directly.
pub(crate) fn validate_record_key(username: &str) -> Result<(), KeyStoreError> {
    if crate::registry::is_valid_username(username) {
        Ok(())
    } else {
        Err(KeyStoreError::InvalidUsername {
            username: username.to_string(),
        })
    }
}
