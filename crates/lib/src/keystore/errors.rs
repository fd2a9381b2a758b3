//! Key store error types.

use thiserror::Error;

/// Errors that can occur during key store operations.
///
/// Every variant is fatal for a provisioning run: without key material
/// nothing can be installed.
///
/// # Stability
///
/// - New variants may be added in minor versions (enum is `#[non_exhaustive]`)
/// - Helper methods like `is_*()` provide stable APIs
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum KeyStoreError {
    /// Backing store cannot be reached or opened.
    #[error("Key store unavailable: {reason}")]
    Unavailable { reason: String },

    /// A backend operation exceeded its timeout.
    #[error("Key store operation '{operation}' timed out")]
    Timeout { operation: &'static str },

    /// Another writer created the record first, but it could not be read back.
    #[error("Key for '{username}' was created concurrently and is not readable")]
    Conflict { username: String },

    /// No key is stored for the user.
    #[error("No key stored for '{username}'")]
    NotFound { username: String },

    /// Username is not usable as a store key.
    #[error("Invalid username for key store: {username}")]
    InvalidUsername { username: String },

    /// Stored record is unreadable or inconsistent.
    #[error("Corrupt key record for '{username}': {reason}")]
    Corrupt { username: String, reason: String },

    /// Keypair generation failed.
    #[error("Key generation failed: {reason}")]
    KeyGeneration { reason: String },

    #[error("Encryption failed: {reason}")]
    EncryptionFailed { reason: String },

    /// Usually a wrong passphrase.
    #[error("Decryption failed: {reason}")]
    DecryptionFailed { reason: String },

    #[error("Invalid salt length: expected {expected}, got {actual}")]
    InvalidSaltLength { expected: usize, actual: usize },

    #[error("Invalid nonce length: expected {expected}, got {actual}")]
    InvalidNonceLength { expected: usize, actual: usize },

    #[error("Key store passphrase is empty")]
    MissingPassphrase,

    /// File I/O error.
    #[error("Key store I/O error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization failed")]
    SerializationFailed {
        #[source]
        source: serde_json::Error,
    },

    #[error("Deserialization failed for '{username}'")]
    DeserializationFailed {
        username: String,
        #[source]
        source: serde_json::Error,
    },

    /// SQL backend error.
    #[cfg(feature = "sqlite")]
    #[error("SQL error: {reason}")]
    Sql {
        reason: String,
        #[source]
        source: Option<sqlx::Error>,
    },
}

impl KeyStoreError {
    /// Check if this error is a lost creation race whose winner is missing.
    pub fn is_conflict(&self) -> bool {
        matches!(self, KeyStoreError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, KeyStoreError::NotFound { .. })
    }

    /// Check if the backing store could not be reached.
    pub fn is_unavailable(&self) -> bool {
        match self {
            KeyStoreError::Unavailable { .. }
            | KeyStoreError::Timeout { .. }
            | KeyStoreError::Io { .. } => true,
            #[cfg(feature = "sqlite")]
            KeyStoreError::Sql { .. } => true,
            _ => false,
        }
    }

    /// Check if this error is a cryptographic failure.
    pub fn is_crypto_error(&self) -> bool {
        matches!(
            self,
            KeyStoreError::KeyGeneration { .. }
                | KeyStoreError::EncryptionFailed { .. }
                | KeyStoreError::DecryptionFailed { .. }
                | KeyStoreError::InvalidSaltLength { .. }
                | KeyStoreError::InvalidNonceLength { .. }
                | KeyStoreError::MissingPassphrase
        )
    }

    /// Check if a stored record could not be trusted.
    pub fn is_integrity_error(&self) -> bool {
        matches!(
            self,
            KeyStoreError::Corrupt { .. } | KeyStoreError::DeserializationFailed { .. }
        )
    }

    /// Get the username if this error is about a specific record.
    pub fn username(&self) -> Option<&str> {
        match self {
            KeyStoreError::Conflict { username }
            | KeyStoreError::NotFound { username }
            | KeyStoreError::InvalidUsername { username }
            | KeyStoreError::Corrupt { username, .. }
            | KeyStoreError::DeserializationFailed { username, .. } => Some(username),
            _ => None,
        }
    }
}

impl From<KeyStoreError> for crate::Error {
    fn from(err: KeyStoreError) -> Self {
        crate::Error::KeyStore(err)
    }
}
