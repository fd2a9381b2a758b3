//! Core data types for the key store

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::secret::SecretString;

/// The current record format version.
const RECORD_VERSION: u8 = 1;

fn record_version() -> u8 {
    RECORD_VERSION
}

/// Validates the record version during deserialization.
fn validate_record_version<'de, D>(deserializer: D) -> std::result::Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let version = u8::deserialize(deserializer)?;
    if version != RECORD_VERSION {
        return Err(serde::de::Error::custom(format!(
            "unsupported key record version {version}; only version {RECORD_VERSION} is supported"
        )));
    }
    Ok(version)
}

/// Asymmetric key algorithm used for new keypairs.
///
/// Existing keypairs keep whatever algorithm they were created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    /// RSA with a 4096-bit modulus.
    #[default]
    #[serde(rename = "rsa-4096")]
    Rsa4096,
    /// Ed25519, equivalent strength with much faster generation.
    #[serde(rename = "ed25519")]
    Ed25519,
}

impl KeyAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyAlgorithm::Rsa4096 => "rsa-4096",
            KeyAlgorithm::Ed25519 => "ed25519",
        }
    }

    /// Human readable description used in notifications.
    pub fn description(&self) -> &'static str {
        match self {
            KeyAlgorithm::Rsa4096 => "RSA 4096-bit",
            KeyAlgorithm::Ed25519 => "Ed25519",
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user's keypair with the private half decrypted.
///
/// Only the key store constructs these. The private key is wrapped in a
/// [`SecretString`] so the struct can be logged with `{:?}` safely.
#[derive(Clone, Debug)]
pub struct KeyPair {
    pub username: String,
    pub algorithm: KeyAlgorithm,
    /// OpenSSH `authorized_keys` line (`<type> <base64> <comment>`).
    pub public_key: String,
    /// OpenSSH private key PEM.
    pub private_key: SecretString,
    /// `SHA256:` fingerprint of the public key.
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
}

impl KeyPair {
    /// The `<type> <base64>` portion of the public key, without comment.
    ///
    /// Used to detect an already-installed key regardless of its comment.
    pub fn key_material(&self) -> String {
        key_material(&self.public_key)
    }

    /// Metadata view without the private half.
    pub fn summary(&self) -> KeySummary {
        KeySummary {
            username: self.username.clone(),
            algorithm: self.algorithm,
            fingerprint: self.fingerprint.clone(),
            created_at: self.created_at,
        }
    }
}

/// Extract `<type> <base64>` from an OpenSSH public key line, normalized to a
/// single space.
pub fn key_material(public_key: &str) -> String {
    public_key
        .split_whitespace()
        .take(2)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Result of [`KeyStore::resolve`](super::KeyStore::resolve).
#[derive(Clone, Debug)]
pub struct Resolved {
    pub keypair: KeyPair,
    /// True only when this call created the keypair.
    pub created: bool,
}

/// Public key metadata, safe to print.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySummary {
    pub username: String,
    pub algorithm: KeyAlgorithm,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
}

/// Encryption parameters for a stored private key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEncryption {
    /// Argon2id salt (base64, 22 chars).
    pub salt: String,
    /// AES-256-GCM nonce (base64 of 12 bytes).
    pub nonce: String,
}

/// Persistent form of a keypair.
///
/// This is what backends read and write. The private key is AES-256-GCM
/// ciphertext; nothing in this struct is secret without the passphrase.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredKeyPair {
    #[serde(
        rename = "_v",
        default = "record_version",
        deserialize_with = "validate_record_version"
    )]
    pub version: u8,
    pub username: String,
    pub algorithm: KeyAlgorithm,
    pub public_key: String,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub encryption: KeyEncryption,
    /// Base64 ciphertext of the OpenSSH private key PEM.
    pub private_key: String,
}

impl StoredKeyPair {
    pub fn summary(&self) -> KeySummary {
        KeySummary {
            username: self.username.clone(),
            algorithm: self.algorithm,
            fingerprint: self.fingerprint.clone(),
            created_at: self.created_at,
        }
    }

    pub(crate) fn current_version() -> u8 {
        RECORD_VERSION
    }
}
