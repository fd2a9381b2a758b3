//! Cryptographic functions for the key store
//!
//! Provides keypair generation and at-rest encryption using:
//! - `ssh-key` for RSA / Ed25519 keypairs in OpenSSH encoding
//! - Argon2id for deriving a record key from the store passphrase
//! - AES-256-GCM for encrypting the private half

use aes_gcm::{
    Aes256Gcm, KeyInit, Nonce,
    aead::{Aead, AeadCore, OsRng},
};
use argon2::{
    Argon2,
    password_hash::{SaltString, rand_core},
};
use base64ct::{Base64, Encoding};
use ssh_key::{
    HashAlg, LineEnding, PrivateKey, PublicKey,
    private::{Ed25519Keypair, KeypairData, RsaKeypair},
};
use zeroize::{Zeroize, Zeroizing};

use super::{
    errors::KeyStoreError,
    types::{KeyAlgorithm, KeyEncryption},
};
use crate::secret::SecretString;

/// Salt string length for Argon2 (base64 encoded, 22 chars)
pub const SALT_LENGTH: usize = 22;

/// Nonce length for AES-GCM (12 bytes standard)
pub const NONCE_LENGTH: usize = 12;

/// Derived key length for AES-256 (32 bytes)
pub const KEY_LENGTH: usize = 32;

/// RSA modulus size for new RSA keypairs.
pub const RSA_BITS: usize = 4096;

/// Freshly generated keypair in OpenSSH encoding.
#[derive(Debug)]
pub struct GeneratedKey {
    /// `authorized_keys` line including the comment.
    pub public_key: String,
    pub private_key: SecretString,
    pub fingerprint: String,
}

/// Generate a new keypair for `algorithm`.
///
/// RSA 4096 generation takes noticeable CPU time; call this from a blocking
/// task.
pub fn generate_keypair(
    algorithm: KeyAlgorithm,
    comment: &str,
) -> Result<GeneratedKey, KeyStoreError> {
    let mut rng = rand::rngs::OsRng;
    let data = match algorithm {
        KeyAlgorithm::Rsa4096 => {
            let keypair = RsaKeypair::random(&mut rng, RSA_BITS).map_err(|e| {
                KeyStoreError::KeyGeneration {
                    reason: format!("RSA generation failed: {e}"),
                }
            })?;
            KeypairData::from(keypair)
        }
        KeyAlgorithm::Ed25519 => KeypairData::from(Ed25519Keypair::random(&mut rng)),
    };

    let private = PrivateKey::new(data, comment).map_err(|e| KeyStoreError::KeyGeneration {
        reason: e.to_string(),
    })?;

    let public_key =
        private
            .public_key()
            .to_openssh()
            .map_err(|e| KeyStoreError::KeyGeneration {
                reason: format!("Public key encoding failed: {e}"),
            })?;
    let private_pem =
        private
            .to_openssh(LineEnding::LF)
            .map_err(|e| KeyStoreError::KeyGeneration {
                reason: format!("Private key encoding failed: {e}"),
            })?;

    Ok(GeneratedKey {
        public_key,
        private_key: SecretString::new(private_pem.to_string()),
        fingerprint: private.public_key().fingerprint(HashAlg::Sha256).to_string(),
    })
}

/// Check that a decrypted private key belongs to the stored public key.
pub fn verify_pair(
    username: &str,
    public_key: &str,
    private_key: &SecretString,
) -> Result<(), KeyStoreError> {
    let public = PublicKey::from_openssh(public_key).map_err(|e| KeyStoreError::Corrupt {
        username: username.to_string(),
        reason: format!("unparseable public key: {e}"),
    })?;
    let private =
        PrivateKey::from_openssh(private_key.expose()).map_err(|e| KeyStoreError::Corrupt {
            username: username.to_string(),
            reason: format!("unparseable private key: {e}"),
        })?;

    if private.public_key().key_data() != public.key_data() {
        return Err(KeyStoreError::Corrupt {
            username: username.to_string(),
            reason: "private key does not match stored public key".to_string(),
        });
    }
    Ok(())
}

/// Derive an encryption key from a passphrase and salt using Argon2id
///
/// # Arguments
/// * `passphrase` - The store passphrase
/// * `salt` - The salt string (base64 encoded, 22 chars)
///
/// # Returns
/// A 32-byte encryption key suitable for AES-256
pub fn derive_encryption_key(
    passphrase: &SecretString,
    salt: &str,
) -> Result<Zeroizing<Vec<u8>>, KeyStoreError> {
    if salt.len() != SALT_LENGTH {
        return Err(KeyStoreError::InvalidSaltLength {
            expected: SALT_LENGTH,
            actual: salt.len(),
        });
    }

    let salt = SaltString::from_b64(salt).map_err(|e| KeyStoreError::EncryptionFailed {
        reason: format!("Invalid salt format: {e}"),
    })?;

    let mut key = Zeroizing::new(vec![0u8; KEY_LENGTH]);
    Argon2::default()
        .hash_password_into(
            passphrase.expose().as_bytes(),
            salt.as_str().as_bytes(),
            &mut key,
        )
        .map_err(|e| KeyStoreError::EncryptionFailed {
            reason: format!("Key derivation failed: {e}"),
        })?;

    Ok(key)
}

/// Encrypt `plaintext` with a 32-byte key, returning `(ciphertext, nonce)`.
pub fn encrypt(
    plaintext: &[u8],
    encryption_key: &[u8],
) -> Result<(Vec<u8>, Vec<u8>), KeyStoreError> {
    if encryption_key.len() != KEY_LENGTH {
        return Err(KeyStoreError::EncryptionFailed {
            reason: format!(
                "Invalid key length: expected {}, got {}",
                KEY_LENGTH,
                encryption_key.len()
            ),
        });
    }

    let cipher =
        Aes256Gcm::new_from_slice(encryption_key).map_err(|e| KeyStoreError::EncryptionFailed {
            reason: format!("Failed to create cipher: {e}"),
        })?;

    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext =
        cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| KeyStoreError::EncryptionFailed {
                reason: format!("Encryption failed: {e}"),
            })?;

    Ok((ciphertext, nonce.to_vec()))
}

/// Decrypt `ciphertext` produced by [`encrypt`].
pub fn decrypt(
    ciphertext: &[u8],
    nonce: &[u8],
    encryption_key: &[u8],
) -> Result<Zeroizing<Vec<u8>>, KeyStoreError> {
    if encryption_key.len() != KEY_LENGTH {
        return Err(KeyStoreError::DecryptionFailed {
            reason: format!(
                "Invalid key length: expected {}, got {}",
                KEY_LENGTH,
                encryption_key.len()
            ),
        });
    }

    if nonce.len() != NONCE_LENGTH {
        return Err(KeyStoreError::InvalidNonceLength {
            expected: NONCE_LENGTH,
            actual: nonce.len(),
        });
    }

    let cipher =
        Aes256Gcm::new_from_slice(encryption_key).map_err(|e| KeyStoreError::DecryptionFailed {
            reason: format!("Failed to create cipher: {e}"),
        })?;

    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| KeyStoreError::DecryptionFailed {
            reason: "authentication tag mismatch (wrong passphrase?)".to_string(),
        })?;

    Ok(Zeroizing::new(plaintext))
}

/// Seals and opens private keys with the store passphrase.
///
/// Each sealed record gets its own salt and nonce.
#[derive(Clone, Debug)]
pub struct KeyCipher {
    passphrase: SecretString,
}

impl KeyCipher {
    pub fn new(passphrase: SecretString) -> Result<Self, KeyStoreError> {
        if passphrase.is_empty() {
            return Err(KeyStoreError::MissingPassphrase);
        }
        Ok(Self { passphrase })
    }

    /// Encrypt a private key, returning its encryption parameters and the
    /// base64 ciphertext.
    pub fn seal(&self, private_key: &SecretString) -> Result<(KeyEncryption, String), KeyStoreError> {
        let salt = SaltString::generate(&mut rand_core::OsRng);
        let key = derive_encryption_key(&self.passphrase, salt.as_str())?;
        let (ciphertext, nonce) = encrypt(private_key.expose().as_bytes(), &key)?;

        Ok((
            KeyEncryption {
                salt: salt.as_str().to_string(),
                nonce: Base64::encode_string(&nonce),
            },
            Base64::encode_string(&ciphertext),
        ))
    }

    /// Decrypt a sealed private key.
    pub fn open(
        &self,
        encryption: &KeyEncryption,
        ciphertext: &str,
    ) -> Result<SecretString, KeyStoreError> {
        let nonce =
            Base64::decode_vec(&encryption.nonce).map_err(|e| KeyStoreError::DecryptionFailed {
                reason: format!("Invalid nonce encoding: {e}"),
            })?;
        let ciphertext =
            Base64::decode_vec(ciphertext).map_err(|e| KeyStoreError::DecryptionFailed {
                reason: format!("Invalid ciphertext encoding: {e}"),
            })?;

        let key = derive_encryption_key(&self.passphrase, &encryption.salt)?;
        let mut plaintext = decrypt(&ciphertext, &nonce, &key)?;

        let text = String::from_utf8(std::mem::take(&mut *plaintext)).map_err(|e| {
            let mut bytes = e.into_bytes();
            bytes.zeroize();
            KeyStoreError::DecryptionFailed {
                reason: "decrypted key is not valid UTF-8".to_string(),
            }
        })?;
        Ok(SecretString::new(text))
    }
}
