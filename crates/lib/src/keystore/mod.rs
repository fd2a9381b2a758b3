//! Key store
//!
//! Durable mapping from username to keypair with get-or-create semantics.
//! A keypair is generated at most once per username and reused on every
//! later run; the store never regenerates or overwrites an existing key.
//!
//! Private halves are encrypted at rest by [`KeyCipher`] before they reach a
//! [`KeyBackend`]. Only [`KeyStore`] decrypts them.

pub mod backend;
pub mod crypto;
pub mod errors;
pub mod types;

use std::{fmt, sync::Arc, time::Duration};

pub use backend::{CreateOutcome, FileStore, InMemory, KeyBackend};
#[cfg(feature = "sqlite")]
pub use backend::SqliteStore;
pub use crypto::KeyCipher;
pub use errors::KeyStoreError;
pub use types::{KeyAlgorithm, KeyPair, KeySummary, Resolved, StoredKeyPair};

use crate::{
    clock::{Clock, SystemClock},
    secret::SecretString,
};

/// Default bound on a single backend call.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Front end over a [`KeyBackend`]: generation, encryption and the
/// create-if-absent protocol.
///
/// Cheap to clone; clones share the backend.
#[derive(Clone)]
pub struct KeyStore {
    backend: Arc<dyn KeyBackend>,
    cipher: KeyCipher,
    algorithm: KeyAlgorithm,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyStore")
            .field("backend", &self.backend.kind())
            .field("algorithm", &self.algorithm)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl KeyStore {
    pub fn new(backend: Arc<dyn KeyBackend>, cipher: KeyCipher) -> Self {
        Self {
            backend,
            cipher,
            algorithm: KeyAlgorithm::default(),
            clock: Arc::new(SystemClock),
            timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    /// Algorithm for keys created from now on.
    pub fn with_algorithm(mut self, algorithm: KeyAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Bound on each backend call (generation is not included).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn backend(&self) -> &Arc<dyn KeyBackend> {
        &self.backend
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    /// Return the user's keypair, creating it if none exists.
    ///
    /// `created` is true only for the call that actually persisted the key.
    /// When two callers race, the loser discards its generated key and
    /// returns the winner's.
    #[tracing::instrument(name = "key_resolve", skip(self), fields(backend = self.backend.kind()))]
    pub async fn resolve(&self, username: &str) -> Result<Resolved, KeyStoreError> {
        backend::validate_record_key(username)?;

        if let Some(stored) = self.timed("get", self.backend.get(username)).await? {
            tracing::debug!("reusing existing keypair");
            return Ok(Resolved {
                keypair: self.open(stored)?,
                created: false,
            });
        }

        let (record, keypair) = self.generate(username).await?;

        let outcome = match self
            .timed("create", self.backend.create_if_absent(&record))
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => self.recover_create(&record, err).await?,
        };

        match outcome {
            CreateOutcome::Created => {
                tracing::info!(
                    algorithm = %keypair.algorithm,
                    fingerprint = %keypair.fingerprint,
                    "created keypair"
                );
                Ok(Resolved {
                    keypair,
                    created: true,
                })
            }
            CreateOutcome::AlreadyExists => {
                tracing::debug!("lost creation race, re-reading stored keypair");
                drop(keypair);
                let stored = self
                    .timed("get", self.backend.get(username))
                    .await?
                    .ok_or_else(|| KeyStoreError::Conflict {
                        username: username.to_string(),
                    })?;
                Ok(Resolved {
                    keypair: self.open(stored)?,
                    created: false,
                })
            }
        }
    }

    /// Read-only lookup; never creates.
    pub async fn peek(&self, username: &str) -> Result<Option<KeyPair>, KeyStoreError> {
        backend::validate_record_key(username)?;
        self.timed("get", self.backend.get(username))
            .await?
            .map(|stored| self.open(stored))
            .transpose()
    }

    /// Metadata for every stored key, sorted by username.
    pub async fn list(&self) -> Result<Vec<KeySummary>, KeyStoreError> {
        Ok(self
            .timed("list", self.backend.list())
            .await?
            .iter()
            .map(StoredKeyPair::summary)
            .collect())
    }

    /// Verify the backend is reachable.
    pub async fn check(&self) -> Result<(), KeyStoreError> {
        self.timed("check", self.backend.check()).await
    }

    /// A create that errored (or timed out) may still have committed. If the
    /// stored record is the one this call generated, the key is ours and the
    /// caller must see it as created.
    async fn recover_create(
        &self,
        record: &StoredKeyPair,
        err: KeyStoreError,
    ) -> Result<CreateOutcome, KeyStoreError> {
        match self.timed("get", self.backend.get(&record.username)).await {
            Ok(Some(stored)) if stored.public_key == record.public_key => {
                tracing::warn!(error = %err, "create reported an error after committing the keypair");
                Ok(CreateOutcome::Created)
            }
            Ok(Some(_)) => Ok(CreateOutcome::AlreadyExists),
            _ => Err(err),
        }
    }

    async fn generate(&self, username: &str) -> Result<(StoredKeyPair, KeyPair), KeyStoreError> {
        let algorithm = self.algorithm;
        let cipher = self.cipher.clone();
        let comment = username.to_string();

        // RSA generation and Argon2 are CPU bound.
        let (generated, encryption, ciphertext) = tokio::task::spawn_blocking(move || {
            let generated = crypto::generate_keypair(algorithm, &comment)?;
            let (encryption, ciphertext) = cipher.seal(&generated.private_key)?;
            Ok::<_, KeyStoreError>((generated, encryption, ciphertext))
        })
        .await
        .map_err(|e| KeyStoreError::KeyGeneration {
            reason: format!("generation task failed: {e}"),
        })??;

        let created_at = self.clock.now();
        let record = StoredKeyPair {
            version: StoredKeyPair::current_version(),
            username: username.to_string(),
            algorithm,
            public_key: generated.public_key.clone(),
            fingerprint: generated.fingerprint.clone(),
            created_at,
            encryption,
            private_key: ciphertext,
        };
        let keypair = KeyPair {
            username: username.to_string(),
            algorithm,
            public_key: generated.public_key,
            private_key: generated.private_key,
            fingerprint: generated.fingerprint,
            created_at,
        };
        Ok((record, keypair))
    }

    fn open(&self, stored: StoredKeyPair) -> Result<KeyPair, KeyStoreError> {
        let private_key = self.cipher.open(&stored.encryption, &stored.private_key)?;
        crypto::verify_pair(&stored.username, &stored.public_key, &private_key)?;

        Ok(KeyPair {
            username: stored.username,
            algorithm: stored.algorithm,
            public_key: stored.public_key,
            private_key,
            fingerprint: stored.fingerprint,
            created_at: stored.created_at,
        })
    }

    async fn timed<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, KeyStoreError>>,
    ) -> Result<T, KeyStoreError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| KeyStoreError::Timeout { operation })?
    }
}

/// Convenience constructor for an in-memory store.
pub fn in_memory_store(passphrase: impl Into<SecretString>) -> Result<KeyStore, KeyStoreError> {
    Ok(KeyStore::new(
        Arc::new(InMemory::new()),
        KeyCipher::new(passphrase.into())?,
    ))
}
