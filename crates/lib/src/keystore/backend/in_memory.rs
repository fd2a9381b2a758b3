//! In-memory key backend.
//!
//! Nothing survives the process. Used by tests and dry experiments.

use std::{any::Any, collections::HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{CreateOutcome, KeyBackend, validate_record_key};
use crate::keystore::{errors::KeyStoreError, types::StoredKeyPair};

#[derive(Debug, Default)]
pub struct InMemory {
    records: RwLock<HashMap<String, StoredKeyPair>>,
}

impl InMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl KeyBackend for InMemory {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, username: &str) -> Result<Option<StoredKeyPair>, KeyStoreError> {
        Ok(self.records.read().await.get(username).cloned())
    }

    async fn create_if_absent(
        &self,
        record: &StoredKeyPair,
    ) -> Result<CreateOutcome, KeyStoreError> {
        validate_record_key(&record.username)?;

        let mut records = self.records.write().await;
        if records.contains_key(&record.username) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        records.insert(record.username.clone(), record.clone());
        Ok(CreateOutcome::Created)
    }

    async fn list(&self) -> Result<Vec<StoredKeyPair>, KeyStoreError> {
        let mut records: Vec<_> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(records)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
