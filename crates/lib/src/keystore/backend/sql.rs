//! SQLite key backend.
//!
//! Records live in a single `keypairs` table keyed by username. Creation uses
//! `INSERT ... ON CONFLICT DO NOTHING`; the affected row count decides which
//! writer won.

use std::{any::Any, path::Path};

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use super::{CreateOutcome, KeyBackend, validate_record_key};
use crate::keystore::{errors::KeyStoreError, types::StoredKeyPair};

/// Current schema version.
///
/// Increment this when making schema changes that require migration.
pub const SCHEMA_VERSION: i64 = 1;

const CREATE_TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS schema_version (
        version BIGINT PRIMARY KEY
    )",
    // record_json holds the full versioned StoredKeyPair, private key encrypted
    "CREATE TABLE IF NOT EXISTS keypairs (
        username TEXT PRIMARY KEY NOT NULL,
        public_key TEXT NOT NULL,
        fingerprint TEXT NOT NULL,
        created_at TEXT NOT NULL,
        record_json TEXT NOT NULL
    )",
];

/// Extension trait for converting sqlx errors with context.
pub(crate) trait SqlxResultExt<T> {
    fn sql_context(self, context: &str) -> Result<T, KeyStoreError>;
}

impl<T> SqlxResultExt<T> for std::result::Result<T, sqlx::Error> {
    fn sql_context(self, context: &str) -> Result<T, KeyStoreError> {
        self.map_err(|e| KeyStoreError::Sql {
            reason: format!("{context}: {e}"),
            source: Some(e),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open a SQLite database at the given path, creating it if needed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, KeyStoreError> {
        // mode=rwc: read-write-create
        let url = format!("sqlite:{}?mode=rwc", path.as_ref().display());
        Self::connect(&url).await
    }

    /// Open an existing database for reading only.
    ///
    /// Nothing is created: a missing file or an uninitialized database is an
    /// error, and every write through the returned store fails.
    pub async fn open_read_only(path: impl AsRef<Path>) -> Result<Self, KeyStoreError> {
        let url = format!("sqlite:{}?mode=ro", path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .sql_context("Failed to open SQLite database read-only")?;
        sqlx::query("PRAGMA busy_timeout = 5000;")
            .execute(&pool)
            .await
            .sql_context("Failed to configure SQLite")?;

        let store = Self { pool };
        store.check_schema_version(false).await?;
        Ok(store)
    }

    /// Connect using a SQLite URL (e.g. `sqlite:./keys.db`).
    pub async fn connect(url: &str) -> Result<Self, KeyStoreError> {
        let is_in_memory = url.contains("mode=memory") || url.contains(":memory:");

        // A private in-memory database disappears with its last connection,
        // so keep exactly one and never recycle it.
        let pool = if is_in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect(url)
                .await
                .sql_context("Failed to connect to SQLite")?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect(url)
                .await
                .sql_context("Failed to connect to SQLite")?
        };

        if is_in_memory {
            sqlx::query("PRAGMA busy_timeout = 5000;")
                .execute(&pool)
                .await
                .sql_context("Failed to configure SQLite")?;
        } else {
            // - journal_mode=WAL: Write-Ahead Logging for better concurrency
            // - synchronous=NORMAL: Balanced durability (safe with WAL)
            // - busy_timeout=5000: Wait up to 5s for locks before failing
            sqlx::query(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;",
            )
            .execute(&pool)
            .await
            .sql_context("Failed to configure SQLite")?;
        }

        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    /// Create a private in-memory database.
    pub async fn in_memory() -> Result<Self, KeyStoreError> {
        Self::connect("sqlite::memory:").await
    }

    async fn initialize(&self) -> Result<(), KeyStoreError> {
        for statement in CREATE_TABLES {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .sql_context("Schema creation failed")?;
        }
        self.check_schema_version(true).await
    }

    /// Compare the stored schema version with [`SCHEMA_VERSION`], recording
    /// it first on a fresh database when `record_missing` is set.
    async fn check_schema_version(&self, record_missing: bool) -> Result<(), KeyStoreError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT version FROM schema_version")
            .fetch_optional(&self.pool)
            .await
            .sql_context("Failed to check schema version")?;

        match row {
            None if !record_missing => {
                return Err(KeyStoreError::Unavailable {
                    reason: "key database has no schema version".to_string(),
                });
            }
            None => {
                sqlx::query("INSERT INTO schema_version (version) VALUES ($1)")
                    .bind(SCHEMA_VERSION)
                    .execute(&self.pool)
                    .await
                    .sql_context("Failed to initialize schema version")?;
            }
            Some((version,)) if version > SCHEMA_VERSION => {
                return Err(KeyStoreError::Unavailable {
                    reason: format!(
                        "key database schema version {version} is newer than supported version {SCHEMA_VERSION}"
                    ),
                });
            }
            Some(_) => {}
        }
        Ok(())
    }

    fn decode(username: &str, json: &str) -> Result<StoredKeyPair, KeyStoreError> {
        serde_json::from_str(json).map_err(|source| KeyStoreError::DeserializationFailed {
            username: username.to_string(),
            source,
        })
    }
}

#[async_trait]
impl KeyBackend for SqliteStore {
    fn kind(&self) -> &'static str {
        "sqlite"
    }

    async fn get(&self, username: &str) -> Result<Option<StoredKeyPair>, KeyStoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT record_json FROM keypairs WHERE username = $1")
                .bind(username)
                .fetch_optional(&self.pool)
                .await
                .sql_context("Failed to get keypair")?;

        row.map(|(json,)| Self::decode(username, &json)).transpose()
    }

    async fn create_if_absent(
        &self,
        record: &StoredKeyPair,
    ) -> Result<CreateOutcome, KeyStoreError> {
        validate_record_key(&record.username)?;
        let json = serde_json::to_string(record)
            .map_err(|source| KeyStoreError::SerializationFailed { source })?;

        let result = sqlx::query(
            "INSERT INTO keypairs (username, public_key, fingerprint, created_at, record_json)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (username) DO NOTHING",
        )
        .bind(&record.username)
        .bind(&record.public_key)
        .bind(&record.fingerprint)
        .bind(record.created_at.to_rfc3339())
        .bind(json)
        .execute(&self.pool)
        .await
        .sql_context("Failed to insert keypair")?;

        Ok(if result.rows_affected() == 1 {
            CreateOutcome::Created
        } else {
            CreateOutcome::AlreadyExists
        })
    }

    async fn list(&self) -> Result<Vec<StoredKeyPair>, KeyStoreError> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT username, record_json FROM keypairs ORDER BY username")
                .fetch_all(&self.pool)
                .await
                .sql_context("Failed to list keypairs")?;

        rows.iter()
            .map(|(username, json)| Self::decode(username, json))
            .collect()
    }

    async fn check(&self) -> Result<(), KeyStoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .sql_context("Key database is not reachable")?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
