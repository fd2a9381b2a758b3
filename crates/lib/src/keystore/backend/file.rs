//! Directory-backed key store.
//!
//! Layout, one pair of files per user:
//!
//! ```text
//! <dir>/alice.key.json   versioned StoredKeyPair record (mode 0600)
//! <dir>/alice.pub        OpenSSH public key line
//! ```
//!
//! A record is written to a temporary file in the same directory and then
//! linked into place with a no-clobber persist, so concurrent writers cannot
//! overwrite each other and readers never see a partial record. The `.pub`
//! file is a convenience artifact written after the record on a best-effort
//! basis; the record is the source of truth.

use std::{
    any::Any,
    io::Write,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use tempfile::NamedTempFile;

use super::{CreateOutcome, KeyBackend, validate_record_key};
use crate::keystore::{errors::KeyStoreError, types::StoredKeyPair};

const RECORD_SUFFIX: &str = ".key.json";
const PUBLIC_SUFFIX: &str = ".pub";

#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, KeyStoreError> {
        let store = Self { dir: dir.into() };
        let dir = store.dir.clone();
        blocking(move || ensure_dir(&dir)).await?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, username: &str) -> PathBuf {
        self.dir.join(format!("{username}{RECORD_SUFFIX}"))
    }

    fn public_path(&self, username: &str) -> PathBuf {
        self.dir.join(format!("{username}{PUBLIC_SUFFIX}"))
    }
}

#[async_trait]
impl KeyBackend for FileStore {
    fn kind(&self) -> &'static str {
        "file"
    }

    async fn get(&self, username: &str) -> Result<Option<StoredKeyPair>, KeyStoreError> {
        validate_record_key(username)?;
        let path = self.record_path(username);
        let username = username.to_string();
        blocking(move || read_record(&path, &username)).await
    }

    async fn create_if_absent(
        &self,
        record: &StoredKeyPair,
    ) -> Result<CreateOutcome, KeyStoreError> {
        validate_record_key(&record.username)?;

        let json = serde_json::to_vec_pretty(record)
            .map_err(|source| KeyStoreError::SerializationFailed { source })?;
        let dir = self.dir.clone();
        let record_path = self.record_path(&record.username);
        let public_path = self.public_path(&record.username);
        let public_key = format!("{}\n", record.public_key.trim_end());

        blocking(move || {
            let outcome = persist_new(&dir, &record_path, &json)?;
            if outcome == CreateOutcome::Created {
                // The record is committed; a missing .pub must not hide that.
                if let Err(err) = write_replace(&dir, &public_path, public_key.as_bytes()) {
                    tracing::warn!(
                        path = %public_path.display(),
                        error = %err,
                        "failed to write public key file"
                    );
                }
            }
            Ok(outcome)
        })
        .await
    }

    async fn list(&self) -> Result<Vec<StoredKeyPair>, KeyStoreError> {
        let dir = self.dir.clone();
        blocking(move || {
            let entries = std::fs::read_dir(&dir).map_err(|source| KeyStoreError::Io {
                context: format!("listing {}", dir.display()),
                source,
            })?;

            let mut records = Vec::new();
            for entry in entries {
                let entry = entry.map_err(|source| KeyStoreError::Io {
                    context: format!("listing {}", dir.display()),
                    source,
                })?;
                let file_name = entry.file_name();
                let Some(username) = file_name
                    .to_str()
                    .and_then(|name| name.strip_suffix(RECORD_SUFFIX))
                else {
                    continue;
                };
                if let Some(record) = read_record(&entry.path(), username)? {
                    records.push(record);
                }
            }
            records.sort_by(|a, b| a.username.cmp(&b.username));
            Ok(records)
        })
        .await
    }

    async fn check(&self) -> Result<(), KeyStoreError> {
        let dir = self.dir.clone();
        blocking(move || {
            ensure_dir(&dir)?;
            NamedTempFile::new_in(&dir)
                .map(drop)
                .map_err(|source| KeyStoreError::Io {
                    context: format!("{} is not writable", dir.display()),
                    source,
                })
        })
        .await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Run blocking filesystem work off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, KeyStoreError>
where
    F: FnOnce() -> Result<T, KeyStoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| KeyStoreError::Unavailable {
            reason: format!("file store task failed: {e}"),
        })?
}

fn ensure_dir(dir: &Path) -> Result<(), KeyStoreError> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir).map_err(|source| KeyStoreError::Io {
        context: format!("creating key store directory {}", dir.display()),
        source,
    })
}

fn read_record(path: &Path, username: &str) -> Result<Option<StoredKeyPair>, KeyStoreError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(KeyStoreError::Io {
                context: format!("reading {}", path.display()),
                source,
            });
        }
    };

    let record: StoredKeyPair =
        serde_json::from_slice(&bytes).map_err(|source| KeyStoreError::DeserializationFailed {
            username: username.to_string(),
            source,
        })?;

    if record.username != username {
        return Err(KeyStoreError::Corrupt {
            username: username.to_string(),
            reason: format!("record belongs to '{}'", record.username),
        });
    }
    Ok(Some(record))
}

/// Write `contents` to `target` only if it does not exist yet.
fn persist_new(dir: &Path, target: &Path, contents: &[u8]) -> Result<CreateOutcome, KeyStoreError> {
    // NamedTempFile is created with mode 0600 on unix.
    let mut tmp = NamedTempFile::new_in(dir).map_err(|source| KeyStoreError::Io {
        context: format!("creating temp file in {}", dir.display()),
        source,
    })?;
    tmp.write_all(contents)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|source| KeyStoreError::Io {
            context: format!("writing {}", target.display()),
            source,
        })?;

    match tmp.persist_noclobber(target) {
        Ok(_) => Ok(CreateOutcome::Created),
        Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
            Ok(CreateOutcome::AlreadyExists)
        }
        Err(e) => Err(KeyStoreError::Io {
            context: format!("persisting {}", target.display()),
            source: e.error,
        }),
    }
}

fn write_replace(dir: &Path, target: &Path, contents: &[u8]) -> Result<(), KeyStoreError> {
    let mut tmp = NamedTempFile::new_in(dir).map_err(|source| KeyStoreError::Io {
        context: format!("creating temp file in {}", dir.display()),
        source,
    })?;
    tmp.write_all(contents).map_err(|source| KeyStoreError::Io {
        context: format!("writing {}", target.display()),
        source,
    })?;
    tmp.persist(target).map_err(|e| KeyStoreError::Io {
        context: format!("persisting {}", target.display()),
        source: e.error,
    })?;
    Ok(())
}
