//! User registry
//!
//! Loads the declarative, desired-state list of users that should have SSH
//! access. The list is read fresh on every run and validated as a whole: one
//! malformed entry rejects the entire document, before any provisioning
//! begins.
//!
//! Accepted documents:
//!
//! ```json
//! { "users": [ { "username": "alice", "email": "alice@example.com", "full_name": "Alice" } ] }
//! ```
//!
//! ```toml
//! [[users]]
//! username = "alice"
//! email = "alice@example.com"
//! full_name = "Alice"
//! ```
//!
//! ```yaml
//! users:
//!   - username: alice
//!     email: alice@example.com
//!     full_name: Alice
//! ```

pub mod errors;

use std::{collections::HashSet, path::Path};

use serde::{Deserialize, Serialize};

pub use errors::RegistryError;

/// A user that should be able to log in to every provisioned instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Unique, stable login name. Also the local account name on hosts.
    pub username: String,
    /// Where first-time access notifications are delivered.
    pub email: String,
    /// Display name used in notifications.
    pub full_name: String,
}

impl User {
    pub fn new(
        username: impl Into<String>,
        email: impl Into<String>,
        full_name: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            email: email.into(),
            full_name: full_name.into(),
        }
    }
}

/// Entry as written in the input document; every field may be missing.
#[derive(Debug, Deserialize)]
struct RawUser {
    username: Option<String>,
    email: Option<String>,
    full_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserListDocument {
    #[serde(default)]
    users: Vec<RawUser>,
}

/// Validated, ordered list of users for a single run.
///
/// Input order is preserved so logs and reports are reproducible.
#[derive(Clone, Debug)]
pub struct UserRegistry {
    users: Vec<User>,
}

impl UserRegistry {
    /// Build a registry from already-constructed users, validating each one.
    pub fn new(users: Vec<User>) -> Result<Self, RegistryError> {
        if users.is_empty() {
            return Err(RegistryError::Empty);
        }

        let mut seen = HashSet::with_capacity(users.len());
        for user in &users {
            validate_user(user)?;
            if !seen.insert(user.username.as_str()) {
                return Err(RegistryError::DuplicateUsername {
                    username: user.username.clone(),
                });
            }
        }

        Ok(Self { users })
    }

    /// Load and validate a user list from a `.json`, `.toml`, `.yaml` or
    /// `.yml` file.
    #[tracing::instrument(name = "registry_load", skip_all, fields(path = %path.display()))]
    pub async fn load(path: &Path) -> Result<Self, RegistryError> {
        let contents =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|source| RegistryError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        let document: UserListDocument = match extension.as_str() {
            "json" => serde_json::from_str(&contents).map_err(|e| RegistryError::Parse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?,
            "toml" => toml::from_str(&contents).map_err(|e| RegistryError::Parse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?,
            "yaml" | "yml" => serde_yaml::from_str(&contents).map_err(|e| RegistryError::Parse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?,
            other => {
                return Err(RegistryError::UnsupportedFormat {
                    extension: other.to_string(),
                });
            }
        };

        let registry = Self::from_document(document)?;
        tracing::info!(users = registry.len(), "loaded user registry");
        Ok(registry)
    }

    /// Parse and validate a JSON user list.
    pub fn from_json_str(contents: &str) -> Result<Self, RegistryError> {
        let document: UserListDocument =
            serde_json::from_str(contents).map_err(|e| RegistryError::Parse {
                path: "<inline>".into(),
                reason: e.to_string(),
            })?;
        Self::from_document(document)
    }

    /// Parse and validate a TOML user list.
    pub fn from_toml_str(contents: &str) -> Result<Self, RegistryError> {
        let document: UserListDocument =
            toml::from_str(contents).map_err(|e| RegistryError::Parse {
                path: "<inline>".into(),
                reason: e.to_string(),
            })?;
        Self::from_document(document)
    }

    /// Parse and validate a YAML user list.
    pub fn from_yaml_str(contents: &str) -> Result<Self, RegistryError> {
        let document: UserListDocument =
            serde_yaml::from_str(contents).map_err(|e| RegistryError::Parse {
                path: "<inline>".into(),
                reason: e.to_string(),
            })?;
        Self::from_document(document)
    }

    fn from_document(document: UserListDocument) -> Result<Self, RegistryError> {
        let mut users = Vec::with_capacity(document.users.len());
        for (index, raw) in document.users.into_iter().enumerate() {
            let username = raw
                .username
                .map(|u| u.trim().to_string())
                .filter(|u| !u.is_empty())
                .ok_or(RegistryError::MissingUsername { index })?;
            let email = raw
                .email
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty())
                .ok_or_else(|| RegistryError::MissingEmail {
                    username: username.clone(),
                })?;
            let full_name = raw
                .full_name
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| username.clone());

            users.push(User {
                username,
                email,
                full_name,
            });
        }
        Self::new(users)
    }

    pub fn users(&self) -> &[User] {
        &self.users
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Look up a user by username.
    pub fn get(&self, username: &str) -> Option<&User> {
        self.users.iter().find(|u| u.username == username)
    }

    pub fn into_users(self) -> Vec<User> {
        self.users
    }
}

fn validate_user(user: &User) -> Result<(), RegistryError> {
    if !is_valid_username(&user.username) {
        return Err(RegistryError::InvalidUsername {
            username: user.username.clone(),
        });
    }
    if user.email.trim().is_empty() {
        return Err(RegistryError::MissingEmail {
            username: user.username.clone(),
        });
    }
    if !is_plausible_email(&user.email) {
        return Err(RegistryError::InvalidEmail {
            username: user.username.clone(),
            email: user.email.clone(),
        });
    }
    Ok(())
}

/// Check a username against the portable POSIX account name rules used by
/// `useradd`: `^[a-z_][a-z0-9_-]{0,31}$`.
///
/// Usernames end up in remote shell scripts and file paths, so this is
/// enforced before anything else happens.
pub fn is_valid_username(username: &str) -> bool {
    let bytes = username.as_bytes();
    if bytes.is_empty() || bytes.len() > 32 {
        return false;
    }
    let first_ok = matches!(bytes[0], b'a'..=b'z' | b'_');
    first_ok
        && bytes[1..]
            .iter()
            .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-'))
}

/// Minimal structural email check: one `@` with something on both sides and
/// no whitespace. Deliverability is the notifier's problem.
pub fn is_plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    }
}
