//! User list loading tests

use std::io::Write;

use keyfleet::{UserRegistry, registry::RegistryError};

fn write_file(dir: &tempfile::TempDir, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    path
}

#[tokio::test]
async fn test_load_json_preserves_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(
        &dir,
        "users.json",
        r#"{"users": [
            {"username": "zoe", "email": "zoe@example.com", "full_name": "Zoe Z"},
            {"username": "adam", "email": "adam@example.com"}
        ]}"#,
    );

    let registry = UserRegistry::load(&path).await.unwrap();
    let names: Vec<_> = registry.users().iter().map(|u| u.username.as_str()).collect();
    assert_eq!(names, ["zoe", "adam"]);
    assert_eq!(registry.get("adam").unwrap().full_name, "adam");
}

#[tokio::test]
async fn test_load_toml() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(
        &dir,
        "users.toml",
        r#"
[[users]]
username = "alice"
email = "alice@example.com"
full_name = "Alice Doe"
"#,
    );

    let registry = UserRegistry::load(&path).await.unwrap();
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.users()[0].full_name, "Alice Doe");
}

#[tokio::test]
async fn test_load_yaml_both_extensions() {
    let dir = tempfile::tempdir().unwrap();
    let contents = r#"
users:
  - username: alice
    email: alice@example.com
    full_name: Alice Doe
  - username: bob
    email: bob@example.com
"#;

    for name in ["users.yaml", "users.YML"] {
        let path = write_file(&dir, name, contents);
        let registry = UserRegistry::load(&path).await.unwrap();
        let names: Vec<_> = registry.users().iter().map(|u| u.username.as_str()).collect();
        assert_eq!(names, ["alice", "bob"]);
        assert_eq!(registry.get("alice").unwrap().full_name, "Alice Doe");
        assert_eq!(registry.get("bob").unwrap().full_name, "bob");
    }
}

#[tokio::test]
async fn test_malformed_yaml_is_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(&dir, "users.yaml", "users:\n  - username: [alice\n");
    let err = UserRegistry::load(&path).await.unwrap_err();
    assert!(matches!(err, RegistryError::Parse { .. }));
    assert!(err.is_input_error());
}

#[tokio::test]
async fn test_invalid_entries_abort_whole_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(
        &dir,
        "users.json",
        r#"{"users": [
            {"username": "alice", "email": "alice@example.com"},
            {"username": "bob", "email": "not-an-email"}
        ]}"#,
    );

    let err = UserRegistry::load(&path).await.unwrap_err();
    assert!(matches!(err, RegistryError::InvalidEmail { .. }));
    assert_eq!(err.username(), Some("bob"));
}

#[tokio::test]
async fn test_duplicate_usernames_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(
        &dir,
        "users.json",
        r#"{"users": [
            {"username": "alice", "email": "a1@example.com"},
            {"username": "alice", "email": "a2@example.com"}
        ]}"#,
    );

    let err = UserRegistry::load(&path).await.unwrap_err();
    assert!(matches!(err, RegistryError::DuplicateUsername { .. }));
}

#[tokio::test]
async fn test_unsupported_extension_and_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(&dir, "users.csv", "username,email\nalice,alice@example.com\n");
    let err = UserRegistry::load(&path).await.unwrap_err();
    assert!(matches!(err, RegistryError::UnsupportedFormat { .. }));
    assert!(err.is_input_error());

    let err = UserRegistry::load(&dir.path().join("missing.json"))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Read { .. }));
}

#[test]
fn test_registry_error_is_fatal_config_error() {
    let err: keyfleet::Error = RegistryError::Empty.into();
    assert!(err.is_fatal());
    assert!(err.is_config_error());
    assert_eq!(err.module(), "registry");
}
