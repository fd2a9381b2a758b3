//! Key Store tests
//!
//! Persistence across store instances, at-rest encryption, and the
//! single-creation guarantee under concurrent callers.

use std::sync::Arc;

use keyfleet::keystore::{
    FileStore, KeyAlgorithm, KeyCipher, KeyStore, KeyStoreError, types::key_material,
};

use crate::helpers::*;

#[tokio::test]
async fn test_resolve_creates_then_reuses() {
    let (keystore, _dir) = test_keystore().await;

    let first = keystore.resolve("alice").await.unwrap();
    assert!(first.created);
    assert!(first.keypair.public_key.starts_with("ssh-ed25519 "));

    let second = keystore.resolve("alice").await.unwrap();
    assert!(!second.created);
    assert_eq!(first.keypair.fingerprint, second.keypair.fingerprint);
    assert_eq!(
        first.keypair.private_key.expose(),
        second.keypair.private_key.expose()
    );
}

#[tokio::test]
async fn test_concurrent_resolve_creates_exactly_once() {
    let (keystore, _dir) = test_keystore().await;
    let keystore = Arc::new(keystore);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let keystore = keystore.clone();
        handles.push(tokio::spawn(async move { keystore.resolve("bob").await }));
    }

    let mut created = 0;
    let mut fingerprints = Vec::new();
    for handle in handles {
        let resolved = handle.await.unwrap().unwrap();
        if resolved.created {
            created += 1;
        }
        fingerprints.push(resolved.keypair.fingerprint);
    }

    assert_eq!(created, 1);
    fingerprints.dedup();
    assert_eq!(fingerprints.len(), 1);
}

#[tokio::test]
async fn test_file_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();

    let original = {
        let store = keystore_over(Arc::new(FileStore::open(dir.path()).await.unwrap()));
        store.resolve("carol").await.unwrap()
    };
    assert!(original.created);

    let reopened = keystore_over(Arc::new(FileStore::open(dir.path()).await.unwrap()));
    let again = reopened.resolve("carol").await.unwrap();
    assert!(!again.created);
    assert_eq!(
        key_material(&again.keypair.public_key),
        key_material(&original.keypair.public_key)
    );
}

#[tokio::test]
async fn test_private_key_not_stored_in_plaintext() {
    let dir = tempfile::tempdir().unwrap();
    let store = keystore_over(Arc::new(FileStore::open(dir.path()).await.unwrap()));
    let resolved = store.resolve("dave").await.unwrap();

    let record = std::fs::read_to_string(dir.path().join("dave.key.json")).unwrap();
    assert!(!record.contains("OPENSSH PRIVATE KEY"));
    assert!(!record.contains(resolved.keypair.private_key.expose().trim()));
    assert!(record.contains(&resolved.keypair.fingerprint));

    let public = std::fs::read_to_string(dir.path().join("dave.pub")).unwrap();
    assert_eq!(public.trim(), resolved.keypair.public_key.trim());
}

#[tokio::test]
async fn test_key_committed_despite_public_file_failure_reports_created() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("alice.pub")).unwrap();
    let store = keystore_over(Arc::new(FileStore::open(dir.path()).await.unwrap()));

    // The creating call is the one that reports it, so the key gets delivered.
    let first = store.resolve("alice").await.unwrap();
    assert!(first.created);
    assert!(dir.path().join("alice.key.json").exists());

    let second = store.resolve("alice").await.unwrap();
    assert!(!second.created);
    assert_eq!(second.keypair.fingerprint, first.keypair.fingerprint);
}

#[tokio::test]
async fn test_wrong_passphrase_fails_to_open() {
    let dir = tempfile::tempdir().unwrap();
    let store = keystore_over(Arc::new(FileStore::open(dir.path()).await.unwrap()));
    store.resolve("erin").await.unwrap();

    let wrong = KeyStore::new(
        Arc::new(FileStore::open(dir.path()).await.unwrap()),
        KeyCipher::new("not the passphrase".into()).unwrap(),
    );
    let err = wrong.resolve("erin").await.unwrap_err();
    assert!(err.is_crypto_error());

    // A failed open never replaces the stored key.
    let again = store.resolve("erin").await.unwrap();
    assert!(!again.created);
}

#[tokio::test]
async fn test_peek_never_creates() {
    let (keystore, _dir) = test_keystore().await;
    assert!(keystore.peek("frank").await.unwrap().is_none());
    assert!(keystore.list().await.unwrap().is_empty());

    keystore.resolve("frank").await.unwrap();
    assert!(keystore.peek("frank").await.unwrap().is_some());
}

#[tokio::test]
async fn test_list_has_no_secrets_and_is_sorted() {
    let (keystore, _dir) = test_keystore().await;
    keystore.resolve("zed").await.unwrap();
    keystore.resolve("amy").await.unwrap();

    let keys = keystore.list().await.unwrap();
    let names: Vec<_> = keys.iter().map(|k| k.username.as_str()).collect();
    assert_eq!(names, ["amy", "zed"]);
    assert!(keys.iter().all(|k| k.algorithm == KeyAlgorithm::Ed25519));

    let json = serde_json::to_string(&keys).unwrap();
    assert!(!json.contains("PRIVATE"));
}

#[tokio::test]
async fn test_invalid_username_rejected_by_backend() {
    let (keystore, _dir) = test_keystore().await;
    let err = keystore.resolve("../etc/passwd").await.unwrap_err();
    assert!(matches!(err, KeyStoreError::InvalidUsername { .. }));
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_sqlite_store_survives_reopen() {
    use keyfleet::keystore::SqliteStore;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keys.db");

    let original = {
        let store = keystore_over(Arc::new(SqliteStore::open(&path).await.unwrap()));
        store.resolve("gina").await.unwrap()
    };

    let reopened = keystore_over(Arc::new(SqliteStore::open(&path).await.unwrap()));
    let again = reopened.resolve("gina").await.unwrap();
    assert!(!again.created);
    assert_eq!(again.keypair.fingerprint, original.keypair.fingerprint);
}
