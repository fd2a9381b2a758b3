//! Installer tests against a simulated fleet

use keyfleet::{
    User,
    report::{ErrorClass, OutcomeStatus},
};

use crate::helpers::*;

#[tokio::test]
async fn test_install_is_idempotent() {
    let (keystore, _dir) = test_keystore().await;
    let keypair = keystore.resolve("alice").await.unwrap().keypair;
    let user = User::new("alice", "alice@example.com", "Alice");
    let instance = tagged_instances(1).remove(0);
    let fleet = FakeFleet::new();
    let installer = fast_installer(fleet.clone());

    let first = installer.install(&user, &instance, &keypair).await;
    assert_eq!(first.status, OutcomeStatus::Installed);
    let mutations = fleet.mutations();
    assert_eq!(mutations, 2);

    let second = installer.install(&user, &instance, &keypair).await;
    assert_eq!(second.status, OutcomeStatus::AlreadyPresent);
    assert_eq!(fleet.mutations(), mutations);
    assert_eq!(fleet.authorized_keys(&instance.id, "alice").len(), 1);
}

#[tokio::test]
async fn test_existing_key_with_other_comment_not_duplicated() {
    let (keystore, _dir) = test_keystore().await;
    let keypair = keystore.resolve("bob").await.unwrap().keypair;
    let user = User::new("bob", "bob@example.com", "Bob");
    let instance = tagged_instances(1).remove(0);
    let fleet = FakeFleet::new();
    let installer = fast_installer(fleet.clone());

    installer.install(&user, &instance, &keypair).await;

    let mut recommented = keypair.clone();
    recommented.public_key = format!("{} bob@laptop", keypair.key_material());
    let outcome = installer.install(&user, &instance, &recommented).await;
    assert_eq!(outcome.status, OutcomeStatus::AlreadyPresent);
    assert_eq!(fleet.authorized_keys(&instance.id, "bob").len(), 1);
}

#[tokio::test]
async fn test_unreachable_instance_is_connectivity_failure() {
    let (keystore, _dir) = test_keystore().await;
    let keypair = keystore.resolve("carol").await.unwrap().keypair;
    let user = User::new("carol", "carol@example.com", "Carol");
    let instance = tagged_instances(1).remove(0);
    let fleet = FakeFleet::new();
    fleet.set_down(&instance.id, true);

    let outcome = fast_installer(fleet.clone())
        .install(&user, &instance, &keypair)
        .await;
    assert_eq!(outcome.status, OutcomeStatus::Failed);
    assert_eq!(outcome.error_class(), Some(ErrorClass::Connectivity));
    // Two connection attempts for the probe, nothing after it.
    assert_eq!(fleet.calls(), 2);
    assert_eq!(fleet.mutations(), 0);
}

#[tokio::test]
async fn test_rerun_after_recovery_converges() {
    let (keystore, _dir) = test_keystore().await;
    let keypair = keystore.resolve("dan").await.unwrap().keypair;
    let user = User::new("dan", "dan@example.com", "Dan");
    let instance = tagged_instances(1).remove(0);
    let fleet = FakeFleet::new();
    let installer = fast_installer(fleet.clone());

    fleet.set_down(&instance.id, true);
    let failed = installer.install(&user, &instance, &keypair).await;
    assert!(failed.is_failed());

    fleet.set_down(&instance.id, false);
    let recovered = installer.install(&user, &instance, &keypair).await;
    assert_eq!(recovered.status, OutcomeStatus::Installed);
    assert!(fleet.host(&instance.id).accounts.contains("dan"));
}
