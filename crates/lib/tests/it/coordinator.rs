//! Whole-run tests
//!
//! First run, idempotent rerun, partial failure isolation, notification
//! exclusivity, dry run, cancellation and key re-delivery.

use std::time::Duration;

use keyfleet::{
    KeyResend, RunOptions, User,
    instance::InstanceState,
    report::{
        EXIT_OK, EXIT_PARTIAL, ErrorClass, NotificationStatus, OutcomeStatus, PlanAction,
    },
};
use tokio_util::sync::CancellationToken;

use crate::helpers::*;

#[tokio::test]
async fn test_first_run_then_idempotent_rerun() {
    let (keystore, _dir) = test_keystore().await;
    let fleet = FakeFleet::new();
    let notifier = RecordingNotifier::new();
    let instances = tagged_instances(2);
    let registry = users(&["alice", "bob"]);

    let coordinator = coordinator(
        keystore,
        instances.clone(),
        fleet.clone(),
        notifier.clone(),
        RunOptions::default(),
    );

    // First run: every key created, every pair installed, everyone notified.
    let first = coordinator
        .run(&registry, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.exit_code(), EXIT_OK);
    assert_eq!(first.outcomes.len(), 4);
    assert!(
        first
            .outcomes
            .iter()
            .all(|o| o.status == OutcomeStatus::Installed)
    );
    assert!(first.keys.iter().all(|k| k.created));
    assert_eq!(notifier.delivered_to(), ["alice", "bob"]);

    let delivered = notifier.delivered();
    assert_eq!(delivered[0].subject, "SSH access for alice");
    assert_eq!(delivered[0].attachment_name, "alice_private_key");
    assert!(delivered[0].attachment.contains("OPENSSH PRIVATE KEY"));
    for instance in &instances {
        assert!(delivered[0].text_body.contains(&instance.address));
    }

    // Rerun: nothing changes on hosts, nobody is notified again.
    let mutations = fleet.mutations();
    let second = coordinator
        .run(&registry, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second.exit_code(), EXIT_OK);
    assert!(
        second
            .outcomes
            .iter()
            .all(|o| o.status == OutcomeStatus::AlreadyPresent)
    );
    assert!(second.keys.iter().all(|k| !k.created));
    assert!(second.notifications.is_empty());
    assert_eq!(fleet.mutations(), mutations);
    assert_eq!(notifier.delivered().len(), 2);

    for instance in &instances {
        assert_eq!(fleet.authorized_keys(&instance.id, "alice").len(), 1);
        assert_eq!(fleet.authorized_keys(&instance.id, "bob").len(), 1);
    }
}

#[tokio::test]
async fn test_new_user_added_later_is_only_one_notified() {
    let (keystore, _dir) = test_keystore().await;
    let fleet = FakeFleet::new();
    let notifier = RecordingNotifier::new();
    let coordinator = coordinator(
        keystore,
        tagged_instances(1),
        fleet,
        notifier.clone(),
        RunOptions::default(),
    );

    coordinator
        .run(&users(&["alice"]), CancellationToken::new())
        .await
        .unwrap();
    let report = coordinator
        .run(&users(&["alice", "bob"]), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.created_users().collect::<Vec<_>>(), ["bob"]);
    assert_eq!(notifier.delivered_to(), ["alice", "bob"]);
    let statuses: Vec<_> = report
        .outcomes
        .iter()
        .map(|o| (o.username.as_str(), o.status))
        .collect();
    assert_eq!(
        statuses,
        [
            ("alice", OutcomeStatus::AlreadyPresent),
            ("bob", OutcomeStatus::Installed)
        ]
    );
}

#[tokio::test]
async fn test_partial_failure_is_isolated_and_rerun_finishes() {
    let (keystore, _dir) = test_keystore().await;
    let fleet = FakeFleet::new();
    let notifier = RecordingNotifier::new();
    let instances = tagged_instances(3);
    let down = instances[1].id.clone();
    fleet.set_down(&down, true);

    let coordinator = coordinator(
        keystore,
        instances,
        fleet.clone(),
        notifier.clone(),
        RunOptions {
            concurrency: 2,
            ..RunOptions::default()
        },
    );
    let registry = users(&["alice", "bob"]);

    let report = coordinator
        .run(&registry, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.exit_code(), EXIT_PARTIAL);
    let counts = report.counts();
    assert_eq!(counts.failed, 2);
    assert_eq!(counts.installed, 4);
    assert!(report.failures().all(|o| o.instance_id == down
        && o.error_class() == Some(ErrorClass::Connectivity)));

    // New users are still notified, once, even though one host failed.
    assert_eq!(notifier.delivered_to(), ["alice", "bob"]);

    let summary = report.failure_summary();
    assert_eq!(summary["failed_pairs"].as_array().unwrap().len(), 2);

    fleet.set_down(&down, false);
    let rerun = coordinator
        .run(&registry, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(rerun.exit_code(), EXIT_OK);
    let counts = rerun.counts();
    assert_eq!(counts.installed, 2);
    assert_eq!(counts.already_present, 4);
    assert_eq!(notifier.delivered().len(), 2);
}

#[tokio::test]
async fn test_notification_failure_does_not_fail_run() {
    let (keystore, _dir) = test_keystore().await;
    let notifier = RecordingNotifier::failing_for(&["bob"]);
    let coordinator = coordinator(
        keystore,
        tagged_instances(1),
        FakeFleet::new(),
        notifier.clone(),
        RunOptions::default(),
    );

    let report = coordinator
        .run(&users(&["alice", "bob"]), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.exit_code(), EXIT_OK);
    let failures: Vec<_> = report.notification_failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].username, "bob");
    assert!(failures[0].error.as_deref().unwrap().contains("550"));
    assert_eq!(notifier.delivered_to(), ["alice"]);
}

#[tokio::test]
async fn test_dry_run_mutates_nothing() {
    let (keystore, _dir) = test_keystore().await;
    keystore.resolve("alice").await.unwrap();
    let fleet = FakeFleet::new();
    let notifier = RecordingNotifier::new();
    let coordinator = coordinator(
        keystore.clone(),
        tagged_instances(2),
        fleet.clone(),
        notifier.clone(),
        RunOptions {
            dry_run: true,
            ..RunOptions::default()
        },
    );

    let report = coordinator
        .run(&users(&["alice", "bob"]), CancellationToken::new())
        .await
        .unwrap();

    assert!(report.dry_run);
    assert!(report.outcomes.is_empty());
    assert_eq!(fleet.calls(), 0);
    assert!(notifier.delivered().is_empty());
    assert!(keystore.peek("bob").await.unwrap().is_none());

    assert!(matches!(&report.plan[0], PlanAction::ReuseKey { username, .. } if username == "alice"));
    assert!(report.plan.contains(&PlanAction::CreateKey {
        username: "bob".to_string()
    }));
    assert!(report.plan.contains(&PlanAction::Notify {
        username: "bob".to_string(),
        recipient: "bob@example.com".to_string()
    }));
    let installs = report
        .plan
        .iter()
        .filter(|a| matches!(a, PlanAction::Install { .. }))
        .count();
    assert_eq!(installs, 4);
}

#[tokio::test]
async fn test_notify_disabled_records_suppressed() {
    let (keystore, _dir) = test_keystore().await;
    let notifier = RecordingNotifier::new();
    let coordinator = coordinator(
        keystore,
        tagged_instances(1),
        FakeFleet::new(),
        notifier.clone(),
        RunOptions {
            notify: false,
            ..RunOptions::default()
        },
    );

    let report = coordinator
        .run(&users(&["alice"]), CancellationToken::new())
        .await
        .unwrap();

    assert!(notifier.delivered().is_empty());
    assert_eq!(report.notifications.len(), 1);
    assert_eq!(report.notifications[0].status, NotificationStatus::Suppressed);
    assert_eq!(report.exit_code(), EXIT_OK);
}

#[tokio::test]
async fn test_deadline_marks_unfinished_pairs_timeout() {
    let (keystore, _dir) = test_keystore().await;
    let fleet = FakeFleet::slow(Duration::from_secs(30));
    let coordinator = coordinator(
        keystore,
        tagged_instances(2),
        fleet,
        RecordingNotifier::new(),
        RunOptions {
            deadline: Some(Duration::from_millis(100)),
            ..RunOptions::default()
        },
    );

    let report = coordinator
        .run(&users(&["alice"]), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcomes.len(), 2);
    assert!(
        report
            .outcomes
            .iter()
            .all(|o| o.error_class() == Some(ErrorClass::Timeout))
    );
    assert_eq!(report.exit_code(), EXIT_PARTIAL);
}

#[tokio::test]
async fn test_external_cancel_marks_pairs_timeout() {
    let (keystore, _dir) = test_keystore().await;
    let fleet = FakeFleet::slow(Duration::from_secs(30));
    let coordinator = coordinator(
        keystore,
        tagged_instances(1),
        fleet,
        RecordingNotifier::new(),
        RunOptions::default(),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let report = coordinator
        .run(&users(&["alice"]), cancel)
        .await
        .unwrap();
    assert_eq!(report.outcomes[0].error_class(), Some(ErrorClass::Timeout));
    assert_eq!(
        report.notifications[0].status,
        NotificationStatus::Failed
    );
}

#[tokio::test]
async fn test_no_instances_aborts_before_keys() {
    let (keystore, _dir) = test_keystore().await;
    let coordinator = coordinator(
        keystore.clone(),
        Vec::new(),
        FakeFleet::new(),
        RecordingNotifier::new(),
        RunOptions::default(),
    );

    let err = coordinator
        .run(&users(&["alice"]), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_fatal());
    assert!(keystore.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stopped_instance_is_skipped_and_not_listed() {
    let (keystore, _dir) = test_keystore().await;
    let fleet = FakeFleet::new();
    let notifier = RecordingNotifier::new();
    let mut instances = tagged_instances(2);
    instances[1] = instances[1].clone().with_state(InstanceState::Stopped);

    let coordinator = coordinator(
        keystore,
        instances.clone(),
        fleet.clone(),
        notifier.clone(),
        RunOptions::default(),
    );
    let report = coordinator
        .run(&users(&["alice"]), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.exit_code(), EXIT_OK);
    assert_eq!(report.instances.len(), 1);
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.outcomes[0].status, OutcomeStatus::Installed);
    assert_eq!(fleet.authorized_keys(&instances[0].id, "alice").len(), 1);
    assert!(fleet.authorized_keys(&instances[1].id, "alice").is_empty());

    let counts = report.counts();
    assert_eq!(counts.instances, 1);
    assert_eq!(counts.pairs, 1);
    assert_eq!(counts.installed, 1);
    assert_eq!(counts.keys_created, 1);
    assert_eq!(counts.notified, 1);

    let delivered = notifier.delivered();
    assert_eq!(delivered.len(), 1);
    assert!(delivered[0].text_body.contains(&instances[0].address));
    assert!(!delivered[0].text_body.contains(&instances[1].address));
}

#[tokio::test]
async fn test_resend_after_failed_notification() {
    let (keystore, _dir) = test_keystore().await;
    let instances = tagged_instances(2);
    let coordinator = coordinator(
        keystore.clone(),
        instances.clone(),
        FakeFleet::new(),
        RecordingNotifier::failing_for(&["bob"]),
        RunOptions::default(),
    );
    let report = coordinator
        .run(&users(&["bob"]), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.notification_failures().count(), 1);

    let notifier = RecordingNotifier::new();
    let resend = KeyResend::new(keystore.clone(), resolver(instances.clone()), notifier.clone());
    let bob = User::new("bob", "bob@example.com", "BOB");
    let record = resend.send(&bob, false).await.unwrap();

    assert_eq!(record.status, NotificationStatus::Delivered);
    assert_eq!(record.recipient, "bob@example.com");
    let delivered = notifier.delivered();
    assert_eq!(delivered.len(), 1);
    assert!(delivered[0].attachment.contains("OPENSSH PRIVATE KEY"));
    for instance in &instances {
        assert!(delivered[0].text_body.contains(&instance.address));
    }

    // The stored key is sent as is, never replaced.
    let stored = keystore.peek("bob").await.unwrap().unwrap();
    assert_eq!(delivered[0].attachment, stored.private_key.expose());
}

#[tokio::test]
async fn test_resend_dry_run_and_failures() {
    let (keystore, _dir) = test_keystore().await;
    keystore.resolve("carol").await.unwrap();
    let carol = User::new("carol", "carol@example.com", "CAROL");

    let notifier = RecordingNotifier::new();
    let resend = KeyResend::new(keystore.clone(), resolver(tagged_instances(1)), notifier.clone());
    let record = resend.send(&carol, true).await.unwrap();
    assert_eq!(record.status, NotificationStatus::Suppressed);
    assert!(notifier.delivered().is_empty());

    let failing = KeyResend::new(
        keystore.clone(),
        resolver(tagged_instances(1)),
        RecordingNotifier::failing_for(&["carol"]),
    );
    let record = failing.send(&carol, false).await.unwrap();
    assert_eq!(record.status, NotificationStatus::Failed);
    assert!(record.error.as_deref().unwrap().contains("550"));

    // Unknown users are an error and no key is created for them.
    let dave = User::new("dave", "dave@example.com", "DAVE");
    let err = resend.send(&dave, false).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(keystore.peek("dave").await.unwrap().is_none());
}
