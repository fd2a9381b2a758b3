//! Run report
//!
//! Machine-readable summary of one provisioning run and the exit-status
//! policy derived from it.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::instance::Instance;

/// Every pair converged.
pub const EXIT_OK: i32 = 0;
/// At least one pair failed.
pub const EXIT_PARTIAL: i32 = 1;
/// The run aborted before or during setup.
pub const EXIT_FATAL: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Installed,
    AlreadyPresent,
    Failed,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Installed => "installed",
            OutcomeStatus::AlreadyPresent => "already_present",
            OutcomeStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a failed pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Host unreachable after all connection attempts.
    Connectivity,
    /// A remote step ran and failed.
    Install,
    /// Deadline passed or the run was cancelled.
    Timeout,
    /// The host refused the key during login verification or admin login.
    Auth,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Connectivity => "connectivity",
            ErrorClass::Install => "install",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Auth => "auth",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeError {
    pub class: ErrorClass,
    pub message: String,
}

/// Result of converging one (user, instance) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningOutcome {
    pub username: String,
    pub instance_id: String,
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OutcomeError>,
}

impl ProvisioningOutcome {
    pub fn converged(
        username: impl Into<String>,
        instance_id: impl Into<String>,
        appended: bool,
    ) -> Self {
        Self {
            username: username.into(),
            instance_id: instance_id.into(),
            status: if appended {
                OutcomeStatus::Installed
            } else {
                OutcomeStatus::AlreadyPresent
            },
            error: None,
        }
    }

    pub fn failed(
        username: impl Into<String>,
        instance_id: impl Into<String>,
        class: ErrorClass,
        message: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            instance_id: instance_id.into(),
            status: OutcomeStatus::Failed,
            error: Some(OutcomeError {
                class,
                message: message.into(),
            }),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == OutcomeStatus::Failed
    }

    pub fn error_class(&self) -> Option<ErrorClass> {
        self.error.as_ref().map(|e| e.class)
    }
}

/// Per-user key facts for the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub username: String,
    pub fingerprint: String,
    /// True when the key was generated during this run.
    pub created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Delivered,
    Failed,
    /// Notifications were disabled for the run.
    Suppressed,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Delivered => "delivered",
            NotificationStatus::Failed => "failed",
            NotificationStatus::Suppressed => "suppressed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub username: String,
    pub recipient: String,
    pub status: NotificationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One step a dry run would take.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlanAction {
    CreateKey { username: String },
    ReuseKey { username: String, fingerprint: String },
    Install { username: String, instance_id: String },
    Notify { username: String, recipient: String },
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanAction::CreateKey { username } => write!(f, "create key for {username}"),
            PlanAction::ReuseKey {
                username,
                fingerprint,
            } => write!(f, "reuse key {fingerprint} for {username}"),
            PlanAction::Install {
                username,
                instance_id,
            } => write!(f, "install {username} on {instance_id}"),
            PlanAction::Notify {
                username,
                recipient,
            } => write!(f, "notify {username} at {recipient}"),
        }
    }
}

/// Aggregate counts for display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounts {
    pub users: usize,
    pub instances: usize,
    pub pairs: usize,
    pub installed: usize,
    pub already_present: usize,
    pub failed: usize,
    pub keys_created: usize,
    pub notified: usize,
    pub notify_failed: usize,
}

/// Summary of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub fallback_used: bool,
    pub instances: Vec<Instance>,
    pub keys: Vec<KeyRecord>,
    pub outcomes: Vec<ProvisioningOutcome>,
    pub notifications: Vec<NotificationRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plan: Vec<PlanAction>,
}

impl RunReport {
    pub fn counts(&self) -> RunCounts {
        let mut counts = RunCounts {
            users: self.keys.len(),
            instances: self.instances.len(),
            pairs: self.outcomes.len(),
            keys_created: self.keys.iter().filter(|k| k.created).count(),
            ..RunCounts::default()
        };
        for outcome in &self.outcomes {
            match outcome.status {
                OutcomeStatus::Installed => counts.installed += 1,
                OutcomeStatus::AlreadyPresent => counts.already_present += 1,
                OutcomeStatus::Failed => counts.failed += 1,
            }
        }
        for notification in &self.notifications {
            match notification.status {
                NotificationStatus::Delivered => counts.notified += 1,
                NotificationStatus::Failed => counts.notify_failed += 1,
                NotificationStatus::Suppressed => {}
            }
        }
        counts
    }

    pub fn failures(&self) -> impl Iterator<Item = &ProvisioningOutcome> {
        self.outcomes.iter().filter(|o| o.is_failed())
    }

    pub fn notification_failures(&self) -> impl Iterator<Item = &NotificationRecord> {
        self.notifications
            .iter()
            .filter(|n| n.status == NotificationStatus::Failed)
    }

    /// True when no pair failed. Notification failures do not count.
    pub fn succeeded(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn exit_code(&self) -> i32 {
        if self.succeeded() {
            EXIT_OK
        } else {
            EXIT_PARTIAL
        }
    }

    /// Users whose key was created in this run.
    pub fn created_users(&self) -> impl Iterator<Item = &str> {
        self.keys
            .iter()
            .filter(|k| k.created)
            .map(|k| k.username.as_str())
    }

    /// Compact failure listing for operators and CI.
    pub fn failure_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "run_id": self.run_id,
            "failed_pairs": self.failures().collect::<Vec<_>>(),
            "notification_failures": self.notification_failures().collect::<Vec<_>>(),
        })
    }
}
