//! Provisioning coordinator
//!
//! Drives one run end to end:
//!
//! 1. resolve eligible instances,
//! 2. resolve every user's key (in input order) before any host is touched,
//! 3. converge every (user, instance) pair on a bounded worker pool,
//! 4. notify users whose key was created in this run,
//! 5. return a [`RunReport`].
//!
//! Fatal errors (invalid input, no instances, Key Store failures) abort the
//! run before any host is mutated. Per-pair failures are recorded and never
//! stop sibling pairs.

mod resend;

use std::{sync::Arc, time::Duration};

pub use resend::KeyResend;
use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    Error, Result,
    clock::{Clock, SystemClock},
    installer::Installer,
    instance::{Instance, InstanceResolver},
    keystore::{KeyPair, KeyStore},
    notify::{Notifier, compose_notification},
    registry::{User, UserRegistry},
    report::{
        ErrorClass, KeyRecord, NotificationRecord, NotificationStatus, PlanAction,
        ProvisioningOutcome, RunReport,
    },
};

/// Default number of pairs converged at once.
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Per-run settings.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Plan only; neither hosts nor the Key Store are mutated.
    pub dry_run: bool,
    /// Deliver first-time access messages.
    pub notify: bool,
    /// Maximum pairs in flight.
    pub concurrency: usize,
    /// Wall-clock budget for the install phase.
    pub deadline: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            notify: true,
            concurrency: DEFAULT_CONCURRENCY,
            deadline: None,
        }
    }
}

/// A user together with the key resolved for this run.
struct UserKey {
    user: User,
    keypair: Arc<KeyPair>,
    created: bool,
}

pub struct Coordinator {
    keystore: KeyStore,
    resolver: InstanceResolver,
    installer: Installer,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    options: RunOptions,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("keystore", &self.keystore)
            .field("resolver", &self.resolver)
            .field("installer", &self.installer)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    pub fn new(
        keystore: KeyStore,
        resolver: InstanceResolver,
        installer: Installer,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            keystore,
            resolver,
            installer,
            notifier,
            clock: Arc::new(SystemClock),
            options: RunOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Execute one provisioning run for every user in `registry`.
    ///
    /// Cancelling `cancel` aborts in-flight pairs; they are reported as
    /// failed with class `timeout`.
    pub async fn run(&self, registry: &UserRegistry, cancel: CancellationToken) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "run",
            %run_id,
            users = registry.len(),
            dry_run = self.options.dry_run
        );
        self.execute(run_id, registry, cancel).instrument(span).await
    }

    async fn execute(
        &self,
        run_id: Uuid,
        registry: &UserRegistry,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let started_at = self.clock.now();

        let resolution = self.resolver.resolve().await?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut report = RunReport {
            run_id,
            started_at,
            finished_at: started_at,
            dry_run: self.options.dry_run,
            fallback_used: resolution.fallback_used,
            instances: resolution.instances,
            keys: Vec::with_capacity(registry.len()),
            outcomes: Vec::new(),
            notifications: Vec::new(),
            plan: Vec::new(),
        };

        if self.options.dry_run {
            self.plan(registry, &mut report).await?;
        } else {
            let keys = self.resolve_keys(registry).await?;
            report.keys = keys
                .iter()
                .map(|k| KeyRecord {
                    username: k.user.username.clone(),
                    fingerprint: k.keypair.fingerprint.clone(),
                    created: k.created,
                })
                .collect();

            report.outcomes = self.install_all(&keys, &report.instances, &cancel).await;
            report.notifications = self.notify_new_users(&keys, &report.instances, &cancel).await;
        }

        report.finished_at = self.clock.now();

        let counts = report.counts();
        tracing::info!(
            instances = counts.instances,
            pairs = counts.pairs,
            installed = counts.installed,
            already_present = counts.already_present,
            failed = counts.failed,
            keys_created = counts.keys_created,
            notified = counts.notified,
            "run finished"
        );
        Ok(report)
    }

    /// Resolve every key before any host is touched. Any error is fatal.
    async fn resolve_keys(&self, registry: &UserRegistry) -> Result<Vec<UserKey>> {
        let mut keys = Vec::with_capacity(registry.len());
        for user in registry.users() {
            let resolved = self.keystore.resolve(&user.username).await?;
            keys.push(UserKey {
                user: user.clone(),
                keypair: Arc::new(resolved.keypair),
                created: resolved.created,
            });
        }
        Ok(keys)
    }

    /// Dry run: peek keys and describe what a real run would do.
    async fn plan(&self, registry: &UserRegistry, report: &mut RunReport) -> Result<()> {
        for user in registry.users() {
            let existing = self.keystore.peek(&user.username).await?;
            let created = existing.is_none();
            match existing {
                Some(keypair) => {
                    report.plan.push(PlanAction::ReuseKey {
                        username: user.username.clone(),
                        fingerprint: keypair.fingerprint.clone(),
                    });
                    report.keys.push(KeyRecord {
                        username: user.username.clone(),
                        fingerprint: keypair.fingerprint,
                        created: false,
                    });
                }
                None => {
                    report.plan.push(PlanAction::CreateKey {
                        username: user.username.clone(),
                    });
                    report.keys.push(KeyRecord {
                        username: user.username.clone(),
                        fingerprint: String::new(),
                        created: true,
                    });
                }
            }

            for instance in &report.instances {
                report.plan.push(PlanAction::Install {
                    username: user.username.clone(),
                    instance_id: instance.id.clone(),
                });
            }

            if created && self.options.notify {
                report.plan.push(PlanAction::Notify {
                    username: user.username.clone(),
                    recipient: self.notifier.recipient(user),
                });
            }
        }

        tracing::info!(actions = report.plan.len(), "dry run planned");
        Ok(())
    }

    /// Converge every pair on a bounded pool.
    ///
    /// Returned outcomes are ordered by (user input order, instance id).
    async fn install_all(
        &self,
        keys: &[UserKey],
        instances: &[Instance],
        cancel: &CancellationToken,
    ) -> Vec<ProvisioningOutcome> {
        let stop = cancel.child_token();
        let deadline_guard = self.options.deadline.map(|deadline| {
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                tracing::warn!(deadline_secs = deadline.as_secs(), "run deadline reached");
                stop.cancel();
            })
        });

        let semaphore = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut pairs = Vec::with_capacity(keys.len() * instances.len());

        for key in keys {
            for instance in instances {
                let index = pairs.len();
                pairs.push((key.user.username.clone(), instance.id.clone()));

                let installer = self.installer.clone();
                let semaphore = semaphore.clone();
                let stop = stop.clone();
                let user = key.user.clone();
                let keypair = key.keypair.clone();
                let instance = instance.clone();

                tasks.spawn(async move {
                    let outcome = tokio::select! {
                        biased;
                        _ = stop.cancelled() => None,
                        outcome = async {
                            let _permit = semaphore.acquire_owned().await.ok()?;
                            Some(installer.install(&user, &instance, &keypair).await)
                        } => outcome,
                    };
                    (index, outcome)
                });
            }
        }

        let mut slots: Vec<Option<ProvisioningOutcome>> = vec![None; pairs.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => slots[index] = outcome,
                Err(err) => tracing::error!(error = %err, "pair task aborted"),
            }
        }

        if let Some(guard) = deadline_guard {
            guard.abort();
        }

        let stopped = stop.is_cancelled();
        slots
            .into_iter()
            .zip(pairs)
            .map(|(slot, (username, instance_id))| {
                slot.unwrap_or_else(|| {
                    if stopped {
                        ProvisioningOutcome::failed(
                            username,
                            instance_id,
                            ErrorClass::Timeout,
                            "run cancelled or deadline reached before the pair finished",
                        )
                    } else {
                        ProvisioningOutcome::failed(
                            username,
                            instance_id,
                            ErrorClass::Install,
                            "pair task aborted",
                        )
                    }
                })
            })
            .collect()
    }

    /// Notify users whose key was created in this run, at most once each.
    async fn notify_new_users(
        &self,
        keys: &[UserKey],
        instances: &[Instance],
        cancel: &CancellationToken,
    ) -> Vec<NotificationRecord> {
        let mut records = Vec::new();

        for key in keys.iter().filter(|k| k.created) {
            let recipient = self.notifier.recipient(&key.user);
            let username = key.user.username.clone();

            if !self.options.notify {
                tracing::info!(user = %username, "notification suppressed");
                records.push(NotificationRecord {
                    username,
                    recipient,
                    status: NotificationStatus::Suppressed,
                    error: None,
                });
                continue;
            }

            if cancel.is_cancelled() {
                records.push(NotificationRecord {
                    username,
                    recipient,
                    status: NotificationStatus::Failed,
                    error: Some("run cancelled before delivery".to_string()),
                });
                continue;
            }

            let notification =
                compose_notification(&key.user, &key.keypair, instances, key.keypair.created_at);
            match self.notifier.deliver(&key.user, &notification).await {
                Ok(()) => records.push(NotificationRecord {
                    username,
                    recipient,
                    status: NotificationStatus::Delivered,
                    error: None,
                }),
                Err(err) => {
                    tracing::error!(user = %username, error = %err, "notification failed");
                    records.push(NotificationRecord {
                        username,
                        recipient,
                        status: NotificationStatus::Failed,
                        error: Some(err.to_string()),
                    });
                }
            }
        }

        records
    }
}
