use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use keyfleet::{
    Coordinator, RunOptions, User, UserRegistry,
    exec::{ExecError, ExecOutput, HostOp, RemoteExec},
    installer::{Installer, InstallerOptions},
    instance::{Instance, InstanceResolver, StaticInventory},
    keystore::{FileStore, InMemory, KeyAlgorithm, KeyBackend, KeyCipher, KeyStore, types::key_material},
    notify::{Notification, Notifier, NotifyError},
};
use tempfile::TempDir;

pub const PASSPHRASE: &str = "integration-test-passphrase";

// ==========================
// KEY STORE FACTORIES
// ==========================

/// Key Store under test, chosen by the TEST_BACKEND env var.
///
/// Supported values:
/// - "inmemory" or unset: InMemory backend (default)
/// - "file": FileStore in a temporary directory
/// - "sqlite": SQLite in-memory backend (requires `sqlite` feature)
///
/// The returned `TempDir` must outlive the store.
pub async fn test_keystore() -> (KeyStore, Option<TempDir>) {
    let (backend, dir): (Arc<dyn KeyBackend>, Option<TempDir>) =
        match std::env::var("TEST_BACKEND").as_deref() {
            Ok("file") => {
                let dir = tempfile::tempdir().expect("Failed to create temp dir");
                let store = FileStore::open(dir.path())
                    .await
                    .expect("Failed to open file store");
                (Arc::new(store), Some(dir))
            }
            Ok("sqlite") => {
                #[cfg(feature = "sqlite")]
                {
                    let store = keyfleet::keystore::SqliteStore::in_memory()
                        .await
                        .expect("Failed to create SQLite store");
                    (Arc::new(store), None)
                }
                #[cfg(not(feature = "sqlite"))]
                panic!("TEST_BACKEND=sqlite requires the `sqlite` feature");
            }
            _ => (Arc::new(InMemory::new()), None),
        };
    (keystore_over(backend), dir)
}

/// Ed25519 Key Store over `backend`, keeping tests fast.
pub fn keystore_over(backend: Arc<dyn KeyBackend>) -> KeyStore {
    let cipher = KeyCipher::new(PASSPHRASE.into()).expect("Failed to create cipher");
    KeyStore::new(backend, cipher).with_algorithm(KeyAlgorithm::Ed25519)
}

// ==========================
// USERS AND INSTANCES
// ==========================

pub fn users(names: &[&str]) -> UserRegistry {
    UserRegistry::new(
        names
            .iter()
            .map(|name| User::new(*name, format!("{name}@example.com"), name.to_uppercase()))
            .collect(),
    )
    .expect("Failed to build registry")
}

/// `count` running instances carrying the default marker tag.
pub fn tagged_instances(count: usize) -> Vec<Instance> {
    (1..=count)
        .map(|i| {
            Instance::new(format!("i-{i:03}"), format!("10.0.0.{i}"))
                .with_tag("ssh-provisioning", "enabled")
                .with_scope("us-east-1")
        })
        .collect()
}

pub fn resolver(instances: Vec<Instance>) -> InstanceResolver {
    InstanceResolver::new(Arc::new(StaticInventory::new(instances)))
}

pub fn fast_installer(fleet: Arc<FakeFleet>) -> Installer {
    Installer::new(
        fleet,
        InstallerOptions {
            connect_attempts: 2,
            backoff_base: Duration::from_millis(1),
            verify_login: true,
        },
    )
}

pub fn coordinator(
    keystore: KeyStore,
    instances: Vec<Instance>,
    fleet: Arc<FakeFleet>,
    notifier: Arc<RecordingNotifier>,
    options: RunOptions,
) -> Coordinator {
    Coordinator::new(keystore, resolver(instances), fast_installer(fleet), notifier)
        .with_options(options)
}

// ==========================
// SIMULATED FLEET
// ==========================

/// State of one simulated host.
#[derive(Debug, Default, Clone)]
pub struct Host {
    pub accounts: BTreeSet<String>,
    pub authorized_keys: BTreeMap<String, Vec<String>>,
}

/// In-memory fleet implementing [`RemoteExec`] with the same result words
/// as the real host scripts.
#[derive(Default)]
pub struct FakeFleet {
    hosts: Mutex<HashMap<String, Host>>,
    down: Mutex<HashSet<String>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    mutations: AtomicUsize,
}

impl FakeFleet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every operation sleeps for `delay` first.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn set_down(&self, instance_id: &str, down: bool) {
        let mut hosts = self.down.lock().unwrap();
        if down {
            hosts.insert(instance_id.to_string());
        } else {
            hosts.remove(instance_id);
        }
    }

    pub fn host(&self, instance_id: &str) -> Host {
        self.hosts
            .lock()
            .unwrap()
            .get(instance_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn authorized_keys(&self, instance_id: &str, username: &str) -> Vec<String> {
        self.host(instance_id)
            .authorized_keys
            .get(username)
            .cloned()
            .unwrap_or_default()
    }

    /// Accounts created plus keys appended across the fleet.
    pub fn mutations(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteExec for FakeFleet {
    async fn exec(&self, instance: &Instance, op: &HostOp) -> Result<ExecOutput, ExecError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.down.lock().unwrap().contains(&instance.id) {
            return Err(ExecError::Connect {
                host: instance.address.clone(),
                reason: "Connection timed out".to_string(),
            });
        }

        let mut hosts = self.hosts.lock().unwrap();
        let host = hosts.entry(instance.id.clone()).or_default();

        let output = match op {
            HostOp::Probe | HostOp::VerifyPermissions { .. } => ExecOutput::success("ok"),
            HostOp::EnsureAccount { username } => {
                if host.accounts.insert(username.clone()) {
                    self.mutations.fetch_add(1, Ordering::SeqCst);
                    ExecOutput::success("created")
                } else {
                    ExecOutput::success("present")
                }
            }
            HostOp::EnsureCredential {
                username,
                public_key,
            } => {
                if !host.accounts.contains(username) {
                    return Ok(ExecOutput::failure(1, format!("no such user: {username}")));
                }
                let keys = host.authorized_keys.entry(username.clone()).or_default();
                let material = key_material(public_key);
                if keys.iter().any(|line| key_material(line) == material) {
                    ExecOutput::success("present")
                } else {
                    keys.push(public_key.clone());
                    self.mutations.fetch_add(1, Ordering::SeqCst);
                    ExecOutput::success("installed")
                }
            }
            HostOp::VerifyLogin { username, .. } => {
                if host
                    .authorized_keys
                    .get(username)
                    .is_some_and(|keys| !keys.is_empty())
                {
                    ExecOutput::success("")
                } else {
                    return Err(ExecError::AuthRejected {
                        host: instance.address.clone(),
                        reason: format!("{username}@{}: Permission denied (publickey).", instance.address),
                    });
                }
            }
        };
        Ok(output)
    }
}

// ==========================
// NOTIFIER
// ==========================

/// A delivered message as seen by the recording notifier.
#[derive(Debug, Clone)]
pub struct Delivered {
    pub username: String,
    pub subject: String,
    pub text_body: String,
    pub attachment_name: String,
    pub attachment: String,
}

/// Records deliveries; users listed in `failing` get a send error.
#[derive(Default)]
pub struct RecordingNotifier {
    delivered: Mutex<Vec<Delivered>>,
    failing: HashSet<String>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_for(usernames: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            delivered: Mutex::new(Vec::new()),
            failing: usernames.iter().map(|u| u.to_string()).collect(),
        })
    }

    pub fn delivered(&self) -> Vec<Delivered> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn delivered_to(&self) -> Vec<String> {
        self.delivered()
            .into_iter()
            .map(|d| d.username)
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn deliver(&self, user: &User, notification: &Notification) -> Result<(), NotifyError> {
        if self.failing.contains(&user.username) {
            return Err(NotifyError::Send {
                recipient: user.email.clone(),
                reason: "550 mailbox unavailable".to_string(),
            });
        }
        self.delivered.lock().unwrap().push(Delivered {
            username: user.username.clone(),
            subject: notification.subject.clone(),
            text_body: notification.text_body.clone(),
            attachment_name: notification.attachment.filename.clone(),
            attachment: notification.attachment.content.expose().to_string(),
        });
        Ok(())
    }
}
