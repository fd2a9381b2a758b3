//! Key Store, instance resolver and notifier creation.

use std::sync::Arc;

use keyfleet::{
    instance::{InstanceResolver, InstanceSource, StaticInventory, TagFilter, TerraformOutputs},
    keystore::{FileStore, InMemory, KeyAlgorithm, KeyBackend, KeyCipher, KeyStore, SqliteStore},
    notify::{LogNotifier, Notifier, SmtpConfig, SmtpNotifier},
};

use crate::cli::{Algorithm, SmtpArgs, SourceArgs, StoreArgs, StoreBackend};

/// Human-readable description of the configured store
pub fn store_label(args: &StoreArgs) -> String {
    match args.store_backend {
        StoreBackend::File => format!("file ({})", args.store_dir.display()),
        StoreBackend::Sqlite => {
            format!("sqlite ({})", args.store_dir.join("keyfleet.db").display())
        }
    }
}

/// Create the appropriate Key Store based on configuration.
///
/// With `read_only` nothing is created on disk: a store that does not exist
/// yet reads as empty.
pub async fn create_keystore(
    args: &StoreArgs,
    algorithm: KeyAlgorithm,
    read_only: bool,
) -> Result<KeyStore, Box<dyn std::error::Error>> {
    if !read_only {
        tokio::fs::create_dir_all(&args.store_dir).await?;
    }

    let backend: Arc<dyn KeyBackend> = match args.store_backend {
        StoreBackend::File => {
            if read_only && !tokio::fs::try_exists(&args.store_dir).await? {
                tracing::info!("No key store at {}; reading as empty", args.store_dir.display());
                Arc::new(InMemory::new())
            } else {
                tracing::info!("Using file key store at {}", args.store_dir.display());
                Arc::new(FileStore::open(&args.store_dir).await?)
            }
        }
        StoreBackend::Sqlite => {
            let db_path = args.store_dir.join("keyfleet.db");
            if !read_only {
                tracing::info!("Using SQLite key store at {}", db_path.display());
                Arc::new(SqliteStore::open(&db_path).await?)
            } else if tokio::fs::try_exists(&db_path).await? {
                tracing::info!("Using SQLite key store at {} (read-only)", db_path.display());
                Arc::new(SqliteStore::open_read_only(&db_path).await?)
            } else {
                tracing::info!("No key store at {}; reading as empty", db_path.display());
                Arc::new(InMemory::new())
            }
        }
    };

    let cipher = KeyCipher::new(args.store_passphrase.as_str().into())?;
    let keystore = KeyStore::new(backend, cipher).with_algorithm(algorithm);
    if !read_only {
        keystore.check().await?;
    }
    Ok(keystore)
}

pub fn key_algorithm(algorithm: Algorithm) -> KeyAlgorithm {
    match algorithm {
        Algorithm::Rsa => KeyAlgorithm::Rsa4096,
        Algorithm::Ed25519 => KeyAlgorithm::Ed25519,
    }
}

/// Create the instance resolver selected on the command line
pub async fn create_resolver(
    args: &SourceArgs,
) -> Result<InstanceResolver, Box<dyn std::error::Error>> {
    let marker: TagFilter = args.marker.parse()?;
    Ok(InstanceResolver::new(create_source(args).await?)
        .with_marker(marker)
        .with_scope(args.scope.clone())
        .with_fallback(!args.no_fallback))
}

async fn create_source(
    args: &SourceArgs,
) -> Result<Arc<dyn InstanceSource>, Box<dyn std::error::Error>> {
    if let Some(path) = &args.inventory {
        tracing::info!("Using static inventory at {}", path.display());
        return Ok(Arc::new(StaticInventory::load(path).await?));
    }
    if let Some(path) = &args.terraform_output {
        tracing::info!("Using terraform outputs from {}", path.display());
        return Ok(Arc::new(TerraformOutputs::from_file(path)));
    }
    if let Some(dir) = &args.terraform_dir {
        tracing::info!("Querying terraform outputs in {}", dir.display());
        return Ok(Arc::new(TerraformOutputs::from_dir(dir)));
    }
    Err("an instance source is required: --inventory, --terraform-output or --terraform-dir".into())
}

/// SMTP notifier when a relay is configured, otherwise one that only logs
pub fn create_notifier(args: &SmtpArgs) -> Result<Arc<dyn Notifier>, Box<dyn std::error::Error>> {
    let Some(host) = &args.smtp_host else {
        tracing::info!("No SMTP host configured; notifications will only be logged");
        return Ok(Arc::new(LogNotifier));
    };

    let from_address = args
        .smtp_from
        .clone()
        .unwrap_or_else(|| format!("noreply@{host}"));
    let mut config = SmtpConfig::new(host.clone(), from_address);
    config.port = args.smtp_port;
    config.username = args.smtp_user.clone();
    config.password = args.smtp_password.clone().map(Into::into);
    config.test_recipient = args.test_email.clone();

    Ok(Arc::new(SmtpNotifier::new(config)?))
}
