//! Key Store management commands.

use keyfleet::{
    KeyResend, UserRegistry,
    keystore::KeyAlgorithm,
    report::{EXIT_OK, EXIT_PARTIAL, NotificationStatus},
};

use crate::backend::{create_keystore, create_notifier, create_resolver, store_label};
use crate::cli::{KeysListArgs, KeysSendArgs};
use crate::output::{OutputFormat, print_table};

/// Run the `keys list` command
pub async fn list(
    args: &KeysListArgs,
    format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let keystore = create_keystore(&args.store, KeyAlgorithm::default(), true).await?;
    let keys = keystore.list().await?;

    match format {
        OutputFormat::Human => {
            if keys.is_empty() {
                println!("No keys in {}.", store_label(&args.store));
                return Ok(());
            }

            let rows: Vec<Vec<String>> = keys
                .iter()
                .map(|k| {
                    vec![
                        k.username.clone(),
                        k.algorithm.to_string(),
                        k.fingerprint.clone(),
                        k.created_at.to_rfc3339(),
                    ]
                })
                .collect();
            print_table(&["USERNAME", "ALGORITHM", "FINGERPRINT", "CREATED"], &rows);
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string(&keys)?);
        }
    }

    Ok(())
}

/// Run the `keys send` command, returning the process exit code.
///
/// Delivers the stored key for one user without touching any host. A failed
/// delivery exits with [`EXIT_PARTIAL`].
pub async fn send(
    args: &KeysSendArgs,
    format: OutputFormat,
) -> Result<i32, Box<dyn std::error::Error>> {
    let registry = UserRegistry::load(&args.users).await?;
    let user = registry.get(&args.username).ok_or_else(|| {
        format!(
            "'{}' is not listed in {}",
            args.username,
            args.users.display()
        )
    })?;

    let keystore = create_keystore(&args.store, KeyAlgorithm::default(), true).await?;
    let resolver = create_resolver(&args.source).await?;
    let notifier = create_notifier(&args.smtp)?;

    let record = KeyResend::new(keystore, resolver, notifier)
        .send(user, args.dry_run)
        .await?;

    match format {
        OutputFormat::Human => print_table(
            &["USER", "RECIPIENT", "NOTIFICATION", "ERROR"],
            &[vec![
                record.username.clone(),
                record.recipient.clone(),
                record.status.as_str().to_string(),
                record.error.clone().unwrap_or_default(),
            ]],
        ),
        OutputFormat::Json => println!("{}", serde_json::to_string(&record)?),
    }

    Ok(match record.status {
        NotificationStatus::Failed => EXIT_PARTIAL,
        _ => EXIT_OK,
    })
}
