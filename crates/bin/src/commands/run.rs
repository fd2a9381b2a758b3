//! Run command - provisions every user onto every eligible instance.

use std::{sync::Arc, time::Duration};

use keyfleet::{
    Coordinator, RunOptions, RunReport, UserRegistry,
    exec::{SshConfig, SshExec},
    installer::{Installer, InstallerOptions},
};
use tokio_util::sync::CancellationToken;

use crate::backend::{create_keystore, create_notifier, create_resolver, key_algorithm};
use crate::cli::RunArgs;
use crate::output::{OutputFormat, print_table};

/// Run the `run` command, returning the process exit code.
pub async fn run(
    args: &RunArgs,
    format: OutputFormat,
    cancel: CancellationToken,
) -> Result<i32, Box<dyn std::error::Error>> {
    let registry = UserRegistry::load(&args.users).await?;

    let resolver = create_resolver(&args.source).await?;

    // A dry run only peeks, so it must not create or migrate the store either
    let keystore = create_keystore(
        &args.store,
        key_algorithm(args.key_algorithm),
        args.dry_run,
    )
    .await?;

    let ssh = SshExec::new(SshConfig {
        user: args.ssh_user.clone(),
        identity: args.ssh_identity.clone(),
        port: args.ssh_port,
        connect_timeout: Duration::from_secs(args.connect_timeout_secs),
        command_timeout: Duration::from_secs(args.command_timeout_secs),
        use_sudo: !args.no_sudo,
    });
    let installer = Installer::new(
        Arc::new(ssh),
        InstallerOptions {
            connect_attempts: args.connect_attempts,
            verify_login: args.verify_login,
            ..InstallerOptions::default()
        },
    );

    let notifier = create_notifier(&args.smtp)?;

    let coordinator = Coordinator::new(keystore, resolver, installer, notifier).with_options(
        RunOptions {
            dry_run: args.dry_run,
            notify: !args.no_notify,
            concurrency: args.concurrency,
            deadline: args.deadline_secs.map(Duration::from_secs),
        },
    );

    let report = coordinator.run(&registry, cancel).await?;
    print_report(&report, format)?;

    if !report.succeeded() {
        eprintln!("{}", serde_json::to_string_pretty(&report.failure_summary())?);
    }
    Ok(report.exit_code())
}

fn print_report(report: &RunReport, format: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string(report)?);
        }
        OutputFormat::Human => {
            if report.dry_run {
                println!("Dry run, no changes made. Planned actions:");
                for action in &report.plan {
                    println!("  {action}");
                }
                return Ok(());
            }

            if report.fallback_used {
                println!("No instance carried the marker tag; used every running instance.");
            }

            let rows: Vec<Vec<String>> = report
                .outcomes
                .iter()
                .map(|o| {
                    vec![
                        o.username.clone(),
                        o.instance_id.clone(),
                        o.status.as_str().to_string(),
                        o.error
                            .as_ref()
                            .map(|e| format!("{}: {}", e.class, e.message))
                            .unwrap_or_default(),
                    ]
                })
                .collect();
            print_table(&["USER", "INSTANCE", "STATUS", "ERROR"], &rows);

            if !report.notifications.is_empty() {
                println!();
                let rows: Vec<Vec<String>> = report
                    .notifications
                    .iter()
                    .map(|n| {
                        vec![
                            n.username.clone(),
                            n.recipient.clone(),
                            n.status.as_str().to_string(),
                            n.error.clone().unwrap_or_default(),
                        ]
                    })
                    .collect();
                print_table(&["USER", "RECIPIENT", "NOTIFICATION", "ERROR"], &rows);
            }

            let counts = report.counts();
            println!();
            println!(
                "{} pair(s): {} installed, {} already present, {} failed; {} key(s) created",
                counts.pairs,
                counts.installed,
                counts.already_present,
                counts.failed,
                counts.keys_created
            );
        }
    }
    Ok(())
}
