use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use clap::Parser;
use keyfleet::report::{EXIT_FATAL, EXIT_OK};
use signal_hook::flag as signal_flag;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod backend;
mod cli;
mod commands;
mod output;

use cli::{Cli, Commands, KeysCommand};

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e}");
            eprintln!("error: {e}");
            EXIT_FATAL
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<i32, Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays machine-readable
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("keyfleet=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Commands::Run(args) => {
            let cancel = shutdown_token();
            commands::run::run(args, cli.output, cancel).await
        }
        Commands::Keys(KeysCommand::List(args)) => {
            commands::keys::list(args, cli.output).await?;
            Ok(EXIT_OK)
        }
        Commands::Keys(KeysCommand::Send(args)) => commands::keys::send(args, cli.output).await,
    }
}

/// Token cancelled on SIGINT/SIGTERM.
fn shutdown_token() -> CancellationToken {
    let term_signal = Arc::new(AtomicBool::new(false));
    for signal in signal_hook::consts::TERM_SIGNALS {
        let _ = signal_flag::register(*signal, Arc::clone(&term_signal));
    }

    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        while !term_signal.load(Ordering::Relaxed) {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        }
        tracing::warn!("Shutdown signal received, cancelling run");
        cancel.cancel();
    });
    token
}
