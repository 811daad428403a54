//! pglisten - print PostgreSQL notifications
//!
//! Usage:
//!   # Listen on `observations` in the local `weather` database
//!   pglisten
//!
//!   # Several channels, JSON lines output
//!   pglisten --host db.internal --channel observations,alerts --output json
//!
//!   # From a configuration file, password from the environment
//!   PGLISTEN_PASSWORD=secret pglisten --config pglisten.yaml

mod cli;

use clap::Parser;
use cli::{Cli, OutputFormat};
use pglisten::{Listener, ListenerState, Notification};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match cli.listener_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!(
        endpoint = %config.endpoint(),
        channels = ?config.channels,
        "Starting pglisten"
    );

    let listener = Listener::new(config)?;
    let output = cli.output;
    listener.on_notification(move |n| print_notification(n, output));
    listener.on_error(|e| tracing::warn!(category = %e.category(), "{}", e));
    listener.on_state_change(|state| tracing::info!(%state, "Listener state changed"));
    listener.start()?;

    let failed = tokio::select! {
        _ = wait_for_shutdown_signal() => {
            tracing::info!("Shutdown signal received, stopping listener...");
            false
        }
        state = listener.wait() => state == ListenerState::Failed,
    };

    let shutdown_timeout = cli.shutdown_timeout();
    match tokio::time::timeout(shutdown_timeout, listener.stop()).await {
        Ok(Ok(())) => tracing::info!("Listener stopped"),
        Ok(Err(e)) => tracing::error!("Error during shutdown: {}", e),
        Err(_) => tracing::warn!(
            "Shutdown timed out after {:?}, forcing exit",
            shutdown_timeout
        ),
    }

    let stats = listener.stats();
    tracing::info!(
        delivered = stats.delivered,
        dropped = stats.dropped,
        malformed = stats.malformed,
        reconnects = stats.reconnects,
        "Final counters"
    );

    if failed {
        anyhow::bail!("listener gave up; see the log for the terminal error");
    }
    Ok(())
}

fn print_notification(n: &Notification, output: OutputFormat) {
    match output {
        OutputFormat::Text => {
            let origin = n
                .origin
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            println!(
                "Notification: {} #{} from {}: {}",
                n.channel,
                n.sequence,
                origin,
                String::from_utf8_lossy(&n.payload)
            );
        }
        OutputFormat::Json => match serde_json::to_string(n) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::error!(sequence = n.sequence, "Failed to render notification: {}", e),
        },
    }
}

/// Wait for shutdown signals (Ctrl+C or SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}
