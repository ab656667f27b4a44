//! Client command: run the watch-and-transfer pipeline.

use anyhow::{Context, Result};
use tracing::info;

use torrxfer_core::client::{NotificationKind, TransferClient};
use torrxfer_core::config::ClientConfig;

use super::ClientArgs;

/// Run the transfer client until interrupted.
///
/// # Errors
///
/// Returns an error if the configuration is unusable or the client fails
/// to start.
pub async fn run(args: ClientArgs) -> Result<()> {
    init_logging(args.verbose);

    let config = ClientConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    info!(
        servers = config.servers.len(),
        directories = config.watched_directories.len(),
        "starting torrxfer client"
    );

    let client = TransferClient::new();

    // Print connection activity as it happens.
    let mut notifications = client.subscribe();
    tokio::spawn(async move {
        while let Some(n) = notifications.recv().await {
            match n.kind {
                NotificationKind::FilesUpdated => {
                    tracing::debug!(server = %n.address, bytes = n.last_transferred, "progress");
                }
                NotificationKind::QueryError
                | NotificationKind::TransferError
                | NotificationKind::FatalError => {
                    tracing::warn!(
                        server = %n.address,
                        kind = %n.kind,
                        error = n.error.as_deref().unwrap_or(""),
                        "transfer problem"
                    );
                }
                _ => {
                    let file = n
                        .file
                        .as_ref()
                        .map(|f| f.path.display().to_string())
                        .unwrap_or_default();
                    tracing::info!(server = %n.address, kind = %n.kind, file, "connection update");
                }
            }
        }
    });

    client.run(config).await?;
    Ok(())
}

fn init_logging(verbose: u8) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default = match verbose {
        0 => "warn,torrxfer_core=info,torrxfer_cli=info",
        1 => "info,torrxfer_core=debug,torrxfer_cli=debug",
        _ => "debug,torrxfer_core=trace,torrxfer_cli=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}
