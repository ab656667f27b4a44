//! Server command: receive file streams beneath the media root.

use anyhow::{Context, Result};
use tracing::info;

use torrxfer_core::config::ServerConfig;
use torrxfer_core::server::TransferServer;

use super::ServerArgs;

/// Run the transfer server until interrupted.
///
/// # Errors
///
/// Returns an error if the environment configuration is invalid or the
/// server fails to bind.
pub async fn run(_args: ServerArgs) -> Result<()> {
    let config = ServerConfig::from_env().context("reading TORRXFER_SERVER_* environment")?;
    init_logging(&config)?;

    info!(
        address = %config.address,
        port = config.port,
        media_dir = %config.media_dir.display(),
        "starting torrxfer server"
    );

    let server = TransferServer::bind(config).await?;
    server.serve().await?;
    Ok(())
}

fn init_logging(config: &ServerConfig) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default = if config.trace {
        "debug,torrxfer_core=trace,torrxfer_cli=trace"
    } else if config.debug {
        "info,torrxfer_core=debug,torrxfer_cli=debug"
    } else {
        "warn,torrxfer_core=info,torrxfer_cli=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    match &config.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(std::sync::Mutex::new(file)),
                )
                .with(filter)
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_target(false))
                .with(filter)
                .init();
        }
    }
    Ok(())
}
