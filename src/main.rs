//! gearq server entry point

use gearq::{Result, Server, ServerConfig};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting gearq server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::from_env();
    let server = Server::new(config).await?;
    let shutdown = install_shutdown_handler()?;

    if let Err(e) = server.run_until(shutdown).await {
        error!("Server error: {}", e);
        return Err(e);
    }

    info!("gearq server stopped");
    Ok(())
}

/// Cancel the returned token on SIGTERM or SIGINT
fn install_shutdown_handler() -> Result<CancellationToken> {
    let token = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        }
        cancel.cancel();
    });

    Ok(token)
}
