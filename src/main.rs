//! PeerVault CLI entry point: loads configuration, starts the node, and
//! awaits a shutdown signal.

use clap::Parser;
use peervault::config::Cli;
use peervault::server::FileServer;
use peervault::Result;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = cli.resolve()?;

    tracing::info!(addr = %config.listen_addr, "starting peervault node");
    let server = FileServer::new(config)?;
    server.start().await?;

    tokio::signal::ctrl_c().await.map_err(peervault::Error::Io)?;
    tracing::info!("shutdown signal received, stopping");
    server.stop(server.connection_timeout()).await?;

    Ok(())
}
