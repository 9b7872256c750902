//! Node executable: loads `NodeConfig` from the path given as the first
//! argument (or `submerge.toml` in the current directory), sets up
//! `tracing-subscriber` per §4.10, and runs the server until SIGINT.

use submerge::{NodeConfig, Server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "submerge.toml".to_string());
    let config = NodeConfig::load(&config_path)?;

    let server = Server::start(config).await?;
    tracing::info!(address = %server.local_addr(), "listening");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    server.shutdown().await;
    Ok(())
}
