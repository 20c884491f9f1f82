//! cairnd — Portal Network overlay daemon.

mod dispatch;
mod node;
mod socket;
mod transport;
mod utp;

use anyhow::Result;
use cairn_core::config::CairnConfig;
use node::CairnNode;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing — RUST_LOG controls verbosity
    // e.g. RUST_LOG=debug cargo run -p cairnd
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = CairnConfig::write_default_if_missing()?;
    let config = CairnConfig::load()?;
    tracing::info!(config = %config_path.display(), "cairnd starting");

    let node = CairnNode::start(config).await?;
    tracing::info!(
        enr = node.local_enr().to_hex(),
        "node running; ctrl-c to stop"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    node.shutdown();

    Ok(())
}
