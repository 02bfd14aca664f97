use std::error::Error;

use actors::{RuntimeConfig, SchedulerContext};
use storage::Storage;

mod demo;

fn log_level() -> tracing::Level {
    std::env::var("RELAY_LOG_LEVEL")
        .ok()
        .and_then(|level| level.parse().ok())
        .unwrap_or(tracing::Level::INFO)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt().with_max_level(log_level()).init();

    let config = RuntimeConfig::from_env()?;
    let storage = Storage::from_env()?;
    tracing::info!("Using {} object storage", storage.kind_str());

    let mut ctx = SchedulerContext::init(config, storage);
    demo::register(&mut ctx).await?;
    ctx.start().await?;
    demo::seed(&ctx)?;

    tracing::info!("Node running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");
    ctx.shutdown().await?;
    tracing::info!("Stopped with {} events stored", ctx.store().len());
    Ok(())
}
