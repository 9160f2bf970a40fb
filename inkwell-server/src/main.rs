use std::error::Error;

use inkwell_sync::{ServerConfig, SyncService};
use log::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env()?;
    info!(
        "Starting inkwell sync service (debounce {:?}, max {:?}, access {:?})",
        config.persistence.debounce, config.persistence.max_debounce, config.access_policy
    );

    let service = SyncService::open(config)?;
    let addr = service.start().await?;
    info!("Ready on ws://{addr}");

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, flushing open documents");

    let stopped = service.stop().await;
    let status = service.stats();
    info!(
        "Served {} connections, {} messages, {} rejected attaches",
        status.total_connections, status.total_messages, status.rejected_attaches
    );
    stopped?;
    Ok(())
}
