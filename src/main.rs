//! Chat Relay - Entry Point
//!
//! Loads configuration, opens storage, starts the monitor and runs the
//! accept-and-service loop until ctrl-c.

use std::env;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use chat_relay::{
    monitor, Config, MemoryStorage, RelayService, ServiceSettings, SqliteStorage, Storage, Topology,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=chat_relay=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("chat_relay=info")),
        )
        .init();

    // Config file from command line, or chat_relay.toml, or defaults
    let config = match env::args().nth(1) {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };
    let addr = config.bind_addr()?;

    let storage: Arc<dyn Storage> = match &config.storage_path {
        Some(path) => {
            let db = SqliteStorage::open(path)?;
            info!("Persisting to {}", db.location());
            Arc::new(db)
        }
        None => {
            info!("No storage_path configured, keeping state in memory");
            Arc::new(MemoryStorage::new())
        }
    };

    let (topology, changes) = Topology::new();
    let monitor = config
        .monitor
        .then(|| tokio::spawn(monitor::run(changes, storage.clone())));

    let service = RelayService::bind(addr, ServiceSettings::from(&config), storage, topology).await?;
    info!("Chat relay listening on {}", service.local_addr()?);

    tokio::select! {
        _ = service.run() => {}
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutting down");
        }
    }

    // the service (and its Topology) is dropped by now, so the monitor winds down
    if let Some(handle) = monitor {
        let _ = handle.await;
    }

    Ok(())
}
