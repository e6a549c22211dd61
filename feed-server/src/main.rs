//! Feed realtime server.
//!
//! Configuration comes from `FEED_*` environment variables, optionally
//! read from a `.env` file. Without a real backend, sessions and
//! relationships are seeded from the JSON file named by
//! `FEED_FIXTURES_PATH`; messages go to RocksDB when `FEED_STORAGE_PATH`
//! is set and stay in memory otherwise.

use feed_realtime::collaborators::{Fixtures, MemoryCollaborators};
use feed_realtime::server::{ChatServer, ServerConfig};
use feed_realtime::storage::{RocksMessageStore, StoreConfig};
use log::{error, info, warn};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Failed to read .env: {e}");
        }
    }
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env()?;

    let memory = MemoryCollaborators::new();
    match &config.fixtures_path {
        Some(path) => {
            let json = tokio::fs::read_to_string(path).await?;
            memory.load_fixtures(&Fixtures::from_json(&json)?).await;
        }
        None => warn!("No fixtures configured; every connection will be rejected"),
    }

    let collaborators = match &config.storage_path {
        Some(path) => {
            let store = RocksMessageStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?;
            info!(
                "Message store opened at {} (next sequence {})",
                store.path().display(),
                store.next_sequence()
            );
            memory.collaborators_with(Arc::new(store))
        }
        None => {
            info!("Messages kept in memory");
            memory.collaborators()
        }
    };

    let server = ChatServer::bind(config, collaborators).await?;
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for ctrl-c: {e}");
            }
        })
        .await?;

    let stats = server.stats();
    info!(
        "Stopped after {} connections ({} rejected), {} frames in, {} frames out",
        stats.total_connections,
        stats.rejected_connections,
        stats.frames_received,
        stats.frames_sent
    );
    Ok(())
}
