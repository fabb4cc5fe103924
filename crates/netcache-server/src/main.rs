//! netcache - network cache for build artifacts
//!
//! Serves uploads (STORE, RECLAIM, RESET) and downloads (FETCH) on two
//! separate ports so that firewalls can restrict who may write to the cache.

use netcache_server::{start_server, ServerConfig, ServerState, SharedState};
use netcache_store::ArtifactStore;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> netcache_server::Result<()> {
    // Initialize logging
    let env_filter = EnvFilter::from_default_env()
        .add_directive("netcache_server=info".parse()?)
        .add_directive("netcache_store=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    };

    info!("Starting netcache server...");

    let config = ServerConfig::from_env()?;
    info!("Cache dir: {:?}", config.cache_dir);
    info!(
        "Max cache size: {} MB (RECLAIM trims to {} MB)",
        config.max_cache_size / (1024 * 1024),
        config.target_size() / (1024 * 1024)
    );
    if config.single_port() {
        info!("Port: {} (upload and download)", config.upload_port);
    } else {
        info!("Upload port: {}", config.upload_port);
        info!("Download port: {}", config.download_port);
    }

    // The index must be complete before either listener accepts
    let store = ArtifactStore::open(config.cache_dir.clone()).await?;
    info!("ready ({} dirs)", store.list_keys().await.len());

    let state: SharedState = Arc::new(ServerState::new(store, config));
    start_server(state).await?;

    info!("netcache server stopped");
    Ok(())
}
