//! TCP listeners for the upload and download endpoints
//!
//! Each accepted connection gets its own task running a
//! [`ConnectionHandler`]. A shared semaphore caps how many connections are
//! served at once; further clients wait in the listen backlog.

use crate::config::ServerConfig;
use crate::error::Result;
use crate::handler::{ConnectionHandler, Endpoint};
use chrono::{DateTime, Utc};
use netcache_store::ArtifactStore;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Shared state for every connection
pub struct ServerState {
    pub store: ArtifactStore,
    pub config: ServerConfig,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(store: ArtifactStore, config: ServerConfig) -> Self {
        Self {
            store,
            config,
            started_at: Utc::now(),
        }
    }
}

pub type SharedState = Arc<ServerState>;

/// Bound listeners, ready to accept
pub struct NetcacheServer {
    listeners: Vec<(Endpoint, TcpListener)>,
    state: SharedState,
}

impl NetcacheServer {
    /// Bind the configured ports. Equal fixed ports give one combined listener.
    pub async fn bind(state: SharedState) -> Result<Self> {
        let config = &state.config;
        let listeners = if config.single_port() {
            let listener = TcpListener::bind((config.bind_addr, config.upload_port)).await?;
            vec![(Endpoint::Combined, listener)]
        } else {
            let upload = TcpListener::bind((config.bind_addr, config.upload_port)).await?;
            let download = TcpListener::bind((config.bind_addr, config.download_port)).await?;
            vec![(Endpoint::Upload, upload), (Endpoint::Download, download)]
        };

        Ok(Self { listeners, state })
    }

    /// Address serving the given endpoint
    pub fn local_addr(&self, endpoint: Endpoint) -> Option<SocketAddr> {
        self.listeners
            .iter()
            .find(|(e, _)| *e == endpoint || *e == Endpoint::Combined)
            .and_then(|(_, listener)| listener.local_addr().ok())
    }

    /// Accept connections until `shutdown` completes. Connections already
    /// being served are left to finish on their own.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let permits = Arc::new(Semaphore::new(self.state.config.max_connections));

        let mut tasks = Vec::new();
        for (endpoint, listener) in self.listeners {
            if let Ok(addr) = listener.local_addr() {
                info!(endpoint = endpoint.name(), %addr, "Listening");
            }
            tasks.push(tokio::spawn(accept_loop(
                listener,
                endpoint,
                self.state.clone(),
                permits.clone(),
                shutdown_rx.clone(),
            )));
        }

        shutdown.await;
        info!("Shutting down listeners");
        let _ = shutdown_tx.send(true);

        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Listener task failed");
            }
        }
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    endpoint: Endpoint,
    state: SharedState,
    permits: Arc<Semaphore>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let permit = tokio::select! {
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown.changed() => break,
        };

        let (socket, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(endpoint = endpoint.name(), error = %e, "Accept failed");
                    drop(permit);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
            _ = shutdown.changed() => break,
        };

        if let Err(e) = socket.set_nodelay(true) {
            debug!(error = %e, "Could not set TCP_NODELAY");
        }

        let span = info_span!("connection", %peer, endpoint = endpoint.name());
        let state = state.clone();
        tokio::spawn(
            async move {
                let _permit = permit;
                debug!("Accepted connection");
                match ConnectionHandler::new(socket, endpoint, state).run().await {
                    Ok(()) => debug!("Connection closed"),
                    Err(e) => warn!(error = %e, "Connection terminated"),
                }
            }
            .instrument(span),
        );
    }

    debug!(endpoint = endpoint.name(), "Listener stopped");
}

/// Bind both endpoints and serve until Ctrl-C
pub async fn start_server(state: SharedState) -> Result<()> {
    let server = NetcacheServer::bind(state).await?;
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await
}
