//! Per-connection command loop
//!
//! A handler reads one frame, runs the command, writes the response and
//! waits for the next frame on the same connection. Any protocol violation
//! or failed transfer ends the connection without a response.

use crate::error::{NetcacheError, Result};
use crate::protocol::{read_frame, write_header, write_payload, Command, Frame, NOT_FOUND};
use crate::server::SharedState;
use crate::types::StatsResponse;
use chrono::Utc;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info};

/// Which listener a connection arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Privileged: STORE, RECLAIM, RESET
    Upload,
    /// Unprivileged: FETCH
    Download,
    /// Single-port mode, every command allowed
    Combined,
}

impl Endpoint {
    pub fn name(self) -> &'static str {
        match self {
            Endpoint::Upload => "upload",
            Endpoint::Download => "download",
            Endpoint::Combined => "combined",
        }
    }

    pub fn permits(self, command: &Command) -> bool {
        match command {
            Command::List | Command::Stats | Command::Close => true,
            Command::Store { .. } | Command::Reclaim | Command::Reset => self != Endpoint::Download,
            Command::Fetch { .. } => self != Endpoint::Upload,
        }
    }
}

enum Flow {
    Continue,
    Close,
}

pub struct ConnectionHandler<S> {
    stream: S,
    endpoint: Endpoint,
    state: SharedState,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, endpoint: Endpoint, state: SharedState) -> Self {
        Self {
            stream,
            endpoint,
            state,
        }
    }

    /// Serve commands until the client sends CLOSE, disconnects, or breaks
    /// the protocol
    pub async fn run(mut self) -> Result<()> {
        loop {
            let Some(frame) = self.next_frame().await? else {
                debug!("Peer disconnected");
                return Ok(());
            };

            let command = Command::parse(&frame)?;
            if !self.endpoint.permits(&command) {
                return Err(NetcacheError::Protocol(format!(
                    "{} is not permitted on the {} endpoint",
                    command.name(),
                    self.endpoint.name()
                )));
            }

            debug!(command = command.name(), "Dispatching");
            if let Flow::Close = self.dispatch(command).await? {
                let _ = self.stream.shutdown().await;
                return Ok(());
            }
        }
    }

    async fn next_frame(&mut self) -> Result<Option<Frame>> {
        match self.state.config.idle_timeout {
            Some(limit) => tokio::time::timeout(limit, read_frame(&mut self.stream))
                .await
                .map_err(|_| NetcacheError::IdleTimeout)?,
            None => read_frame(&mut self.stream).await,
        }
    }

    async fn dispatch(&mut self, command: Command) -> Result<Flow> {
        match command {
            Command::List => {
                let keys = self.state.store.list_keys().await;
                write_payload(&mut self.stream, keys.join("\n").as_bytes()).await?;
            }
            Command::Store {
                key,
                artifact,
                size,
            } => {
                self.store(&key, &artifact, size).await?;
            }
            Command::Fetch { key, artifact } => {
                self.fetch(&key, &artifact).await?;
            }
            Command::Reclaim => {
                let config = &self.state.config;
                self.state
                    .store
                    .reclaim(config.max_cache_size, config.clean_ratio)
                    .await;
                self.acknowledge().await?;
            }
            Command::Reset => {
                let removed = self.state.store.reset().await?;
                info!(removed, "Reset requested by client");
            }
            Command::Stats => {
                let response = StatsResponse {
                    status: "ok".to_string(),
                    uptime_secs: (Utc::now() - self.state.started_at).num_seconds().max(0) as u64,
                    capacity: self.state.config.max_cache_size,
                    target_ratio: self.state.config.clean_ratio,
                    cache: self.state.store.stats().await,
                };
                let body = serde_json::to_vec(&response)?;
                write_payload(&mut self.stream, &body).await?;
            }
            Command::Close => return Ok(Flow::Close),
        }
        Ok(Flow::Continue)
    }

    /// Empty response for RECLAIM. STORE and RESET send nothing.
    async fn acknowledge(&mut self) -> Result<()> {
        write_header(&mut self.stream, 0).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn store(&mut self, key: &str, artifact: &str, size: u64) -> Result<()> {
        let buffer_size = self.state.config.buffer_size;
        let total = self
            .state
            .store
            .store(key, artifact, &mut self.stream, size, buffer_size)
            .await?;
        debug!(key, artifact, size, total, "Stored");
        Ok(())
    }

    async fn fetch(&mut self, key: &str, artifact: &str) -> Result<()> {
        let Some(fetched) = self.state.store.open_artifact(key, artifact).await? else {
            write_header(&mut self.stream, NOT_FOUND).await?;
            self.stream.flush().await?;
            return Ok(());
        };

        let size = fetched.size;
        let length = i64::try_from(size).map_err(|_| {
            NetcacheError::Protocol(format!("artifact of {} bytes is too large to frame", size))
        })?;
        write_header(&mut self.stream, length).await?;

        let mut reader =
            BufReader::with_capacity(self.state.config.buffer_size, fetched.file.take(size));
        let sent = tokio::io::copy_buf(&mut reader, &mut self.stream).await?;
        if sent != size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("artifact shrank while sending: {} of {} bytes", sent, size),
            )
            .into());
        }
        self.stream.flush().await?;

        self.state.store.touch(key).await;
        debug!(key, artifact, size, "Fetched");
        Ok(())
    }
}
