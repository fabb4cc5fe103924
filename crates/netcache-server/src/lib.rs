//! netcache server library
//!
//! A TCP build-artifact cache. Clients store and fetch named artifacts under
//! a cache key over a fixed-frame protocol; the server keeps an in-memory
//! recency index of the on-disk cache and trims it on request.

pub mod config;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod server;
pub mod types;

pub use config::ServerConfig;
pub use error::{NetcacheError, Result};
pub use handler::{ConnectionHandler, Endpoint};
pub use protocol::{Command, HEADER_SIZE, NOT_FOUND};
pub use server::{start_server, NetcacheServer, ServerState, SharedState};
pub use types::StatsResponse;
