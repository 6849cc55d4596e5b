//! Multicast IPTV to HTTP relay
//!
//! Joins multicast MPEG-TS groups on demand and fans each one out to any
//! number of HTTP clients. One ingest socket serves every viewer of a
//! group; slow viewers lose their oldest queued packets instead of
//! stalling the others.
//!
//! Alongside the relay the server keeps a channel catalog, exports it as
//! M3U or DIYP text playlists and serves an XMLTV programme guide.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use iptv_relay::catalog::ChannelCatalog;
//! use iptv_relay::config::{Config, ConfigStore};
//! use iptv_relay::server::{AppState, RelayServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.populate_defaults();
//!
//!     let settings = ServerConfig::default();
//!     let state = AppState::build(
//!         &settings,
//!         Arc::new(ChannelCatalog::new()),
//!         Arc::new(ConfigStore::new(config)),
//!     )?;
//!
//!     let server = RelayServer::new(settings, state);
//!     server
//!         .run_until(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod epg;
pub mod error;
pub mod ingest;
pub mod net;
pub mod relay;
pub mod server;
pub mod stats;

pub use error::{Error, Result};
pub use server::{RelayServer, ServerConfig, ServerExit};
