//! HTTP server
//!
//! The management API and the player-facing playlist, guide and stream
//! endpoints share one axum router and one [`AppState`].

pub mod config;
pub mod error;
pub mod listener;
pub mod routes;
pub mod state;

pub use config::ServerConfig;
pub use error::ApiError;
pub use listener::{RelayServer, ServerExit};
pub use routes::router;
pub use state::AppState;
