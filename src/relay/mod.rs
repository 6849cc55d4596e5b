//! Live relay of multicast sources to HTTP consumers
//!
//! # Architecture
//!
//! ```text
//!                         Arc<RelayRegistry>
//!                    ┌──────────────────────────┐
//!                    │ connections: DashMap<    │
//!                    │   SourceKey,             │
//!                    │   RelayConnection {      │
//!                    │     ingest handle,       │
//!                    │     sessions,            │
//!                    │   }                      │
//!                    │ >                        │
//!                    └────────────┬─────────────┘
//!                                 │
//!   [MulticastIngestor] ──► publish() ──┬──► SessionQueue ──► run() ──► HTTP body
//!     recv_from()                       ├──► SessionQueue ──► run() ──► HTTP body
//!                                       └──► SessionQueue ──► run() ──► HTTP body
//! ```
//!
//! # Backpressure
//!
//! `publish` never waits. Every session has a bounded queue; when it is
//! full the oldest packet is discarded and counted. A consumer that cannot
//! take one write within the read timeout is closed. Neither case affects
//! the ingest or the other sessions.
//!
//! Payloads are `bytes::Bytes`, so all queues share one allocation per
//! datagram.

pub mod config;
pub mod connection;
pub mod packet;
pub mod queue;
pub mod registry;
pub mod session;

pub use config::RegistryConfig;
pub use connection::{ClientInfo, ConnectionState, Departure, RelayConnection, RelayInfo};
pub use packet::{RelayPacket, SourceKey};
pub use queue::SessionQueue;
pub use registry::RelayRegistry;
pub use session::RelayClientSession;
