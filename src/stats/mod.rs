//! Relay statistics

pub mod metrics;

pub use metrics::{ConnectionStats, IngestCounters, SessionCounters, SessionStats};
