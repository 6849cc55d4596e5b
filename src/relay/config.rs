//! Relay registry tuning

use std::time::Duration;

/// Registry settings that are not part of the persisted configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long a connection with no clients is kept before it is retired
    ///
    /// A client that re-attaches within this window reuses the running
    /// ingest instead of rejoining the group.
    pub detach_grace: Duration,

    /// Upper bound on queue slots per session
    pub max_queue_slots: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            detach_grace: Duration::from_secs(2),
            max_queue_slots: 1024,
        }
    }
}

impl RegistryConfig {
    /// Set the detach grace period
    pub fn detach_grace(mut self, grace: Duration) -> Self {
        self.detach_grace = grace;
        self
    }

    /// Set the per-session queue slot limit
    pub fn max_queue_slots(mut self, slots: usize) -> Self {
        self.max_queue_slots = slots;
        self
    }
}
