//! Live configuration snapshot with change notification

use std::sync::Arc;

use tokio::sync::watch;

use super::Config;
use crate::error::ValidationError;

/// Holds the current [`Config`]
///
/// Readers get an `Arc` snapshot. A replacement swaps the snapshot and then
/// wakes every receiver handed out by [`ConfigStore::on_change`]. Live
/// ingestors and sessions keep the snapshot they started with.
#[derive(Debug)]
pub struct ConfigStore {
    tx: watch::Sender<Arc<Config>>,
}

impl ConfigStore {
    /// Create a store holding `config` as given
    ///
    /// The initial value is trusted (it already went through loading and
    /// default population).
    pub fn new(config: Config) -> Self {
        let (tx, _) = watch::channel(Arc::new(config));
        Self { tx }
    }

    /// Current configuration
    pub fn get(&self) -> Arc<Config> {
        Arc::clone(&self.tx.borrow())
    }

    /// Validate and install a new configuration
    ///
    /// Defaults are populated after validation, so empty addresses are
    /// accepted. On error the current configuration is left untouched.
    pub fn replace(&self, mut config: Config) -> Result<Arc<Config>, ValidationError> {
        config.validate()?;
        config.populate_defaults();
        Ok(self.install(config))
    }

    /// Swap in an already validated configuration
    pub(crate) fn install(&self, config: Config) -> Arc<Config> {
        let config = Arc::new(config);
        self.tx.send_replace(Arc::clone(&config));

        tracing::info!(
            server_addr = %config.server_addr,
            mcast_iface = %config.mcast_iface,
            packet_size = config.mcast_packet_size,
            write_buffer_size = config.write_buffer_size,
            read_timeout_ms = config.read_timeout,
            "Configuration replaced"
        );

        config
    }

    /// Subscribe to configuration changes
    pub fn on_change(&self) -> watch::Receiver<Arc<Config>> {
        self.tx.subscribe()
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new(Config::default())
    }
}
