//! Shared handler state

use std::sync::Arc;

use tokio::sync::Notify;

use super::config::ServerConfig;
use crate::catalog::ChannelCatalog;
use crate::config::{ConfigFile, ConfigStore};
use crate::epg::{EpgCache, XmltvProvider};
use crate::error::Result;
use crate::ingest::MulticastOpener;
use crate::relay::RelayRegistry;

/// Components every route handler can reach
///
/// Built once per process and kept across restarts, so live state (the
/// catalog, the guide cache) is not reloaded when the listener rebinds.
#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<ChannelCatalog>,
    pub config: Arc<ConfigStore>,
    pub relays: Arc<RelayRegistry>,
    pub epg: Arc<EpgCache>,
    /// Where accepted updates are persisted, if anywhere
    pub file: Option<Arc<ConfigFile>>,
    /// Signalled by `POST /api/restart`
    pub restart: Arc<Notify>,
}

impl AppState {
    /// Assemble state from already built components
    pub fn new(
        catalog: Arc<ChannelCatalog>,
        config: Arc<ConfigStore>,
        relays: Arc<RelayRegistry>,
        epg: Arc<EpgCache>,
    ) -> Self {
        Self {
            catalog,
            config,
            relays,
            epg,
            file: None,
            restart: Arc::new(Notify::new()),
        }
    }

    /// Build the production components: multicast ingest and an XMLTV
    /// guide fetched over HTTP
    pub fn build(
        settings: &ServerConfig,
        catalog: Arc<ChannelCatalog>,
        config: Arc<ConfigStore>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.http_timeout)
            .build()?;

        let provider = XmltvProvider::new(client, Arc::clone(&config))
            .max_age(settings.epg_ttl)
            .retry_after(settings.epg_failure_ttl);
        let epg = EpgCache::new(Arc::new(provider))
            .ttl(settings.epg_ttl)
            .failure_ttl(settings.epg_failure_ttl);

        let relays = RelayRegistry::with_opener(
            Arc::clone(&config),
            settings.registry.clone(),
            Arc::new(MulticastOpener),
        );

        Ok(Self::new(catalog, config, Arc::new(relays), Arc::new(epg)))
    }

    /// Persist accepted updates to `file`
    pub fn with_file(mut self, file: Arc<ConfigFile>) -> Self {
        self.file = Some(file);
        self
    }
}
