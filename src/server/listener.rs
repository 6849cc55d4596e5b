//! HTTP server listener
//!
//! Binds the listen address, serves the router and drains every relay
//! connection before returning.

use std::future::Future;
use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::error::Result;
use crate::server::config::ServerConfig;
use crate::server::routes;
use crate::server::state::AppState;

/// Why [`RelayServer::run_until`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerExit {
    /// The shutdown future completed
    Shutdown,
    /// `POST /api/restart` was called; rebind with the current config
    Restart,
}

/// Relay HTTP server
pub struct RelayServer {
    config: ServerConfig,
    state: AppState,
}

impl RelayServer {
    pub fn new(config: ServerConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Shared handler state
    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn router(&self) -> Router {
        routes::router(self.state.clone())
    }

    /// Address the next `run_until` binds
    ///
    /// The explicit override wins, otherwise `serverAddr` from the live
    /// configuration is used.
    pub fn bind_addr(&self) -> SocketAddr {
        self.config
            .bind_addr
            .unwrap_or_else(|| self.state.config.get().listen_addr())
    }

    /// Serve until `shutdown` completes or a restart is requested
    pub async fn run_until<F>(&self, shutdown: F) -> Result<ServerExit>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.bind_addr();
        let listener = TcpListener::bind(addr).await?;
        self.run_with_listener(listener, shutdown).await
    }

    /// Serve on an already bound listener
    pub async fn run_with_listener<F>(
        &self,
        listener: TcpListener,
        shutdown: F,
    ) -> Result<ServerExit>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::info!(addr = %listener.local_addr()?, "HTTP server listening");

        let (exit_tx, mut exit_rx) = oneshot::channel();
        let restart = self.state.restart.clone();
        let relays = self.state.relays.clone();

        let signal = async move {
            let exit = tokio::select! {
                _ = shutdown => {
                    tracing::info!("Shutdown signal received");
                    ServerExit::Shutdown
                }
                _ = restart.notified() => {
                    tracing::info!("Restarting HTTP server");
                    ServerExit::Restart
                }
            };

            // Streaming responses never end on their own; closing every
            // session lets graceful shutdown complete.
            let drained = relays.shutdown();
            tracing::info!(connections = drained, "Relay connections drained");

            let _ = exit_tx.send(exit);
        };

        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await?;

        // The signal future is the only way out of a clean serve.
        Ok(exit_rx.try_recv().unwrap_or(ServerExit::Shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::catalog::{Channel, ChannelCatalog, ChannelGroup};
    use crate::config::{Config, ConfigStore};
    use crate::epg::{EpgCache, EpgProvider, Programme};
    use crate::ingest::testing::LoopbackOpener;
    use crate::ingest::SourceOpener;
    use crate::relay::{RegistryConfig, RelayRegistry};

    struct NoGuide;

    #[async_trait::async_trait]
    impl EpgProvider for NoGuide {
        async fn fetch(&self, _channel: &str) -> Result<Vec<Programme>> {
            Ok(Vec::new())
        }
    }

    fn server() -> (RelayServer, Arc<LoopbackOpener>) {
        let config = Arc::new(ConfigStore::new(
            Config::default()
                .server_addr("127.0.0.1:0")
                .mcast_iface("lo"),
        ));
        let opener = Arc::new(LoopbackOpener::default());
        let relays = RelayRegistry::with_opener(
            Arc::clone(&config),
            RegistryConfig::default(),
            Arc::clone(&opener) as Arc<dyn SourceOpener>,
        );
        let catalog = ChannelCatalog::with_groups(vec![ChannelGroup::new(
            "News",
            vec![Channel::new("bbc", vec!["239.1.1.1:1234".into()])],
        )])
        .unwrap();

        let state = AppState::new(
            Arc::new(catalog),
            config,
            Arc::new(relays),
            Arc::new(EpgCache::new(Arc::new(NoGuide))),
        );
        (RelayServer::new(ServerConfig::default(), state), opener)
    }

    #[test]
    fn test_bind_addr_override() {
        let (server, _) = server();
        assert_eq!(server.bind_addr(), "127.0.0.1:0".parse().unwrap());

        let state = server.state().clone();
        let config = ServerConfig::with_addr("127.0.0.1:9999".parse().unwrap());
        let server = RelayServer::new(config, state);
        assert_eq!(server.bind_addr(), "127.0.0.1:9999".parse().unwrap());
    }

    #[tokio::test]
    async fn test_restart_request_ends_serve() {
        let (server, _) = server();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let task = tokio::spawn(async move {
            server
                .run_with_listener(listener, std::future::pending())
                .await
        });

        let client = reqwest::Client::new();
        let body = client
            .get(format!("http://{}/api/channel-groups", addr))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        let groups: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(groups[0]["name"], "News");

        let status = client
            .post(format!("http://{}/api/restart", addr))
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status.as_u16(), 202);

        let exit = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit, ServerExit::Restart);
    }

    #[tokio::test]
    async fn test_shutdown_drains_streaming_clients() {
        let (server, _opener) = server();
        let relays = Arc::clone(&server.state().relays);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            server
                .run_with_listener(listener, async move {
                    let _ = stop_rx.await;
                })
                .await
        });

        let response = reqwest::get(format!("http://{}/iptv/channel/bbc", addr))
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(relays.client_count(), 1);

        stop_tx.send(()).unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit, ServerExit::Shutdown);
        assert_eq!(relays.connection_count(), 0);

        // The stream ends instead of hanging once its session is closed.
        let body = tokio::time::timeout(Duration::from_secs(5), response.bytes()).await;
        assert!(body.is_ok());
    }
}
