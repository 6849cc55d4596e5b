//! Relay registry
//!
//! Maps each source to its live relay connection. All attach, detach and
//! drop decisions for a source happen under that source's map entry, so an
//! attach can never land in a connection that is being torn down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::io::AsyncWrite;
use tokio::task::JoinHandle;

use super::config::RegistryConfig;
use super::connection::{Departure, RelayConnection, RelayInfo};
use super::packet::SourceKey;
use super::queue::slots_for;
use super::session::RelayClientSession;
use crate::config::{Config, ConfigStore};
use crate::error::{CloseReason, Result};
use crate::ingest::{IngestExit, IngestSettings, MulticastIngestor, MulticastOpener, SourceOpener};

/// Owner of every relay connection
pub struct RelayRegistry {
    connections: DashMap<SourceKey, Arc<RelayConnection>>,
    config: Arc<ConfigStore>,
    settings: RegistryConfig,
    opener: Arc<dyn SourceOpener>,
    next_session_id: AtomicU64,
}

impl RelayRegistry {
    /// Create a registry that joins real multicast groups
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self::with_opener(config, RegistryConfig::default(), Arc::new(MulticastOpener))
    }

    /// Create a registry with custom settings and socket opener
    pub fn with_opener(
        config: Arc<ConfigStore>,
        settings: RegistryConfig,
        opener: Arc<dyn SourceOpener>,
    ) -> Self {
        Self {
            connections: DashMap::new(),
            config,
            settings,
            opener,
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Registry settings
    pub fn settings(&self) -> &RegistryConfig {
        &self.settings
    }

    /// Attach a consumer to `source`
    ///
    /// Creates the connection and starts its ingest on first use. The
    /// session's writer loop is spawned onto `writer` and detaches the
    /// session when it ends. Buffer sizing and timeouts come from the
    /// configuration current at this call.
    pub fn attach<W>(
        self: &Arc<Self>,
        source: &str,
        client_addr: impl Into<String>,
        writer: W,
    ) -> Result<Arc<RelayClientSession>>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let key = SourceKey::parse(source)?;
        let client_addr = client_addr.into();
        let config = self.config.get();
        let slots = slots_for(
            config.buffer_size(),
            config.packet_size(),
            self.settings.max_queue_slots,
        );
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);

        let (conn, session) = match self.connections.entry(key) {
            Entry::Occupied(mut occupied) => {
                let existing = Arc::clone(occupied.get());
                match existing.attach(session_id, client_addr.clone(), slots) {
                    Some(session) => (existing, session),
                    None => {
                        // Closed but not yet removed; start over.
                        let (conn, session) =
                            self.open_connection(key, session_id, client_addr, slots, &config)?;
                        occupied.insert(Arc::clone(&conn));
                        (conn, session)
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let (conn, session) =
                    self.open_connection(key, session_id, client_addr, slots, &config)?;
                vacant.insert(Arc::clone(&conn));
                (conn, session)
            }
        };

        tracing::info!(
            source = %key,
            client = %session.addr(),
            session_id = session.id(),
            clients = conn.client_count(),
            queue_slots = session.queue_capacity(),
            "Relay client attached"
        );

        self.spawn_writer(conn, Arc::clone(&session), writer, config.timeout());
        Ok(session)
    }

    fn open_connection(
        self: &Arc<Self>,
        key: SourceKey,
        session_id: u64,
        client_addr: String,
        slots: usize,
        config: &Config,
    ) -> Result<(Arc<RelayConnection>, Arc<RelayClientSession>)> {
        let socket = self.opener.open(&key, config)?;
        let (conn, session) =
            RelayConnection::with_first_client(key, session_id, client_addr, slots);

        let (handle, task) = MulticastIngestor::start(
            Arc::clone(&conn),
            socket,
            IngestSettings::from_config(config),
        )?;
        conn.set_ingest(handle);
        self.spawn_monitor(Arc::clone(&conn), task);

        tracing::info!(source = %key, iface = %config.mcast_iface, "Relay connection created");

        Ok((conn, session))
    }

    /// Tear the connection down when its ingest fails
    fn spawn_monitor(self: &Arc<Self>, conn: Arc<RelayConnection>, task: JoinHandle<IngestExit>) {
        let registry = Arc::clone(self);

        tokio::spawn(async move {
            let exit = match task.await {
                Ok(exit) => exit,
                Err(e) => IngestExit::Lost(format!("ingest task failed: {}", e)),
            };

            if let IngestExit::Lost(reason) = exit {
                registry
                    .connections
                    .remove_if(&conn.source(), |_, current| Arc::ptr_eq(current, &conn));
                conn.drop_all(CloseReason::UpstreamLost(reason));
            }
        });
    }

    fn spawn_writer<W>(
        self: &Arc<Self>,
        conn: Arc<RelayConnection>,
        session: Arc<RelayClientSession>,
        writer: W,
        write_timeout: Duration,
    ) where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let registry = Arc::clone(self);

        tokio::spawn(async move {
            let reason = session.run(writer, write_timeout).await;
            registry.detach(&conn, &session, &reason);
        });
    }

    fn detach(
        self: &Arc<Self>,
        conn: &Arc<RelayConnection>,
        session: &RelayClientSession,
        reason: &CloseReason,
    ) {
        // Already removed when an operator dropped it or the connection
        // closed; whoever removed it owns the idle check.
        let departure = conn.detach(session);
        let stats = session.stats();
        let closed_by = if reason.is_external() { "relay" } else { "client" };

        tracing::info!(
            source = %conn.source(),
            client = %session.addr(),
            session_id = session.id(),
            reason = %reason,
            closed_by = closed_by,
            sent = stats.packets_sent,
            bytes = stats.bytes_sent,
            dropped = stats.packets_dropped,
            drop_pct = stats.drop_ratio(),
            duration_ms = session.duration().as_millis() as u64,
            remaining = conn.client_count(),
            "Relay client detached"
        );

        if let Some(departure) = departure {
            if departure.remaining == 0 && !conn.is_closed() {
                self.schedule_idle_check(Arc::clone(conn), departure);
            }
        }
    }

    /// Retire `conn` one grace period after `departure` unless its
    /// membership changed in the meantime
    fn schedule_idle_check(self: &Arc<Self>, conn: Arc<RelayConnection>, departure: Departure) {
        let registry = Arc::clone(self);
        let grace = self.settings.detach_grace;

        tokio::spawn(async move {
            tokio::time::sleep(grace).await;

            let retired = registry
                .connections
                .remove_if(&conn.source(), |_, current| {
                    Arc::ptr_eq(current, &conn) && current.retire_if_idle(departure.epoch)
                })
                .is_some();

            if retired {
                tracing::info!(source = %conn.source(), "Relay connection retired (no clients)");
            }
        });
    }

    /// Connection for `source`, if any
    pub fn get(&self, source: &str) -> Option<Arc<RelayConnection>> {
        let key = SourceKey::parse(source).ok()?;
        self.connections.get(&key).map(|c| Arc::clone(c.value()))
    }

    /// Management view of every connection, ordered by source address
    pub fn list(&self) -> Vec<RelayInfo> {
        let mut infos: Vec<RelayInfo> = self
            .connections
            .iter()
            .filter(|entry| !entry.value().is_closed())
            .map(|entry| entry.value().info())
            .collect();
        infos.sort_by(|a, b| a.addr.cmp(&b.addr));
        infos
    }

    /// Drop a whole connection and every client on it
    ///
    /// Returns `false` when no connection exists for `source`.
    pub fn drop_connection(&self, source: &str) -> bool {
        let Ok(key) = SourceKey::parse(source) else {
            return false;
        };

        match self.connections.remove(&key) {
            Some((_, conn)) => {
                conn.drop_all(CloseReason::Dropped);
                true
            }
            None => {
                tracing::debug!(source = %key, "Drop requested for unknown connection");
                false
            }
        }
    }

    /// Drop one client of a connection
    ///
    /// Returns `false` when the connection or client does not exist.
    pub fn drop_client(self: &Arc<Self>, source: &str, client_addr: &str) -> bool {
        let Some(conn) = self.get(source) else {
            return false;
        };

        match conn.remove_client(client_addr, CloseReason::Dropped) {
            Some(departure) => {
                tracing::info!(
                    source = %conn.source(),
                    client = %client_addr,
                    remaining = departure.remaining,
                    "Relay client dropped"
                );
                if departure.remaining == 0 {
                    self.schedule_idle_check(conn, departure);
                }
                true
            }
            None => false,
        }
    }

    /// Close every connection
    ///
    /// Used before a restart or exit. Returns how many connections were
    /// closed.
    pub fn shutdown(&self) -> usize {
        let keys: Vec<SourceKey> = self.connections.iter().map(|e| *e.key()).collect();

        let mut closed = 0;
        for key in keys {
            if let Some((_, conn)) = self.connections.remove(&key) {
                conn.drop_all(CloseReason::Shutdown);
                closed += 1;
            }
        }

        tracing::info!(connections = closed, "Relay registry drained");
        closed
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of attached clients across all connections
    pub fn client_count(&self) -> usize {
        self.connections
            .iter()
            .map(|entry| entry.value().client_count())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, DuplexStream};

    use crate::error::Error;
    use crate::ingest::testing::LoopbackOpener;

    const SOURCE: &str = "239.1.1.1:1234";

    fn registry_with(
        read_timeout: Duration,
        grace: Duration,
    ) -> (Arc<RelayRegistry>, Arc<LoopbackOpener>) {
        let config = Config::default()
            .server_addr("127.0.0.1:7709")
            .mcast_iface("lo")
            .read_timeout(read_timeout);
        let opener = Arc::new(LoopbackOpener::default());
        let registry = RelayRegistry::with_opener(
            Arc::new(ConfigStore::new(config)),
            RegistryConfig::default().detach_grace(grace),
            Arc::clone(&opener) as Arc<dyn SourceOpener>,
        );
        (Arc::new(registry), opener)
    }

    fn registry() -> (Arc<RelayRegistry>, Arc<LoopbackOpener>) {
        registry_with(Duration::from_secs(10), Duration::from_secs(10))
    }

    fn consumer() -> (DuplexStream, DuplexStream) {
        tokio::io::duplex(64 * 1024)
    }

    fn ts(len: usize) -> Vec<u8> {
        let mut v = vec![0u8; len];
        v[0] = 0x47;
        v
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_clients_share_one_connection() {
        let (registry, opener) = registry();
        let (a, _ra) = consumer();
        let (b, _rb) = consumer();

        registry.attach(SOURCE, "10.0.0.1:1000", a).unwrap();
        registry.attach(SOURCE, "10.0.0.2:1000", b).unwrap();

        let list = registry.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].addr, SOURCE);
        assert_eq!(list[0].clients.len(), 2);
        assert_eq!(opener.opened(), 1);
    }

    #[tokio::test]
    async fn test_invalid_source_rejected() {
        let (registry, opener) = registry();
        let (a, _ra) = consumer();

        let result = registry.attach("not-an-address", "10.0.0.1:1000", a);
        assert!(matches!(result, Err(Error::InvalidSource(_))));
        assert_eq!(registry.connection_count(), 0);
        assert_eq!(opener.opened(), 0);
    }

    #[tokio::test]
    async fn test_relays_bytes_to_every_client() {
        let (registry, opener) = registry();
        let (a, mut ra) = consumer();
        let (b, mut rb) = consumer();
        registry.attach(SOURCE, "10.0.0.1:1000", a).unwrap();
        registry.attach(SOURCE, "10.0.0.2:1000", b).unwrap();

        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&ts(188), opener.addr(SOURCE)).unwrap();

        let mut buf = [0u8; 188];
        ra.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[0], 0x47);
        rb.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[0], 0x47);
    }

    #[tokio::test]
    async fn test_drop_connection_closes_every_client() {
        let (registry, _opener) = registry();
        let (a, _ra) = consumer();
        let (b, _rb) = consumer();
        let first = registry.attach(SOURCE, "10.0.0.1:1000", a).unwrap();
        let second = registry.attach(SOURCE, "10.0.0.2:1000", b).unwrap();

        assert!(registry.drop_connection(SOURCE));

        assert!(registry.list().is_empty());
        assert!(!first.is_alive());
        assert!(!second.is_alive());
        assert_eq!(first.close_reason(), Some(CloseReason::Dropped));
        assert!(!registry.drop_connection(SOURCE));
    }

    #[tokio::test]
    async fn test_drop_client_keeps_others() {
        let (registry, _opener) = registry();
        let (a, _ra) = consumer();
        let (b, _rb) = consumer();
        let first = registry.attach(SOURCE, "10.0.0.1:1000", a).unwrap();
        let second = registry.attach(SOURCE, "10.0.0.2:1000", b).unwrap();

        assert!(registry.drop_client(SOURCE, "10.0.0.1:1000"));
        assert!(!registry.drop_client(SOURCE, "10.0.0.1:1000"));
        assert!(!registry.drop_client("239.9.9.9:1", "10.0.0.2:1000"));

        let list = registry.list();
        assert_eq!(list[0].clients.len(), 1);
        assert_eq!(list[0].clients[0].addr, "10.0.0.2:1000");
        assert!(!first.is_alive());
        assert!(second.is_alive());
    }

    #[tokio::test]
    async fn test_reattach_within_grace_reuses_ingest() {
        let (registry, opener) = registry();
        let (a, _ra) = consumer();
        registry.attach(SOURCE, "10.0.0.1:1000", a).unwrap();
        assert!(registry.drop_client(SOURCE, "10.0.0.1:1000"));

        let (b, _rb) = consumer();
        registry.attach(SOURCE, "10.0.0.2:1000", b).unwrap();

        assert_eq!(opener.opened(), 1);
        assert_eq!(registry.list()[0].clients.len(), 1);
    }

    #[tokio::test]
    async fn test_last_detach_retires_connection() {
        let (registry, _opener) = registry_with(Duration::from_secs(10), Duration::from_millis(20));
        let (a, _ra) = consumer();
        let session = registry.attach(SOURCE, "10.0.0.1:1000", a).unwrap();
        let conn = registry.get(SOURCE).unwrap();

        assert!(registry.drop_client(SOURCE, "10.0.0.1:1000"));
        wait_for(|| registry.connection_count() == 0).await;

        assert!(conn.is_closed());
        assert!(!session.is_alive());
    }

    #[tokio::test]
    async fn test_grace_measured_from_last_departure() {
        let (registry, opener) = registry_with(Duration::from_secs(10), Duration::from_millis(400));
        let (a, _ra) = consumer();
        registry.attach(SOURCE, "10.0.0.1:1000", a).unwrap();
        let conn = registry.get(SOURCE).unwrap();

        assert!(registry.drop_client(SOURCE, "10.0.0.1:1000"));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let (b, _rb) = consumer();
        registry.attach(SOURCE, "10.0.0.2:1000", b).unwrap();
        assert!(registry.drop_client(SOURCE, "10.0.0.2:1000"));

        // Past the grace of the first departure, inside the second.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(registry.connection_count(), 1);
        assert!(!conn.is_closed());
        assert_eq!(opener.opened(), 1);

        wait_for(|| registry.connection_count() == 0).await;
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_consumer_disconnect_detaches() {
        let (registry, opener) = registry_with(Duration::from_secs(10), Duration::from_millis(20));
        let (a, ra) = consumer();
        let session = registry.attach(SOURCE, "10.0.0.1:1000", a).unwrap();
        drop(ra);

        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&ts(188), opener.addr(SOURCE)).unwrap();

        wait_for(|| registry.connection_count() == 0).await;
        assert_eq!(session.close_reason(), Some(CloseReason::ClientGone));
    }

    #[tokio::test]
    async fn test_silent_source_is_upstream_lost() {
        let (registry, _opener) = registry_with(Duration::from_millis(50), Duration::from_secs(10));
        let (a, _ra) = consumer();
        let session = registry.attach(SOURCE, "10.0.0.1:1000", a).unwrap();

        wait_for(|| registry.connection_count() == 0).await;
        assert!(matches!(
            session.close_reason(),
            Some(CloseReason::UpstreamLost(_))
        ));
    }

    #[tokio::test]
    async fn test_stalled_client_removed_others_continue() {
        let (registry, opener) = registry_with(Duration::from_millis(300), Duration::from_secs(10));
        let (slow, _slow_reader) = tokio::io::duplex(256);
        let (fast, mut fast_reader) = consumer();
        let slow_session = registry.attach(SOURCE, "10.0.0.1:1000", slow).unwrap();
        let fast_session = registry.attach(SOURCE, "10.0.0.2:1000", fast).unwrap();

        let target = opener.addr(SOURCE);
        let feeder = tokio::spawn(async move {
            let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
            loop {
                let _ = sender.send_to(&ts(188), target).await;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });
        let drain = tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            while let Ok(n) = fast_reader.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        });

        wait_for(|| !slow_session.is_alive()).await;
        assert_eq!(slow_session.close_reason(), Some(CloseReason::WriteTimeout));
        wait_for(|| registry.list()[0].clients.len() == 1).await;

        let sent_before = fast_session.stats().packets_sent;
        wait_for(|| fast_session.stats().packets_sent > sent_before).await;
        assert!(fast_session.is_alive());

        feeder.abort();
        drain.abort();
    }

    #[tokio::test]
    async fn test_shutdown_drains_everything() {
        let (registry, _opener) = registry();
        let (a, _ra) = consumer();
        let (b, _rb) = consumer();
        let first = registry.attach(SOURCE, "10.0.0.1:1000", a).unwrap();
        let second = registry.attach("239.1.1.2:1234", "10.0.0.1:1001", b).unwrap();

        assert_eq!(registry.client_count(), 2);
        assert_eq!(registry.shutdown(), 2);
        assert_eq!(registry.connection_count(), 0);
        assert_eq!(first.close_reason(), Some(CloseReason::Shutdown));
        assert_eq!(second.close_reason(), Some(CloseReason::Shutdown));
    }

    #[tokio::test]
    async fn test_list_is_sorted() {
        let (registry, _opener) = registry();
        let (a, _ra) = consumer();
        let (b, _rb) = consumer();
        registry.attach("239.1.1.2:1234", "10.0.0.1:1000", a).unwrap();
        registry.attach("239.1.1.1:1234", "10.0.0.1:1001", b).unwrap();

        let addrs: Vec<String> = registry.list().into_iter().map(|r| r.addr).collect();
        assert_eq!(addrs, vec!["239.1.1.1:1234", "239.1.1.2:1234"]);
    }
}
