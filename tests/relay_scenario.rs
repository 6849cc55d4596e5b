//! End-to-end relay scenario through the public API and the HTTP router

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use parking_lot::Mutex;
use tower::ServiceExt;

use iptv_relay::catalog::ChannelCatalog;
use iptv_relay::config::{Config, ConfigStore};
use iptv_relay::epg::{EpgCache, EpgProvider, Programme};
use iptv_relay::error::CloseReason;
use iptv_relay::ingest::SourceOpener;
use iptv_relay::relay::{RegistryConfig, RelayRegistry, SourceKey};
use iptv_relay::server::{router, AppState};

const SOURCE: &str = "239.1.1.1:1234";

/// Feeds each source from its own loopback socket
#[derive(Default)]
struct Loopback {
    addrs: Mutex<HashMap<SourceKey, SocketAddr>>,
}

impl Loopback {
    fn feed(&self, source: &str, datagram: &[u8]) {
        let addr = self.addrs.lock()[&SourceKey::parse(source).unwrap()];
        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(datagram, addr).unwrap();
    }
}

impl SourceOpener for Loopback {
    fn open(
        &self,
        source: &SourceKey,
        _config: &Config,
    ) -> iptv_relay::Result<std::net::UdpSocket> {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0")?;
        socket.set_nonblocking(true)?;
        self.addrs.lock().insert(*source, socket.local_addr()?);
        Ok(socket)
    }
}

struct NoGuide;

#[async_trait]
impl EpgProvider for NoGuide {
    async fn fetch(&self, _channel: &str) -> iptv_relay::Result<Vec<Programme>> {
        Ok(Vec::new())
    }
}

fn setup() -> (AppState, Arc<Loopback>) {
    let config = Arc::new(ConfigStore::new(
        Config::default()
            .server_addr("192.168.1.10:7709")
            .mcast_iface("eth0"),
    ));
    let opener = Arc::new(Loopback::default());
    let relays = RelayRegistry::with_opener(
        Arc::clone(&config),
        RegistryConfig::default(),
        Arc::clone(&opener) as Arc<dyn SourceOpener>,
    );

    let state = AppState::new(
        Arc::new(ChannelCatalog::new()),
        config,
        Arc::new(relays),
        Arc::new(EpgCache::new(Arc::new(NoGuide))),
    );
    (state, opener)
}

fn request(method: &str, uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn watch_from(uri: &str, peer: &str) -> Request<Body> {
    let addr: SocketAddr = peer.parse().unwrap();
    Request::builder()
        .uri(uri)
        .extension(ConnectInfo(addr))
        .body(Body::empty())
        .unwrap()
}

async fn json(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn ts_packet(marker: u8) -> Vec<u8> {
    let mut packet = vec![marker; 188];
    packet[0] = 0x47;
    packet
}

#[tokio::test]
async fn test_two_viewers_share_one_source_until_dropped() {
    let (state, opener) = setup();
    let app = router(state.clone());

    let catalog = r#"[{"name":"News","channels":[{"name":"bbc","sources":["239.1.1.1:1234"]}]}]"#;
    let response = app
        .clone()
        .oneshot(request("PUT", "/api/channel-groups", catalog))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let a = app
        .clone()
        .oneshot(watch_from("/iptv/channel/bbc", "10.0.0.5:50001"))
        .await
        .unwrap();
    let b = app
        .clone()
        .oneshot(watch_from("/iptv/channel/bbc", "10.0.0.6:50002"))
        .await
        .unwrap();
    assert_eq!(a.status(), StatusCode::OK);
    assert_eq!(b.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(request("GET", "/api/relays", ""))
        .await
        .unwrap();
    let relays = json(response).await;
    let relays = relays.as_array().unwrap();
    assert_eq!(relays.len(), 1);
    assert_eq!(relays[0]["addr"], SOURCE);
    assert_eq!(relays[0]["clients"].as_array().unwrap().len(), 2);

    // Both viewers receive the same packet from the single ingest socket.
    opener.feed(SOURCE, &ts_packet(0xAB));
    let conn = state.relays.get(SOURCE).unwrap();
    for _ in 0..400 {
        if conn.sessions().iter().all(|s| s.stats().packets_sent == 1) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let sessions = conn.sessions();

    let response = app
        .clone()
        .oneshot(request("DELETE", &format!("/api/relays/{}", SOURCE), ""))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    for body in [a.into_body(), b.into_body()] {
        let bytes = tokio::time::timeout(
            Duration::from_secs(2),
            axum::body::to_bytes(body, usize::MAX),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(bytes.as_ref(), ts_packet(0xAB).as_slice());
    }
    for session in sessions {
        assert_eq!(session.close_reason(), Some(CloseReason::Dropped));
    }

    let relays = json(app.oneshot(request("GET", "/api/relays", "")).await.unwrap()).await;
    assert_eq!(relays, serde_json::json!([]));
}

#[tokio::test]
async fn test_rejected_config_keeps_current() {
    let (state, _opener) = setup();
    let app = router(state.clone());

    let response = app
        .clone()
        .oneshot(request("PUT", "/api/config", r#"{"readTimeout":-5}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(state.config.get().read_timeout, 1000);

    let config = json(app.oneshot(request("GET", "/api/config", "")).await.unwrap()).await;
    assert_eq!(config["serverAddr"], "192.168.1.10:7709");
}
