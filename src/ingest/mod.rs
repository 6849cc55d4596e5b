//! Multicast ingest
//!
//! One ingest task per relay connection. The task owns a UDP socket
//! joined to the source group, reads datagrams into a reusable buffer,
//! strips any RTP framing and publishes the MPEG-TS bytes to the
//! connection's fan-out. It never waits on clients.

pub mod rtp;
#[cfg(test)]
pub(crate) mod testing;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::net;
use crate::relay::{RelayConnection, SourceKey};

/// Opens the socket an ingestor reads from
///
/// The registry goes through this seam so tests can feed a connection
/// from a loopback socket instead of a multicast group.
pub trait SourceOpener: Send + Sync + 'static {
    /// Open a non-blocking UDP socket receiving `source`
    fn open(&self, source: &SourceKey, config: &Config) -> Result<std::net::UdpSocket>;
}

/// Joins the multicast group on the configured interface
#[derive(Debug, Default, Clone, Copy)]
pub struct MulticastOpener;

impl SourceOpener for MulticastOpener {
    fn open(&self, source: &SourceKey, config: &Config) -> Result<std::net::UdpSocket> {
        if !source.is_multicast() {
            return Err(Error::InvalidSource(format!(
                "{} is not a multicast group",
                source
            )));
        }

        let interface = if config.mcast_iface.is_empty() {
            Ipv4Addr::UNSPECIFIED
        } else {
            net::interface_ipv4(&config.mcast_iface)
                .ok_or_else(|| Error::Interface(config.mcast_iface.clone()))?
        };

        let group = source.addr();
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;

        // Binding the group address filters out other groups sharing the
        // port; Windows only accepts the wildcard.
        #[cfg(unix)]
        let bind_addr = SocketAddrV4::new(*group.ip(), group.port());
        #[cfg(not(unix))]
        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port());

        socket.bind(&SocketAddr::V4(bind_addr).into())?;
        socket.join_multicast_v4(group.ip(), &interface)?;
        socket.set_nonblocking(true)?;

        if let Err(e) = socket.set_recv_buffer_size(config.buffer_size()) {
            tracing::debug!(source = %source, error = %e, "Could not size receive buffer");
        }

        tracing::debug!(
            source = %source,
            iface = %config.mcast_iface,
            interface_ip = %interface,
            "Joined multicast group"
        );

        Ok(socket.into())
    }
}

/// Parameters an ingestor reads once at start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestSettings {
    /// Largest datagram relayed; longer ones are truncated
    pub packet_size: usize,
    /// Longest tolerated silence before the source counts as lost
    pub read_timeout: Duration,
}

impl IngestSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            packet_size: config.packet_size(),
            read_timeout: config.timeout(),
        }
    }
}

/// Stop handle held by the relay connection
#[derive(Debug)]
pub struct IngestHandle {
    cancel: CancellationToken,
}

impl IngestHandle {
    /// Ask the read loop to finish
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// How an ingest task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestExit {
    /// Stopped through its handle
    Stopped,
    /// Socket failed or the source went silent
    Lost(String),
}

/// Reads one source and publishes into one connection
pub struct MulticastIngestor {
    conn: Arc<RelayConnection>,
    socket: UdpSocket,
    settings: IngestSettings,
    cancel: CancellationToken,
}

impl MulticastIngestor {
    /// Spawn the read loop for `conn`
    ///
    /// `socket` must already be non-blocking. Must be called from within
    /// a tokio runtime.
    pub fn start(
        conn: Arc<RelayConnection>,
        socket: std::net::UdpSocket,
        settings: IngestSettings,
    ) -> Result<(IngestHandle, JoinHandle<IngestExit>)> {
        let socket = UdpSocket::from_std(socket)?;
        let cancel = CancellationToken::new();

        let ingestor = Self {
            conn,
            socket,
            settings,
            cancel: cancel.clone(),
        };

        tracing::info!(
            source = %ingestor.conn.source(),
            packet_size = settings.packet_size,
            read_timeout_ms = settings.read_timeout.as_millis() as u64,
            "Ingest started"
        );

        let task = tokio::spawn(ingestor.read_loop());
        Ok((IngestHandle { cancel }, task))
    }

    async fn read_loop(self) -> IngestExit {
        let source = self.conn.source();
        let packet_size = self.settings.packet_size;
        // One spare byte tells a datagram that exactly fits from one that
        // was cut by the kernel.
        let mut buf = vec![0u8; packet_size + 1];

        let exit = loop {
            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break IngestExit::Stopped,
                read = tokio::time::timeout(
                    self.settings.read_timeout,
                    self.socket.recv_from(&mut buf),
                ) => read,
            };

            let n = match read {
                Ok(Ok((n, _))) => n,
                Ok(Err(e)) => {
                    tracing::warn!(source = %source, error = %e, "Multicast read failed");
                    break IngestExit::Lost(e.to_string());
                }
                Err(_) => {
                    tracing::warn!(
                        source = %source,
                        timeout_ms = self.settings.read_timeout.as_millis() as u64,
                        "No data from source"
                    );
                    break IngestExit::Lost(format!(
                        "no data for {} ms",
                        self.settings.read_timeout.as_millis()
                    ));
                }
            };
            if n == 0 {
                continue;
            }

            let counters = self.conn.counters();
            counters.record_datagram(n);

            let n = if n > packet_size {
                counters.record_truncated();
                tracing::debug!(source = %source, packet_size, "Datagram truncated");
                packet_size
            } else {
                n
            };

            match rtp::extract_payload(&buf[..n]) {
                Some(payload) => {
                    self.conn.publish(Bytes::copy_from_slice(payload));
                }
                None => {
                    counters.record_rejected();
                    tracing::debug!(source = %source, len = n, "Datagram carries no MPEG-TS");
                }
            }
        };

        let stats = self.conn.stats();
        tracing::info!(
            source = %source,
            datagrams = stats.datagrams,
            bytes = stats.bytes_received,
            truncated = stats.truncated,
            rejected = stats.rejected,
            "Ingest finished"
        );

        exit
    }
}
