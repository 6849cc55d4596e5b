//! Loopback stand-in for multicast sockets

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::SourceOpener;
use crate::config::Config;
use crate::error::Result;
use crate::relay::SourceKey;

/// Feeds connections from loopback sockets instead of multicast groups
///
/// Each opened source gets its own socket on `127.0.0.1`; send datagrams
/// to [`LoopbackOpener::addr`] to feed it.
#[derive(Debug, Default)]
pub struct LoopbackOpener {
    opened: AtomicUsize,
    addrs: Mutex<HashMap<SourceKey, SocketAddr>>,
}

impl LoopbackOpener {
    pub fn addr(&self, source: &str) -> SocketAddr {
        self.addrs.lock()[&SourceKey::parse(source).unwrap()]
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl SourceOpener for LoopbackOpener {
    fn open(&self, source: &SourceKey, _config: &Config) -> Result<std::net::UdpSocket> {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0")?;
        socket.set_nonblocking(true)?;
        self.addrs.lock().insert(*source, socket.local_addr()?);
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(socket)
    }
}
