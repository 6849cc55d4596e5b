//! Relay configuration
//!
//! [`Config`] is the wire shape used by the management API and the
//! persisted file. [`ConfigStore`] holds the live, defaults-populated
//! snapshot that components read at their own start boundaries.

pub mod file;
pub mod store;

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigField, ValidationError};
use crate::net::{self, InterfaceMap};

pub use file::ConfigFile;
pub use store::ConfigStore;

/// Default XMLTV guide location
pub const DEFAULT_EPG_URL: &str = "http://epg.51zmt.top:8000/e.xml";

/// Default port of the HTTP server when the address is chosen automatically
pub const DEFAULT_HTTP_PORT: u16 = 7709;

/// Default size of one multicast datagram
pub const DEFAULT_MCAST_PACKET_SIZE: i64 = 2048;

/// Default per-client buffering budget in bytes
pub const DEFAULT_WRITE_BUFFER_SIZE: i64 = 131_072;

/// Default read/write timeout in milliseconds
pub const DEFAULT_READ_TIMEOUT_MS: i64 = 1000;

/// Largest UDP payload, so the largest datagram buffer worth allocating
pub const MAX_MCAST_PACKET_SIZE: i64 = 65_535;

/// Upper bound on the per-client buffering budget (64 MiB)
pub const MAX_WRITE_BUFFER_SIZE: i64 = 64 * 1024 * 1024;

/// Upper bound on the read/write timeout (one hour)
pub const MAX_READ_TIMEOUT_MS: i64 = 3_600_000;

/// Relay configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// HTTP listen address (`ip:port`); empty means pick one from the host
    #[serde(default)]
    pub server_addr: String,

    /// XMLTV guide URL
    #[serde(rename = "epgURL", default = "default_epg_url")]
    pub epg_url: String,

    /// Interface to join multicast groups on; empty means pick one
    #[serde(default)]
    pub mcast_iface: String,

    /// Largest multicast datagram accepted, in bytes
    #[serde(default = "default_mcast_packet_size")]
    pub mcast_packet_size: i64,

    /// Per-client buffering budget, in bytes
    #[serde(default = "default_write_buffer_size")]
    pub write_buffer_size: i64,

    /// Ingest read and client write timeout, in milliseconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout: i64,
}

fn default_epg_url() -> String {
    DEFAULT_EPG_URL.to_string()
}

fn default_mcast_packet_size() -> i64 {
    DEFAULT_MCAST_PACKET_SIZE
}

fn default_write_buffer_size() -> i64 {
    DEFAULT_WRITE_BUFFER_SIZE
}

fn default_read_timeout() -> i64 {
    DEFAULT_READ_TIMEOUT_MS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_addr: String::new(),
            epg_url: default_epg_url(),
            mcast_iface: String::new(),
            mcast_packet_size: DEFAULT_MCAST_PACKET_SIZE,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            read_timeout: DEFAULT_READ_TIMEOUT_MS,
        }
    }
}

impl Config {
    /// Set the HTTP listen address
    pub fn server_addr(mut self, addr: impl Into<String>) -> Self {
        self.server_addr = addr.into();
        self
    }

    /// Set the multicast interface
    pub fn mcast_iface(mut self, iface: impl Into<String>) -> Self {
        self.mcast_iface = iface.into();
        self
    }

    /// Set the EPG URL
    pub fn epg_url(mut self, url: impl Into<String>) -> Self {
        self.epg_url = url.into();
        self
    }

    /// Set the multicast packet size
    pub fn mcast_packet_size(mut self, size: i64) -> Self {
        self.mcast_packet_size = size;
        self
    }

    /// Set the write buffer size
    pub fn write_buffer_size(mut self, size: i64) -> Self {
        self.write_buffer_size = size;
        self
    }

    /// Set the read timeout
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout.as_millis().min(i64::MAX as u128) as i64;
        self
    }

    /// Check every field, stopping at the first problem
    pub fn validate(&self) -> Result<(), ValidationError> {
        let numeric = [
            (
                ConfigField::McastPacketSize,
                self.mcast_packet_size,
                MAX_MCAST_PACKET_SIZE,
            ),
            (
                ConfigField::WriteBufferSize,
                self.write_buffer_size,
                MAX_WRITE_BUFFER_SIZE,
            ),
            (ConfigField::ReadTimeout, self.read_timeout, MAX_READ_TIMEOUT_MS),
        ];
        for (field, value, max) in numeric {
            if value <= 0 {
                return Err(ValidationError::NotPositive { field, value });
            }
            if value > max {
                return Err(ValidationError::OutOfRange { field, value, max });
            }
        }

        if !self.server_addr.is_empty() && self.server_addr.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::ServerAddr(self.server_addr.clone()));
        }

        Ok(())
    }

    /// Largest datagram accepted by an ingestor
    pub fn packet_size(&self) -> usize {
        self.mcast_packet_size.max(1) as usize
    }

    /// Per-client buffering budget
    pub fn buffer_size(&self) -> usize {
        self.write_buffer_size.max(1) as usize
    }

    /// Ingest read and client write timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout.max(1) as u64)
    }

    /// Listen address, falling back to all interfaces on the default port
    pub fn listen_addr(&self) -> SocketAddr {
        self.server_addr
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], DEFAULT_HTTP_PORT)))
    }

    /// Fill in the server address and multicast interface from the host
    pub fn populate_defaults(&mut self) {
        if self.server_addr.is_empty() || self.mcast_iface.is_empty() {
            self.populate_from(net::interfaces_and_ips());
        }
    }

    /// Fill in missing addresses from an interface listing
    ///
    /// The multicast interface prefers one that does not carry the HTTP
    /// server address, so control traffic and multicast stay apart.
    pub fn populate_from(&mut self, mut interfaces: InterfaceMap) {
        if self.epg_url.is_empty() {
            self.epg_url = default_epg_url();
        }

        if !self.server_addr.is_empty() && !self.mcast_iface.is_empty() {
            return;
        }

        if interfaces.is_empty() {
            if self.server_addr.is_empty() {
                self.server_addr = format!("0.0.0.0:{}", DEFAULT_HTTP_PORT);
            }
            return;
        }

        if interfaces.len() == 1 {
            if self.server_addr.is_empty() {
                if let Some(ip) = net::find_best_ip(&interfaces) {
                    self.server_addr = format!("{}:{}", ip, DEFAULT_HTTP_PORT);
                }
            } else if self.mcast_iface.is_empty() {
                if let Some(name) = interfaces.keys().next() {
                    self.mcast_iface = name.clone();
                }
            }
            return;
        }

        if !self.mcast_iface.is_empty() {
            interfaces.remove(&self.mcast_iface);
        }

        if self.server_addr.is_empty() {
            if let Some(ip) = net::find_best_ip(&interfaces) {
                self.server_addr = format!("{}:{}", ip, DEFAULT_HTTP_PORT);
            }
        }

        if self.mcast_iface.is_empty() {
            let http_iface = interfaces
                .iter()
                .find(|(_, ips)| {
                    ips.iter()
                        .any(|ip| self.server_addr.starts_with(&format!("{}:", ip)))
                })
                .map(|(name, _)| name.clone());
            if let Some(name) = http_iface {
                interfaces.remove(&name);
            }
            if let Some(name) = interfaces.keys().next() {
                self.mcast_iface = name.clone();
            }
        }
    }
}
