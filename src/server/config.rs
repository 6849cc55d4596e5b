//! Server configuration
//!
//! Process-level settings that are not part of the persisted [`Config`]:
//! they are fixed for the lifetime of the process and survive restarts.
//!
//! [`Config`]: crate::config::Config

use std::net::SocketAddr;
use std::time::Duration;

use crate::epg::{DEFAULT_FAILURE_TTL, DEFAULT_TTL};
use crate::relay::RegistryConfig;

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to, overriding `serverAddr` from the configuration
    pub bind_addr: Option<SocketAddr>,

    /// Relay registry tuning
    pub registry: RegistryConfig,

    /// Lifetime of cached guide listings
    pub epg_ttl: Duration,

    /// Lifetime of the empty listing cached after a failed guide fetch
    pub epg_failure_ttl: Duration,

    /// Timeout for requests to the guide upstream
    pub http_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: None,
            registry: RegistryConfig::default(),
            epg_ttl: DEFAULT_TTL,
            epg_failure_ttl: DEFAULT_FAILURE_TTL,
            http_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Create a new config with a fixed bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: Some(addr),
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    /// Set the relay registry tuning
    pub fn registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = registry;
        self
    }

    /// Set the guide cache lifetime
    pub fn epg_ttl(mut self, ttl: Duration) -> Self {
        self.epg_ttl = ttl;
        self
    }

    /// Set the lifetime of failed guide fetches
    pub fn epg_failure_ttl(mut self, ttl: Duration) -> Self {
        self.epg_failure_ttl = ttl;
        self
    }

    /// Set the guide upstream timeout
    pub fn http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }
}
