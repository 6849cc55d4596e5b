//! Relay keys and the packets fanned out to sessions

use std::fmt;
use std::net::SocketAddrV4;
use std::str::FromStr;

use bytes::Bytes;

use crate::error::{Error, Result};

/// Identifies a relay source: a multicast group and port (`ip:port`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceKey(SocketAddrV4);

impl SourceKey {
    /// Parse `ip:port`, surrounding whitespace ignored
    pub fn parse(s: &str) -> Result<Self> {
        s.trim()
            .parse::<SocketAddrV4>()
            .map(Self)
            .map_err(|_| Error::InvalidSource(s.to_string()))
    }

    /// Group address and port
    pub fn addr(&self) -> SocketAddrV4 {
        self.0
    }

    /// Whether the address is in the IPv4 multicast range
    pub fn is_multicast(&self) -> bool {
        self.0.ip().is_multicast()
    }
}

impl FromStr for SourceKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One ingested payload
///
/// Cheap to clone: every session queue holds a reference to the same
/// allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayPacket {
    /// Position in the connection's ingest order, starting at 0
    pub seq: u64,
    /// MPEG-TS bytes
    pub data: Bytes,
}

impl RelayPacket {
    pub fn new(seq: u64, data: Bytes) -> Self {
        Self { seq, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
