//! Error types
//!
//! Only [`ValidationError`] ever reaches an API caller as a failure.
//! Everything raised at an I/O boundary is handled by the component that
//! owns that boundary.

use std::fmt;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the relay server
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Rejected catalog or config update
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request to an upstream failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Source is not a usable `ip:port` multicast address
    #[error("invalid source address: {0}")]
    InvalidSource(String),

    /// Configured multicast interface does not exist or has no IPv4 address
    #[error("network interface not usable: {0}")]
    Interface(String),

    /// Upstream answered with a non-success status
    #[error("upstream returned status {0}")]
    UpstreamStatus(u16),

    /// A recent guide download failed and is not retried yet
    #[error("guide unavailable after recent failure: {0}")]
    GuideUnavailable(String),
}

/// Why a catalog or config replacement was refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("channel group name must not be empty (group #{0})")]
    EmptyGroupName(usize),

    #[error("duplicate channel group: {0}")]
    DuplicateGroup(String),

    #[error("channel name must not be empty (group {group}, channel #{index})")]
    EmptyChannelName { group: String, index: usize },

    #[error("duplicate channel {channel} in group {group}")]
    DuplicateChannel { group: String, channel: String },

    #[error("{field} must be positive, got {value}")]
    NotPositive { field: ConfigField, value: i64 },

    #[error("{field} must be at most {max}, got {value}")]
    OutOfRange {
        field: ConfigField,
        value: i64,
        max: i64,
    },

    #[error("invalid server address: {0}")]
    ServerAddr(String),
}

/// Numeric configuration fields, named as they appear on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigField {
    McastPacketSize,
    WriteBufferSize,
    ReadTimeout,
}

impl fmt::Display for ConfigField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConfigField::McastPacketSize => "mcastPacketSize",
            ConfigField::WriteBufferSize => "writeBufferSize",
            ConfigField::ReadTimeout => "readTimeout",
        };
        f.write_str(name)
    }
}

/// Why a relay client session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Consumer closed its end of the transport
    ClientGone,
    /// A single write did not complete within the configured timeout
    WriteTimeout,
    /// Transport write failed for another reason
    WriteFailed(String),
    /// Operator dropped the client or its whole connection
    Dropped,
    /// The multicast ingest for the connection failed
    UpstreamLost(String),
    /// Server is shutting down or restarting
    Shutdown,
}

impl CloseReason {
    /// Whether the session was closed by something other than its own consumer
    pub fn is_external(&self) -> bool {
        matches!(
            self,
            CloseReason::Dropped | CloseReason::UpstreamLost(_) | CloseReason::Shutdown
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ClientGone => f.write_str("client gone"),
            CloseReason::WriteTimeout => f.write_str("write timeout"),
            CloseReason::WriteFailed(e) => write!(f, "write failed: {}", e),
            CloseReason::Dropped => f.write_str("dropped by operator"),
            CloseReason::UpstreamLost(e) => write!(f, "upstream lost: {}", e),
            CloseReason::Shutdown => f.write_str("server shutdown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_READ_TIMEOUT_MS;

    #[test]
    fn test_validation_messages_name_the_conflict() {
        let err = ValidationError::DuplicateChannel {
            group: "News".into(),
            channel: "bbc".into(),
        };
        assert_eq!(err.to_string(), "duplicate channel bbc in group News");

        let err = ValidationError::NotPositive {
            field: ConfigField::McastPacketSize,
            value: 0,
        };
        assert_eq!(err.to_string(), "mcastPacketSize must be positive, got 0");

        let err = ValidationError::OutOfRange {
            field: ConfigField::ReadTimeout,
            value: 7_200_000,
            max: MAX_READ_TIMEOUT_MS,
        };
        assert_eq!(
            err.to_string(),
            "readTimeout must be at most 3600000, got 7200000"
        );
    }

    #[test]
    fn test_validation_converts_into_error() {
        let err: Error = ValidationError::DuplicateGroup("News".into()).into();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(err.to_string(), "duplicate channel group: News");
    }

    #[test]
    fn test_close_reason_external() {
        assert!(CloseReason::Dropped.is_external());
        assert!(CloseReason::UpstreamLost("eth0 gone".into()).is_external());
        assert!(CloseReason::Shutdown.is_external());
        assert!(!CloseReason::WriteTimeout.is_external());
        assert!(!CloseReason::ClientGone.is_external());
    }
}
