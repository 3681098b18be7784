//! Error types for connect-link-core

use std::io;
use thiserror::Error;

/// Result type alias using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Protocol error types
///
/// Every failure in the discovery, link, trust and pairing layers is one of
/// these. Errors never cross entity boundaries: a failing link or provider
/// reports through its own event channel and nothing else is torn down.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TLS/SSL error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Certificate error
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Configuration could not be read, parsed or validated
    #[error("Configuration error: {0}")]
    Config(String),

    /// Socket or TLS session failure; the link is torn down
    #[error("Transport error: {0}")]
    Transport(String),

    /// Invalid JSON or missing mandatory packet fields
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// Identity packet too large for a UDP broadcast
    #[error("Packet too large: {size} bytes (max {max})")]
    OversizedPacket { size: usize, max: usize },

    /// Peer broke the wire protocol (oversized frame, bad handshake)
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// An already trusted device presented a different certificate
    #[error("Trust violation for device {device_id}: expected {expected}, got {presented}")]
    TrustViolation {
        device_id: String,
        expected: String,
        presented: String,
    },

    /// Pairing request was not answered in time
    #[error("Pairing timed out")]
    PairingTimeout,

    /// Pairing operation invalid in the current state
    #[error("Pairing error: {0}")]
    Pairing(String),

    /// No free TCP port in the configured range
    #[error("No available port in range {start}-{end}")]
    NoAvailablePort { start: u16, end: u16 },

    /// Device has no reachable link
    #[error("Device not reachable: {0}")]
    NotReachable(String),

    /// Not paired
    #[error("Device not paired: {0}")]
    NotPaired(String),

    /// The link was already disconnected
    #[error("Link closed")]
    LinkClosed,

    /// Plugin error
    #[error("Plugin error: {0}")]
    Plugin(String),

    /// Already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl ProtocolError {
    /// Create a Transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a TLS error
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    /// Create a Certificate error
    pub fn certificate(msg: impl Into<String>) -> Self {
        Self::Certificate(msg.into())
    }

    /// Create a MalformedPacket error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedPacket(msg.into())
    }

    /// Create a ProtocolViolation error
    pub fn violation(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    /// Create a Pairing error
    pub fn pairing(msg: impl Into<String>) -> Self {
        Self::Pairing(msg.into())
    }

    /// Create a Plugin error
    pub fn plugin(msg: impl Into<String>) -> Self {
        Self::Plugin(msg.into())
    }

    /// Create an Other error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether this error means the underlying session is unusable
    ///
    /// Transport and protocol failures tear a link down; everything else
    /// is reported to the caller and the link stays up.
    pub fn is_fatal_to_link(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Tls(_)
                | Self::Transport(_)
                | Self::ProtocolViolation(_)
                | Self::MalformedPacket(_)
        )
    }
}

// Implement From for common error types
impl From<rustls::Error> for ProtocolError {
    fn from(err: rustls::Error) -> Self {
        Self::Tls(err.to_string())
    }
}

impl From<rcgen::Error> for ProtocolError {
    fn from(err: rcgen::Error) -> Self {
        Self::Certificate(err.to_string())
    }
}

impl From<toml::de::Error> for ProtocolError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for ProtocolError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Config(err.to_string())
    }
}
