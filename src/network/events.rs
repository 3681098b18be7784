//! Provider Event System
//!
//! This module defines events emitted by link providers.

use super::link::{Link, LinkDirection, LinkEventReceiver};
use crate::protocol::DeviceIdentity;
use std::net::SocketAddr;
use std::sync::Arc;

/// Events emitted by a link provider
#[derive(Debug)]
pub enum ProviderEvent {
    /// Sockets are bound and the first broadcast went out
    Started {
        /// Port the link listener is bound to
        tcp_port: u16,
    },

    /// Sockets are closed; existing links are unaffected
    Stopped,

    /// A link finished its handshake
    ConnectionReceived {
        /// Identity the peer announced during the handshake
        identity: DeviceIdentity,
        /// The new link
        link: Arc<dyn Link>,
        /// Event stream of the new link
        events: LinkEventReceiver,
        /// Which side opened the connection
        direction: LinkDirection,
    },

    /// A discovery datagram arrived
    IdentityReceived {
        identity: DeviceIdentity,
        /// Source address of the datagram
        address: SocketAddr,
    },

    /// A failure confined to one attempt or socket
    Error {
        /// Error message
        message: String,
    },
}

impl ProviderEvent {
    /// Check if this is a new connection event
    pub fn is_connection(&self) -> bool {
        matches!(self, ProviderEvent::ConnectionReceived { .. })
    }

    /// Check if this is an error event
    pub fn is_error(&self) -> bool {
        matches!(self, ProviderEvent::Error { .. })
    }

    /// Get device ID if this event is device-related
    pub fn device_id(&self) -> Option<&str> {
        match self {
            ProviderEvent::ConnectionReceived { identity, .. } => Some(&identity.device_id),
            ProviderEvent::IdentityReceived { identity, .. } => Some(&identity.device_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DeviceType;

    #[test]
    fn test_event_type_checking() {
        let identity = DeviceIdentity::new("test_id", "Test", DeviceType::Desktop);
        let address = "192.168.1.100:1716".parse().unwrap();

        let received = ProviderEvent::IdentityReceived { identity, address };
        assert!(!received.is_connection());
        assert!(!received.is_error());
        assert_eq!(received.device_id(), Some("test_id"));

        let error = ProviderEvent::Error {
            message: "bind failed".to_string(),
        };
        assert!(error.is_error());
        assert_eq!(error.device_id(), None);

        let started = ProviderEvent::Started { tcp_port: 1716 };
        assert_eq!(started.device_id(), None);
    }
}
