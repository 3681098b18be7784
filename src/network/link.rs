//! Link abstraction
//!
//! A link is one authenticated session bound to exactly one peer device id.
//! Sending only enqueues; completions, received packets and the end of the
//! link are reported as [`LinkEvent`]s on the channel handed out when the
//! link was created.

use crate::error::Result;
use crate::protocol::{DeviceIdentity, Packet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Caller-chosen tag identifying one `send_packet` call in completion events
pub type SendTag = i64;

/// Receiving end of a link's event channel
pub type LinkEventReceiver = mpsc::UnboundedReceiver<LinkEvent>;

/// Process-unique link identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

impl LinkId {
    /// Allocate the next identifier
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Which side opened the TCP connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDirection {
    /// We connected to the peer
    Outbound,
    /// The peer connected to our listen socket
    Inbound,
}

/// Events emitted by a link
#[derive(Debug)]
pub enum LinkEvent {
    /// A packet arrived; packets announcing a payload carry the received file
    PacketReceived(Packet),

    /// The packet sent with `tag` (and its payload, if any) was delivered
    SendSucceeded { tag: SendTag },

    /// The packet sent with `tag` could not be delivered; nothing is retried
    SendFailed { tag: SendTag, error: String },

    /// Bytes moved on a payload side channel
    PayloadProgress {
        /// Send tag for outgoing payloads, `None` for incoming ones
        tag: Option<SendTag>,
        packet_id: i64,
        transferred: u64,
        total: Option<u64>,
    },

    /// A payload side channel failed; the link itself stays up
    PayloadFailed {
        tag: Option<SendTag>,
        packet_id: i64,
        error: String,
    },

    /// The link is gone; emitted exactly once
    Destroyed {
        /// `None` for a local `disconnect()`
        reason: Option<String>,
    },
}

impl LinkEvent {
    /// Check if this is the final event of the link
    pub fn is_destroyed(&self) -> bool {
        matches!(self, LinkEvent::Destroyed { .. })
    }

    /// Send tag this event completes, if any
    pub fn tag(&self) -> Option<SendTag> {
        match self {
            LinkEvent::SendSucceeded { tag } | LinkEvent::SendFailed { tag, .. } => Some(*tag),
            LinkEvent::PayloadProgress { tag, .. } | LinkEvent::PayloadFailed { tag, .. } => *tag,
            _ => None,
        }
    }
}

/// One authenticated session with a peer
pub trait Link: Send + Sync + fmt::Debug {
    fn id(&self) -> LinkId;

    /// Device id the session is bound to
    fn device_id(&self) -> &str;

    /// Identity the peer announced while the link was set up
    fn peer_identity(&self) -> &DeviceIdentity;

    /// DER certificate the peer presented
    fn peer_certificate(&self) -> &[u8];

    /// SHA-256 fingerprint of [`Link::peer_certificate`]
    fn peer_fingerprint(&self) -> &str;

    fn direction(&self) -> LinkDirection;

    /// Whether the link still accepts packets
    fn is_open(&self) -> bool;

    /// Queue a packet; the outcome is reported for `tag`
    ///
    /// Fails with `LinkClosed` once the link is destroyed.
    fn send_packet(&self, packet: Packet, tag: SendTag) -> Result<()>;

    /// Close the link
    ///
    /// Idempotent and safe to call from inside event handling.
    fn disconnect(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_ids_are_unique() {
        let a = LinkId::next();
        let b = LinkId::next();
        assert_ne!(a, b);
        assert!(b > a);
        assert!(a.to_string().starts_with("link#"));
    }

    #[test]
    fn test_event_tags() {
        assert_eq!(LinkEvent::SendSucceeded { tag: 7 }.tag(), Some(7));
        let failed = LinkEvent::PayloadFailed {
            tag: None,
            packet_id: 1,
            error: "reset".to_string(),
        };
        assert_eq!(failed.tag(), None);
        assert!(LinkEvent::Destroyed { reason: None }.is_destroyed());
        assert!(!failed.is_destroyed());
    }
}
