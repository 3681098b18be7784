//! Device Event System
//!
//! Everything a device reports to its host arrives as one of these events
//! on the channel returned when the device was spawned.

use super::pairing::PairState;
use crate::network::link::SendTag;
use crate::protocol::DeviceIdentity;

/// Events emitted by a device actor
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// The peer asked to pair
    PairRequest {
        /// Short code both users can compare, if it could be computed
        verification_key: Option<String>,
    },

    /// Our request was not answered in time
    PairTimeout,

    /// Pairing completed and the peer is trusted
    PairSuccess,

    /// The peer rejected or withdrew a request
    PairRejected,

    /// Pairing was removed by either side
    Unpaired,

    /// A link was attached or lost
    ReachabilityChanged { reachable: bool },

    /// The set of packet types routed to plugins changed
    PluginsChanged { routed_types: Vec<String> },

    /// The current link went away
    LinkDestroyed { reason: Option<String> },

    SendSucceeded { tag: SendTag },

    SendFailed { tag: SendTag, error: String },

    /// A trusted device presented a different certificate
    TrustViolation { expected: String, presented: String },

    PingReceived { message: Option<String> },

    PayloadProgress {
        tag: Option<SendTag>,
        packet_id: i64,
        transferred: u64,
        total: Option<u64>,
    },

    PayloadFailed {
        tag: Option<SendTag>,
        packet_id: i64,
        error: String,
    },

    /// The peer announced a new identity
    IdentityUpdated { identity: DeviceIdentity },
}

impl DeviceEvent {
    /// Check if this event is part of the pairing conversation
    pub fn is_pairing(&self) -> bool {
        matches!(
            self,
            DeviceEvent::PairRequest { .. }
                | DeviceEvent::PairTimeout
                | DeviceEvent::PairSuccess
                | DeviceEvent::PairRejected
                | DeviceEvent::Unpaired
        )
    }

    /// Pair state implied by a pairing outcome, if any
    pub fn resulting_pair_state(&self) -> Option<PairState> {
        match self {
            DeviceEvent::PairRequest { .. } => Some(PairState::RequestedByPeer),
            DeviceEvent::PairSuccess => Some(PairState::Paired),
            DeviceEvent::PairTimeout | DeviceEvent::PairRejected | DeviceEvent::Unpaired => {
                Some(PairState::NotPaired)
            }
            _ => None,
        }
    }

    /// Check if this is a security event
    pub fn is_security(&self) -> bool {
        matches!(self, DeviceEvent::TrustViolation { .. })
    }
}
