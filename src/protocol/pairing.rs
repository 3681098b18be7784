//! Pair packets
//!
//! A single packet type carries the whole pairing conversation:
//!
//! | body | meaning |
//! |---|---|
//! | `{"pair": true, "timestamp": 1700000000}` | request (or mutual request) |
//! | `{"pair": true}` | accept |
//! | `{"pair": false}` | reject, cancel or unpair |

use crate::error::{ProtocolError, Result};
use crate::protocol::packet::{Packet, PACKET_TYPE_PAIR};
use serde_json::json;
use std::time::{SystemTime, UNIX_EPOCH};

/// Decoded pair packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairPacket {
    /// `true` for request/accept, `false` for reject/unpair
    pub pair: bool,
    /// Unix seconds at which the peer started pairing (requests only)
    pub timestamp: Option<i64>,
}

impl PairPacket {
    /// Pair request stamped with the current time
    pub fn request() -> Self {
        Self {
            pair: true,
            timestamp: Some(unix_seconds()),
        }
    }

    /// Pair accept
    pub fn accept() -> Self {
        Self {
            pair: true,
            timestamp: None,
        }
    }

    /// Reject, cancel or unpair
    pub fn reject() -> Self {
        Self {
            pair: false,
            timestamp: None,
        }
    }

    /// Build the wire packet
    pub fn to_packet(&self) -> Packet {
        let body = match self.timestamp {
            Some(ts) => json!({ "pair": self.pair, "timestamp": ts }),
            None => json!({ "pair": self.pair }),
        };
        Packet::new(PACKET_TYPE_PAIR, body)
    }

    /// Validate and read a pair packet
    pub fn parse(packet: &Packet) -> Result<Self> {
        if !packet.is_type(PACKET_TYPE_PAIR) {
            return Err(ProtocolError::malformed(format!(
                "expected pair packet, got {}",
                packet.packet_type()
            )));
        }
        let pair = packet
            .get_bool("pair")
            .ok_or_else(|| ProtocolError::malformed("pair packet without boolean 'pair'"))?;
        Ok(Self {
            pair,
            timestamp: packet.get_i64("timestamp"),
        })
    }
}

pub(crate) fn unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
