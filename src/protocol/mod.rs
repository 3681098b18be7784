//! Protocol module
//!
//! Wire-level types shared by every layer.
//!
//! This module contains:
//! - `packet`: packet serialization/deserialization and size limits
//! - `identity`: device identity packets
//! - `pairing`: pair request/accept/reject packets

pub mod packet;
pub mod identity;
pub mod pairing;

pub use identity::{DeviceIdentity, DeviceType};
pub use packet::{
    Packet, Payload, MAX_IDENTITY_PACKET_SIZE, MAX_PACKET_SIZE, PACKET_TYPE_IDENTITY,
    PACKET_TYPE_PAIR, PACKET_TYPE_PING,
};
pub use pairing::PairPacket;

/// Protocol version announced in identity packets
pub const PROTOCOL_VERSION: i32 = 8;
