//! Device identity
//!
//! The identity packet announces who a device is and what it can do. It is
//! broadcast over UDP, sent in plain text at the start of every TCP
//! connection and (protocol 8+) repeated inside TLS.

use crate::error::{ProtocolError, Result};
use crate::protocol::packet::{Packet, PACKET_TYPE_IDENTITY};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fmt;

/// Longest device id accepted from the network
pub const MAX_DEVICE_ID_LEN: usize = 64;

/// Device class advertised in the identity packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Laptop,
    Phone,
    Tablet,
    Tv,
    #[default]
    #[serde(other)]
    Unknown,
}

impl DeviceType {
    /// Wire name of the device type
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Laptop => "laptop",
            DeviceType::Phone => "phone",
            DeviceType::Tablet => "tablet",
            DeviceType::Tv => "tv",
            DeviceType::Unknown => "unknown",
        }
    }

    /// Parse a wire name; anything unrecognised is `Unknown`
    pub fn parse(value: &str) -> Self {
        match value {
            "desktop" => DeviceType::Desktop,
            "laptop" => DeviceType::Laptop,
            "phone" | "smartphone" => DeviceType::Phone,
            "tablet" => DeviceType::Tablet,
            "tv" => DeviceType::Tv,
            _ => DeviceType::Unknown,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a device as announced on the network
///
/// Never mutated in place: a fresh identity packet replaces the whole value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub device_name: String,
    pub device_type: DeviceType,
    pub protocol_version: i32,
    pub incoming_capabilities: BTreeSet<String>,
    pub outgoing_capabilities: BTreeSet<String>,
    /// TCP port the device accepts links on (absent when not listening)
    pub tcp_port: Option<u16>,
}

impl DeviceIdentity {
    /// Create an identity with no capabilities
    pub fn new(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        device_type: DeviceType,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
            device_type,
            protocol_version: crate::PROTOCOL_VERSION,
            incoming_capabilities: BTreeSet::new(),
            outgoing_capabilities: BTreeSet::new(),
            tcp_port: None,
        }
    }

    /// Builder: set advertised capabilities
    pub fn with_capabilities<I, O, S, T>(mut self, incoming: I, outgoing: O) -> Self
    where
        I: IntoIterator<Item = S>,
        O: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        self.incoming_capabilities = incoming.into_iter().map(Into::into).collect();
        self.outgoing_capabilities = outgoing.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: set the TCP listen port
    pub fn with_tcp_port(mut self, port: u16) -> Self {
        self.tcp_port = Some(port);
        self
    }

    /// Build the identity packet
    pub fn to_packet(&self) -> Packet {
        let mut body = json!({
            "deviceId": self.device_id,
            "deviceName": self.device_name,
            "deviceType": self.device_type.as_str(),
            "protocolVersion": self.protocol_version,
            "incomingCapabilities": self.incoming_capabilities,
            "outgoingCapabilities": self.outgoing_capabilities,
        });
        if let (Some(port), Some(map)) = (self.tcp_port, body.as_object_mut()) {
            map.insert("tcpPort".to_string(), Value::from(port));
        }
        Packet::new(PACKET_TYPE_IDENTITY, body)
    }

    /// Validate and read an identity packet
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        if !packet.is_type(PACKET_TYPE_IDENTITY) {
            return Err(ProtocolError::malformed(format!(
                "expected identity packet, got {}",
                packet.packet_type()
            )));
        }

        let device_id = packet
            .get_str("deviceId")
            .ok_or_else(|| ProtocolError::malformed("identity without deviceId"))?;
        validate_device_id(device_id)?;

        let device_name = packet
            .get_str("deviceName")
            .ok_or_else(|| ProtocolError::malformed("identity without deviceName"))?;

        let device_type = packet
            .get_str("deviceType")
            .map(DeviceType::parse)
            .unwrap_or_default();

        let protocol_version = packet
            .get_i64("protocolVersion")
            .and_then(|v| i32::try_from(v).ok())
            .unwrap_or(crate::PROTOCOL_VERSION);

        let tcp_port = packet
            .get_i64("tcpPort")
            .and_then(|port| u16::try_from(port).ok());

        Ok(Self {
            device_id: device_id.to_string(),
            device_name: device_name.to_string(),
            device_type,
            protocol_version,
            incoming_capabilities: string_set(packet.body.get("incomingCapabilities")),
            outgoing_capabilities: string_set(packet.body.get("outgoingCapabilities")),
            tcp_port,
        })
    }
}

/// Check a device id received from the network
///
/// Ids end up in certificate names, file names and log lines, so only a
/// conservative character set is accepted.
pub fn validate_device_id(device_id: &str) -> Result<()> {
    if device_id.is_empty() || device_id.len() > MAX_DEVICE_ID_LEN {
        return Err(ProtocolError::malformed(format!(
            "device id length {} outside 1..={}",
            device_id.len(),
            MAX_DEVICE_ID_LEN
        )));
    }
    if !device_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ProtocolError::malformed(format!(
            "device id contains invalid characters: {:?}",
            device_id
        )));
    }
    Ok(())
}

fn string_set(value: Option<&Value>) -> BTreeSet<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
