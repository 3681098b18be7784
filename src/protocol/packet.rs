//! Network packet wire format
//!
//! Every packet is a single-line UTF-8 JSON object terminated by `\n`:
//!
//! ```json
//! {"id":1700000000000,"type":"kdeconnect.ping","body":{}}
//! ```
//!
//! `id`, `type` and `body` are mandatory. Packets announcing a payload also
//! carry `payloadSize` and a `payloadTransferInfo` object describing the
//! side channel (currently only `port` is read). Unknown body keys and
//! unknown packet types are kept as-is so that newer peers keep working.

use crate::error::{ProtocolError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum encoded size of an identity packet (they travel over UDP)
pub const MAX_IDENTITY_PACKET_SIZE: usize = 8192;

/// Maximum size of any received frame (32 MiB)
pub const MAX_PACKET_SIZE: usize = 32 * 1024 * 1024;

/// Identity announcement
pub const PACKET_TYPE_IDENTITY: &str = "kdeconnect.identity";

/// Pair request / response / unpair
pub const PACKET_TYPE_PAIR: &str = "kdeconnect.pair";

/// Connectivity check
pub const PACKET_TYPE_PING: &str = "kdeconnect.ping";

/// Binary data that travels next to a packet on the side channel
///
/// Never serialized into the control packet itself; only `payloadSize` and
/// `payloadTransferInfo` are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Data held in memory
    Bytes(Bytes),
    /// Data stored in a file
    File(PathBuf),
}

/// A protocol packet
#[derive(Debug, Clone, Serialize)]
pub struct Packet {
    /// Sender-assigned id (milliseconds since the epoch by default)
    pub id: i64,

    /// Packet type, fixed at construction
    #[serde(rename = "type")]
    packet_type: String,

    /// Packet body (always a JSON object on the wire)
    pub body: Value,

    /// Side-channel description for packets with a payload
    #[serde(rename = "payloadTransferInfo", skip_serializing_if = "Option::is_none")]
    pub payload_transfer_info: Option<Map<String, Value>>,

    /// Size of the payload in bytes
    #[serde(rename = "payloadSize", skip_serializing_if = "Option::is_none")]
    pub payload_size: Option<i64>,

    #[serde(skip)]
    payload: Option<Payload>,
}

/// Shape used while decoding, so missing fields can be reported precisely
#[derive(Deserialize)]
struct RawPacket {
    id: Option<Value>,
    #[serde(rename = "type")]
    packet_type: Option<String>,
    body: Option<Value>,
    #[serde(rename = "payloadTransferInfo", default)]
    payload_transfer_info: Option<Map<String, Value>>,
    #[serde(rename = "payloadSize", default)]
    payload_size: Option<i64>,
}

impl Packet {
    /// Create a packet with a timestamp id
    pub fn new(packet_type: impl Into<String>, body: Value) -> Self {
        Self::with_id(current_millis(), packet_type, body)
    }

    /// Create a packet with an explicit id
    pub fn with_id(id: i64, packet_type: impl Into<String>, body: Value) -> Self {
        Self {
            id,
            packet_type: packet_type.into(),
            body,
            payload_transfer_info: None,
            payload_size: None,
            payload: None,
        }
    }

    /// Packet type
    pub fn packet_type(&self) -> &str {
        &self.packet_type
    }

    /// Check the packet type
    pub fn is_type(&self, packet_type: &str) -> bool {
        self.packet_type == packet_type
    }

    /// Identity, pair and ping packets are handled by the core itself
    pub fn is_core_type(&self) -> bool {
        matches!(
            self.packet_type.as_str(),
            PACKET_TYPE_IDENTITY | PACKET_TYPE_PAIR | PACKET_TYPE_PING
        )
    }

    /// Read a string body field
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }

    /// Read a boolean body field
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.body.get(key).and_then(Value::as_bool)
    }

    /// Read an integer body field
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.body.get(key).and_then(Value::as_i64)
    }

    /// Builder: declare a payload size without attaching data
    pub fn with_payload_size(mut self, size: i64) -> Self {
        self.payload_size = Some(size);
        self
    }

    /// Builder: attach in-memory payload data
    pub fn with_payload_bytes(mut self, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        self.payload_size = Some(data.len() as i64);
        self.payload = Some(Payload::Bytes(data));
        self
    }

    /// Builder: attach a file payload of known size
    pub fn with_payload_file(mut self, path: impl Into<PathBuf>, size: u64) -> Self {
        self.payload_size = Some(size as i64);
        self.payload = Some(Payload::File(path.into()));
        self
    }

    /// Attached payload data, if any
    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    /// Detach the payload data
    pub fn take_payload(&mut self) -> Option<Payload> {
        self.payload.take()
    }

    pub(crate) fn set_payload(&mut self, payload: Payload) {
        self.payload = Some(payload);
    }

    /// Port of the payload side channel announced by the sender
    pub fn payload_port(&self) -> Option<u16> {
        self.payload_transfer_info
            .as_ref()
            .and_then(|info| info.get("port"))
            .and_then(Value::as_u64)
            .and_then(|port| u16::try_from(port).ok())
    }

    /// Set the side channel port
    pub fn set_payload_port(&mut self, port: u16) {
        self.payload_transfer_info
            .get_or_insert_with(Map::new)
            .insert("port".to_string(), Value::from(port));
    }

    /// Whether the receiver must fetch a payload for this packet
    pub fn expects_payload(&self) -> bool {
        self.payload_port().is_some()
    }

    /// Serialize to the wire format (JSON + `\n`)
    ///
    /// Identity packets larger than [`MAX_IDENTITY_PACKET_SIZE`] are refused
    /// because they have to fit a UDP datagram.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if !self.body.is_object() {
            return Err(ProtocolError::malformed("body must be a JSON object"));
        }

        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');

        if self.is_type(PACKET_TYPE_IDENTITY) && bytes.len() > MAX_IDENTITY_PACKET_SIZE {
            return Err(ProtocolError::OversizedPacket {
                size: bytes.len(),
                max: MAX_IDENTITY_PACKET_SIZE,
            });
        }

        Ok(bytes)
    }

    /// Parse one frame
    ///
    /// A trailing `\n` (or `\r\n`) is accepted. Frames over
    /// [`MAX_PACKET_SIZE`] are rejected before any parsing.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() > MAX_PACKET_SIZE {
            return Err(ProtocolError::violation(format!(
                "frame of {} bytes exceeds {} bytes",
                data.len(),
                MAX_PACKET_SIZE
            )));
        }

        let trimmed = trim_line_end(data);
        let raw: RawPacket = serde_json::from_slice(trimmed)
            .map_err(|e| ProtocolError::malformed(format!("invalid JSON: {}", e)))?;

        let id = match raw.id {
            Some(Value::Number(n)) => n
                .as_i64()
                .ok_or_else(|| ProtocolError::malformed("id is not an integer"))?,
            // Some older peers send the id as a string
            Some(Value::String(s)) => s
                .parse::<i64>()
                .map_err(|_| ProtocolError::malformed("id is not an integer"))?,
            Some(_) => return Err(ProtocolError::malformed("id is not an integer")),
            None => return Err(ProtocolError::malformed("missing id")),
        };
        let packet_type = raw
            .packet_type
            .ok_or_else(|| ProtocolError::malformed("missing type"))?;
        let body = raw
            .body
            .ok_or_else(|| ProtocolError::malformed("missing body"))?;
        if !body.is_object() {
            return Err(ProtocolError::malformed("body is not an object"));
        }

        Ok(Self {
            id,
            packet_type,
            body,
            payload_transfer_info: raw.payload_transfer_info,
            payload_size: raw.payload_size,
            payload: None,
        })
    }
}

impl PartialEq for Packet {
    /// Wire equality: the attached payload data is not compared
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.packet_type == other.packet_type
            && self.body == other.body
            && self.payload_transfer_info == other.payload_transfer_info
            && self.payload_size == other.payload_size
    }
}

/// Serialize a packet to its wire form
pub fn serialize(packet: &Packet) -> Result<Vec<u8>> {
    packet.to_bytes()
}

/// Deserialize one wire frame
pub fn deserialize(data: &[u8]) -> Result<Packet> {
    Packet::from_bytes(data)
}

fn trim_line_end(data: &[u8]) -> &[u8] {
    let data = data.strip_suffix(b"\n").unwrap_or(data);
    data.strip_suffix(b"\r").unwrap_or(data)
}

fn current_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_packet_creation() {
        let packet = Packet::new(PACKET_TYPE_PING, json!({}));
        assert_eq!(packet.packet_type(), "kdeconnect.ping");
        assert!(packet.id > 0);
        assert!(packet.is_core_type());
        assert!(!packet.expects_payload());
    }

    #[test]
    fn test_serialize_is_single_line() {
        let packet = Packet::with_id(42, "kdeconnect.clipboard", json!({"content": "a\nb"}));
        let bytes = packet.to_bytes().unwrap();

        assert_eq!(bytes.last(), Some(&b'\n'));
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);

        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.contains("\"type\":\"kdeconnect.clipboard\""));
        assert!(!text.contains("payloadSize"));
    }

    #[test]
    fn test_round_trip_preserves_fields() {
        let body = json!({
            "nested": {"list": [1, 2, 3], "flag": true},
            "futureKey": "kept",
            "ratio": 0.5,
        });
        let original = Packet::with_id(7, "kdeconnect.share.request", body.clone());
        let decoded = Packet::from_bytes(&original.to_bytes().unwrap()).unwrap();

        assert_eq!(decoded.id, 7);
        assert_eq!(decoded.packet_type(), "kdeconnect.share.request");
        assert_eq!(decoded.body, body);
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_payload_fields_round_trip() {
        let mut packet = Packet::with_id(1, "kdeconnect.share.request", json!({"filename": "a.txt"}))
            .with_payload_bytes(vec![1u8, 2, 3]);
        packet.set_payload_port(1739);

        let text = String::from_utf8(packet.to_bytes().unwrap()).unwrap();
        assert!(text.contains("\"payloadSize\":3"));
        assert!(text.contains("\"payloadTransferInfo\":{\"port\":1739}"));

        let decoded = Packet::from_bytes(text.as_bytes()).unwrap();
        assert_eq!(decoded.payload_size, Some(3));
        assert_eq!(decoded.payload_port(), Some(1739));
        assert!(decoded.expects_payload());
        assert!(decoded.payload().is_none());
    }

    #[test]
    fn test_oversized_identity_rejected() {
        let packet = Packet::new(
            PACKET_TYPE_IDENTITY,
            json!({"deviceId": "x", "deviceName": "n".repeat(MAX_IDENTITY_PACKET_SIZE)}),
        );
        let err = packet.to_bytes().unwrap_err();
        assert!(matches!(err, ProtocolError::OversizedPacket { max: 8192, .. }));
    }

    #[test]
    fn test_large_non_identity_packet_allowed() {
        let packet = Packet::new("kdeconnect.clipboard", json!({"content": "x".repeat(20_000)}));
        assert!(packet.to_bytes().is_ok());
    }

    #[test]
    fn test_missing_fields_are_malformed() {
        for frame in [
            r#"{"type":"kdeconnect.ping","body":{}}"#,
            r#"{"id":1,"body":{}}"#,
            r#"{"id":1,"type":"kdeconnect.ping"}"#,
            r#"{"id":1,"type":"kdeconnect.ping","body":[]}"#,
            r#"{"id":1,"type":"kdeconnect.ping","body":{}"#,
        ] {
            let err = Packet::from_bytes(frame.as_bytes()).unwrap_err();
            assert!(matches!(err, ProtocolError::MalformedPacket(_)), "{}", frame);
        }
    }

    #[test]
    fn test_string_id_accepted() {
        let packet = Packet::from_bytes(br#"{"id":"123","type":"kdeconnect.ping","body":{}}"#).unwrap();
        assert_eq!(packet.id, 123);
    }

    #[test]
    fn test_crlf_tolerated() {
        let packet = Packet::from_bytes(b"{\"id\":5,\"type\":\"x.y\",\"body\":{}}\r\n").unwrap();
        assert_eq!(packet.id, 5);
        assert_eq!(packet.packet_type(), "x.y");
    }

    #[test]
    fn test_oversized_frame_is_violation() {
        let frame = vec![b' '; MAX_PACKET_SIZE + 1];
        let err = Packet::from_bytes(&frame).unwrap_err();
        assert!(matches!(err, ProtocolError::ProtocolViolation(_)));
    }

    #[test]
    fn test_non_object_body_not_serialized() {
        let packet = Packet::new("kdeconnect.ping", json!("text"));
        assert!(matches!(
            packet.to_bytes(),
            Err(ProtocolError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_body_accessors() {
        let packet = Packet::new("x", json!({"s": "v", "b": true, "n": 3}));
        assert_eq!(packet.get_str("s"), Some("v"));
        assert_eq!(packet.get_bool("b"), Some(true));
        assert_eq!(packet.get_i64("n"), Some(3));
        assert_eq!(packet.get_str("missing"), None);
    }
}
