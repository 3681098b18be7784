//! connect-link-core
//!
//! Discovery, secure links and pairing for KDE Connect compatible devices.
//!
//! ## Architecture
//!
//! Two devices on the same network find each other over UDP broadcast,
//! connect over TCP, upgrade to mutually authenticated TLS and pin each
//! other's certificate when the users agree to pair. Feature plugins sit on
//! top and only see packets from paired devices.
//!
//! ### Modules
//!
//! - `protocol`: wire packets, identity and pair packets
//! - `crypto`: device certificate, trust store and TLS configuration
//! - `network`: links, link providers and the LAN implementation
//! - `device`: per-device pairing state machine and actor
//! - `plugins`: plugin trait and capability routing
//! - `config`: TOML configuration
//! - `logging`: tracing subscriber bootstrap
//!
//! ## Example
//!
//! ```rust
//! use connect_link_core::protocol::{DeviceIdentity, DeviceType, Packet};
//!
//! let identity = DeviceIdentity::new("laptop_1", "Laptop", DeviceType::Laptop)
//!     .with_capabilities(["kdeconnect.ping"], ["kdeconnect.ping"])
//!     .with_tcp_port(1716);
//!
//! // One JSON object per line on the wire
//! let bytes = identity.to_packet().to_bytes().unwrap();
//! assert_eq!(bytes.last(), Some(&b'\n'));
//!
//! let parsed = DeviceIdentity::from_packet(&Packet::from_bytes(&bytes).unwrap()).unwrap();
//! assert_eq!(parsed, identity);
//! ```

pub use config::CoreConfig;
pub use device::{Device, DeviceEvent, DeviceHandle, DeviceRecord, PairState};
pub use error::{ProtocolError, Result};
pub use network::{LanLinkProvider, Link, LinkEvent, LinkProvider, ProviderEvent};
pub use protocol::{DeviceIdentity, Packet, PROTOCOL_VERSION};

pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod logging;
pub mod network;
pub mod plugins;
pub mod protocol;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_protocol_version() {
        assert_eq!(PROTOCOL_VERSION, 8);
    }
}
