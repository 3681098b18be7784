//! LAN transport
//!
//! UDP broadcast discovery plus TCP+TLS links on the local network.
//!
//! This module contains:
//! - `handshake`: plain-text identity, inverted TLS and identity re-exchange
//! - `link`: `LanLink`, one TLS session with reader and writer tasks
//! - `payload`: short-lived TLS side channels for bulk data
//! - `provider`: `LanLinkProvider`, discovery and connection races

pub mod handshake;
pub mod link;
pub mod payload;
pub mod provider;

pub use link::LanLink;
pub use payload::PayloadSettings;
pub use provider::{DiscoveryDecision, LanLinkProvider};

use crate::error::{ProtocolError, Result};
use std::io;
use std::net::{IpAddr, SocketAddr};
use tokio::net::TcpListener;
use tracing::debug;

/// Bind a listener on the first free port of an inclusive range
///
/// A range of `(0, 0)` binds an ephemeral port.
pub(crate) async fn bind_tcp_in_range(address: IpAddr, range: (u16, u16)) -> Result<TcpListener> {
    let (start, end) = range;
    for port in start..=end {
        match TcpListener::bind(SocketAddr::new(address, port)).await {
            Ok(listener) => {
                debug!("Bound TCP listener on {}:{}", address, port);
                return Ok(listener);
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
            Err(e) => debug!("Binding {}:{} failed: {}", address, port, e),
        }
    }
    Err(ProtocolError::NoAvailablePort { start, end })
}
