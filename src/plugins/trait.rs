//! Host-supplied feature plugins
//!
//! Feature plugins live outside the core. The core only needs to know which
//! packet types a plugin consumes and produces, and how to hand it a packet.
//!
//! ## Example
//!
//! ```rust
//! use connect_link_core::plugins::Plugin;
//! use connect_link_core::protocol::Packet;
//! use connect_link_core::error::Result;
//! use async_trait::async_trait;
//!
//! struct ClipboardPlugin;
//!
//! #[async_trait]
//! impl Plugin for ClipboardPlugin {
//!     fn name(&self) -> &str {
//!         "clipboard"
//!     }
//!
//!     fn incoming_capabilities(&self) -> Vec<String> {
//!         vec!["kdeconnect.clipboard".to_string()]
//!     }
//!
//!     fn outgoing_capabilities(&self) -> Vec<String> {
//!         vec!["kdeconnect.clipboard".to_string()]
//!     }
//!
//!     async fn handle_packet(&mut self, packet: &Packet) -> Result<()> {
//!         let _content = packet.get_str("content");
//!         Ok(())
//!     }
//!
//!     async fn initialize(&mut self) -> Result<()> {
//!         Ok(())
//!     }
//!
//!     async fn shutdown(&mut self) -> Result<()> {
//!         Ok(())
//!     }
//! }
//! ```

use crate::error::Result;
use crate::protocol::Packet;
use async_trait::async_trait;

/// A feature plugin attached to one device
///
/// ## Lifecycle
///
/// 1. **Registration**: handed to the device's [`PluginManager`](super::PluginManager)
/// 2. **Initialization**: `initialize()`; a failure parks the plugin in the
///    failed set and it never receives packets
/// 3. **Operation**: `handle_packet()` for every routed packet
/// 4. **Shutdown**: `shutdown()` when the device goes away
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique plugin name, e.g. "battery"
    fn name(&self) -> &str;

    /// Packet types this plugin can receive
    ///
    /// A type is only routed here if the peer also lists it as outgoing.
    fn incoming_capabilities(&self) -> Vec<String>;

    /// Packet types this plugin can send
    fn outgoing_capabilities(&self) -> Vec<String>;

    /// Handle a packet of one of the incoming types
    async fn handle_packet(&mut self, packet: &Packet) -> Result<()>;

    async fn initialize(&mut self) -> Result<()>;

    async fn shutdown(&mut self) -> Result<()>;

    /// Check if this plugin consumes `packet_type`
    fn handles_packet_type(&self, packet_type: &str) -> bool {
        self.incoming_capabilities()
            .iter()
            .any(|cap| cap == packet_type)
    }

    /// Both capability lists as (incoming, outgoing)
    fn get_capabilities(&self) -> (Vec<String>, Vec<String>) {
        (self.incoming_capabilities(), self.outgoing_capabilities())
    }
}
