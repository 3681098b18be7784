//! Plugin system module
//!
//! The core does not implement features. It routes packets by capability
//! name to plugins supplied by the host.
//!
//! ## Components
//!
//! - [`Plugin`](trait@Plugin) - Trait that all plugins must implement
//! - [`PluginManager`](struct@PluginManager) - Per-device lifecycle and routing
//!
//! A packet type reaches a plugin only when the plugin lists it as
//! incoming, the peer lists it as outgoing and the device is paired with a
//! matching certificate. The last check lives in the device actor.

pub mod manager;
pub mod r#trait;

pub use manager::{PluginHandle, PluginManager};
pub use r#trait::Plugin;
