//! Network module
//!
//! Discovery and authenticated links for the KDE Connect protocol.
//!
//! This module contains:
//! - `link`: the `Link` trait and its event stream
//! - `provider`: the `LinkProvider` trait
//! - `events`: events reported by providers
//! - `lan`: UDP discovery and TCP+TLS links on the local network

pub mod events;
pub mod lan;
pub mod link;
pub mod provider;

// Re-exports for convenience
pub use events::ProviderEvent;
pub use lan::{DiscoveryDecision, LanLink, LanLinkProvider, PayloadSettings};
pub use link::{Link, LinkDirection, LinkEvent, LinkEventReceiver, LinkId, SendTag};
pub use provider::{LinkProvider, ProviderState};
