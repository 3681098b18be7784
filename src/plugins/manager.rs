//! Plugin Manager
//!
//! Per-device plugin registry and packet router.
//!
//! ## Responsibilities
//!
//! - Plugin registration and de-registration
//! - Plugin lifecycle management (initialize/shutdown)
//! - Tracking plugins whose initialization failed
//! - Packet routing, limited to types the peer says it sends
//! - Capability aggregation for identity packets
//!
//! ## Example
//!
//! ```rust
//! use connect_link_core::plugins::PluginManager;
//! use connect_link_core::protocol::Packet;
//! use serde_json::json;
//!
//! # async fn example() -> connect_link_core::error::Result<()> {
//! let mut manager = PluginManager::new();
//!
//! // manager.register_plugin(Box::new(BatteryPlugin::new())).await?;
//!
//! // Only route what the peer announced as outgoing
//! manager.update_peer_capabilities(["kdeconnect.battery".to_string()]);
//!
//! let packet = Packet::new("kdeconnect.battery", json!({"currentCharge": 80}));
//! if manager.can_route(packet.packet_type()) {
//!     manager.route_packet(&packet).await?;
//! }
//! # Ok(())
//! # }
//! ```

use crate::error::{ProtocolError, Result};
use crate::plugins::Plugin;
use crate::protocol::Packet;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Shared handle to a registered plugin
pub type PluginHandle = Arc<RwLock<Box<dyn Plugin>>>;

struct Registered {
    plugin: PluginHandle,
    /// Incoming capabilities captured at registration
    incoming: Vec<String>,
}

/// Plugin Manager
///
/// Owns the plugins of one device and routes packets to them.
pub struct PluginManager {
    /// Initialized plugins indexed by name
    plugins: HashMap<String, Registered>,

    /// Plugins whose initialization failed
    failed: BTreeSet<String>,

    /// Outgoing capabilities of the peer
    peer_outgoing: BTreeSet<String>,

    /// Packet type to plugin names, rebuilt whenever plugins or peer change
    packet_routes: HashMap<String, Vec<String>>,
}

impl PluginManager {
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
            failed: BTreeSet::new(),
            peer_outgoing: BTreeSet::new(),
            packet_routes: HashMap::new(),
        }
    }

    /// Register and initialize a plugin
    ///
    /// # Errors
    ///
    /// - `ProtocolError::AlreadyExists` - a plugin with this name is known
    /// - `ProtocolError::Plugin` - initialization failed; the name is kept
    ///   in the failed set
    pub async fn register_plugin(&mut self, mut plugin: Box<dyn Plugin>) -> Result<()> {
        let name = plugin.name().to_string();

        if self.plugins.contains_key(&name) || self.failed.contains(&name) {
            return Err(ProtocolError::AlreadyExists(format!(
                "Plugin '{}' is already registered",
                name
            )));
        }

        info!("Registering plugin: {}", name);

        if let Err(e) = plugin.initialize().await {
            warn!("Plugin '{}' failed to initialize: {}", name, e);
            self.failed.insert(name.clone());
            return Err(ProtocolError::Plugin(format!(
                "Failed to initialize plugin '{}': {}",
                name, e
            )));
        }

        let incoming = plugin.incoming_capabilities();
        debug!(
            "Plugin '{}' registered with {} incoming capabilities",
            name,
            incoming.len()
        );
        self.plugins.insert(
            name,
            Registered {
                plugin: Arc::new(RwLock::new(plugin)),
                incoming,
            },
        );
        self.rebuild_routes();

        Ok(())
    }

    /// Shut a plugin down and forget it
    pub async fn unregister_plugin(&mut self, name: &str) -> Result<()> {
        if self.failed.remove(name) {
            debug!("Dropped failed plugin '{}'", name);
            return Ok(());
        }

        let registered = self
            .plugins
            .remove(name)
            .ok_or_else(|| ProtocolError::Plugin(format!("Plugin '{}' not found", name)))?;
        self.rebuild_routes();

        info!("Unregistering plugin: {}", name);
        let mut plugin = registered.plugin.write().await;
        plugin.shutdown().await.map_err(|e| {
            ProtocolError::Plugin(format!("Failed to shutdown plugin '{}': {}", name, e))
        })
    }

    /// Replace the peer's outgoing capability set
    ///
    /// Returns `true` if the routing table changed.
    pub fn update_peer_capabilities<I>(&mut self, outgoing: I) -> bool
    where
        I: IntoIterator<Item = String>,
    {
        self.peer_outgoing = outgoing.into_iter().collect();
        self.rebuild_routes()
    }

    fn rebuild_routes(&mut self) -> bool {
        let mut routes: HashMap<String, Vec<String>> = HashMap::new();
        for (name, registered) in &self.plugins {
            for packet_type in &registered.incoming {
                if self.peer_outgoing.contains(packet_type) {
                    routes
                        .entry(packet_type.clone())
                        .or_default()
                        .push(name.clone());
                }
            }
        }
        for names in routes.values_mut() {
            names.sort();
        }

        let changed = routes != self.packet_routes;
        self.packet_routes = routes;
        changed
    }

    /// Whether some plugin receives `packet_type` from this peer
    pub fn can_route(&self, packet_type: &str) -> bool {
        self.packet_routes.contains_key(packet_type)
    }

    /// Packet types currently routed to plugins
    pub fn routed_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.packet_routes.keys().cloned().collect();
        types.sort();
        types
    }

    /// Hand a packet to every plugin routed for its type
    ///
    /// Returns how many plugins handled it.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::Plugin` - no route for the type, or a plugin failed
    pub async fn route_packet(&self, packet: &Packet) -> Result<usize> {
        let packet_type = packet.packet_type();

        let plugin_names = self.packet_routes.get(packet_type).ok_or_else(|| {
            warn!("No plugin registered for packet type: {}", packet_type);
            ProtocolError::Plugin(format!("No plugin handles packet type: {}", packet_type))
        })?;

        for plugin_name in plugin_names {
            let registered = self.plugins.get(plugin_name).ok_or_else(|| {
                error!("Plugin '{}' not found in registry", plugin_name);
                ProtocolError::Plugin(format!("Plugin '{}' not found", plugin_name))
            })?;

            debug!(
                "Dispatching packet '{}' to plugin '{}'",
                packet_type, plugin_name
            );

            let mut plugin = registered.plugin.write().await;
            plugin.handle_packet(packet).await.map_err(|e| {
                error!(
                    "Plugin '{}' failed to handle packet '{}': {}",
                    plugin_name, packet_type, e
                );
                ProtocolError::Plugin(format!(
                    "Plugin '{}' failed to handle packet: {}",
                    plugin_name, e
                ))
            })?;
        }

        Ok(plugin_names.len())
    }

    /// Capabilities of all initialized plugins, sorted and deduplicated
    ///
    /// Suitable for the local identity packet.
    pub async fn get_capabilities(&self) -> (Vec<String>, Vec<String>) {
        let mut incoming = Vec::new();
        let mut outgoing = Vec::new();

        for registered in self.plugins.values() {
            let plugin = registered.plugin.read().await;
            let (inc, out) = plugin.get_capabilities();
            incoming.extend(inc);
            outgoing.extend(out);
        }

        incoming.sort();
        incoming.dedup();
        outgoing.sort();
        outgoing.dedup();

        (incoming, outgoing)
    }

    pub fn get_plugin(&self, name: &str) -> Option<PluginHandle> {
        self.plugins
            .get(name)
            .map(|registered| Arc::clone(&registered.plugin))
    }

    pub fn has_plugin(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    /// Names of initialized plugins, sorted
    pub fn plugin_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of plugins that failed to initialize, sorted
    pub fn failed_plugins(&self) -> Vec<String> {
        self.failed.iter().cloned().collect()
    }

    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }

    /// Shut down every plugin
    ///
    /// Keeps going after a failure and returns the first error.
    pub async fn shutdown_all(&mut self) -> Result<()> {
        info!("Shutting down all plugins");

        let mut errors = Vec::new();
        for name in self.plugin_names() {
            if let Err(e) = self.unregister_plugin(&name).await {
                error!("Failed to shutdown plugin '{}': {}", name, e);
                errors.push(e);
            }
        }
        self.failed.clear();

        match errors.into_iter().next() {
            Some(first_error) => Err(first_error),
            None => Ok(()),
        }
    }
}

impl Default for PluginManager {
    fn default() -> Self {
        Self::new()
    }
}
