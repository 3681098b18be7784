//! Link provider abstraction
//!
//! A provider discovers peers on one kind of network and turns them into
//! [`Link`](super::link::Link)s. Results are reported as
//! [`ProviderEvent`](super::events::ProviderEvent)s on the channel returned
//! by the provider's constructor.

use crate::error::Result;
use async_trait::async_trait;

/// Lifecycle of a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderState {
    #[default]
    Stopped,
    Starting,
    Running,
}

/// Discovery entry points every provider offers
#[async_trait]
pub trait LinkProvider: Send + Sync {
    /// Provider name for logs
    fn name(&self) -> &str;

    async fn state(&self) -> ProviderState;

    /// Bind sockets and announce the local device
    async fn start_discovery(&self) -> Result<()>;

    /// Announce the local device again without rebinding
    async fn refresh_discovery(&self) -> Result<()>;

    /// Close sockets; established links stay up
    async fn stop_discovery(&self) -> Result<()>;

    /// Rebind after the host's network configuration changed
    async fn network_changed(&self) -> Result<()>;
}
