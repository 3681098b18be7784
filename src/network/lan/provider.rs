//! LAN link provider
//!
//! Owns the UDP discovery socket and the TCP listen socket, decides which
//! side of a discovered pair opens the connection and turns finished
//! handshakes into [`LanLink`]s.
//!
//! ## Connection race
//!
//! Both devices broadcast and both hear each other. Only the device with
//! the lexicographically smaller id connects; the other answers with a
//! unicast identity so the initiator learns about it even if it missed the
//! broadcast. An attempt already in flight or an open link to the same
//! device suppresses further attempts.

use super::handshake::{self, Established};
use super::link::LanLink;
use super::payload::PayloadSettings;
use crate::config::{CoreConfig, NetworkConfig};
use crate::crypto::{should_initiate_connection, CertificateService, TlsConfig};
use crate::error::{ProtocolError, Result};
use crate::network::events::ProviderEvent;
use crate::network::link::Link;
use crate::network::provider::{LinkProvider, ProviderState};
use crate::protocol::{DeviceIdentity, Packet, MAX_IDENTITY_PACKET_SIZE, PACKET_TYPE_IDENTITY};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Largest datagram the discovery socket reads
const UDP_BUFFER_SIZE: usize = 64 * 1024;

/// What the provider did with a discovered identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryDecision {
    /// The datagram was our own broadcast
    IgnoredSelf,
    /// An outbound attempt to that device is already running
    IgnoredInFlight,
    /// An open link to that device already exists
    IgnoredLinked,
    /// Discovery is not running
    NotRunning,
    /// We should connect but the peer announced no TCP port
    NoTcpPort,
    /// An outbound connection was started
    Connecting,
    /// The peer has to connect; we answered with our identity
    AwaitingPeer,
}

struct Binding {
    udp: Arc<UdpSocket>,
    tcp_port: u16,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Binding {
    /// Cancel both loops and wait until the sockets are released
    async fn shutdown(self) {
        self.token.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

struct Attempt {
    id: u64,
    token: CancellationToken,
}

struct State {
    status: ProviderState,
    identity: DeviceIdentity,
    binding: Option<Binding>,
    in_flight: HashMap<String, Attempt>,
    next_attempt: u64,
    links: HashMap<String, Weak<LanLink>>,
}

impl State {
    fn has_open_link(&self, device_id: &str) -> bool {
        self.links
            .get(device_id)
            .and_then(Weak::upgrade)
            .is_some_and(|link| link.is_open())
    }
}

struct Inner {
    certs: Arc<CertificateService>,
    tls: TlsConfig,
    network: NetworkConfig,
    payload: Arc<PayloadSettings>,
    events: mpsc::UnboundedSender<ProviderEvent>,
    /// Parent of every binding and attempt token; cancelled on drop
    root: CancellationToken,
    state: Mutex<State>,
}

/// Discovery and links over the local network
pub struct LanLinkProvider {
    inner: Arc<Inner>,
}

impl LanLinkProvider {
    /// Create a stopped provider
    ///
    /// `identity` is what gets announced; its device id must be the one in
    /// the local certificate.
    pub fn new(
        identity: DeviceIdentity,
        certs: Arc<CertificateService>,
        config: &CoreConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ProviderEvent>)> {
        if identity.device_id != certs.device_id() {
            return Err(ProtocolError::certificate(format!(
                "identity {} does not match certificate {}",
                identity.device_id,
                certs.device_id()
            )));
        }
        let tls = TlsConfig::new(certs.identity())?;
        let payload = Arc::new(PayloadSettings::from_config(tls.clone(), config));
        let (events, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            certs,
            tls,
            network: config.network.clone(),
            payload,
            events,
            root: CancellationToken::new(),
            state: Mutex::new(State {
                status: ProviderState::Stopped,
                identity,
                binding: None,
                in_flight: HashMap::new(),
                next_attempt: 0,
                links: HashMap::new(),
            }),
        });
        Ok((Self { inner }, events_rx))
    }

    /// Identity we announce, including the bound TCP port
    pub async fn local_identity(&self) -> DeviceIdentity {
        self.inner.state.lock().await.identity.clone()
    }

    /// Port of the TCP listen socket while running
    pub async fn tcp_port(&self) -> Option<u16> {
        let state = self.inner.state.lock().await;
        state.binding.as_ref().map(|binding| binding.tcp_port)
    }

    /// Local address of the UDP discovery socket while running
    pub async fn discovery_addr(&self) -> Option<SocketAddr> {
        let state = self.inner.state.lock().await;
        state
            .binding
            .as_ref()
            .and_then(|binding| binding.udp.local_addr().ok())
    }

    /// Send our identity to one address instead of broadcasting
    pub async fn send_identity_to(&self, target: SocketAddr) -> Result<()> {
        let (udp, packet) = self.inner.announcement().await?;
        udp.send_to(&packet.to_bytes()?, target).await?;
        debug!("Sent identity to {}", target);
        Ok(())
    }

    /// Apply the connection race rule to an identity heard on the network
    pub async fn handle_discovered_identity(
        &self,
        identity: DeviceIdentity,
        source: SocketAddr,
    ) -> DiscoveryDecision {
        self.inner.handle_identity(identity, source).await
    }
}

impl Drop for LanLinkProvider {
    fn drop(&mut self) {
        self.inner.root.cancel();
    }
}

#[async_trait]
impl LinkProvider for LanLinkProvider {
    fn name(&self) -> &str {
        "lan"
    }

    async fn state(&self) -> ProviderState {
        self.inner.state.lock().await.status
    }

    async fn start_discovery(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().await;
            if state.status != ProviderState::Stopped {
                debug!("Discovery already {:?}", state.status);
                return Ok(());
            }
            state.status = ProviderState::Starting;
        }
        self.inner.bind_and_announce().await
    }

    async fn refresh_discovery(&self) -> Result<()> {
        self.inner.broadcast_identity().await
    }

    async fn stop_discovery(&self) -> Result<()> {
        let binding = {
            let mut state = self.inner.state.lock().await;
            if state.status == ProviderState::Stopped {
                return Ok(());
            }
            state.status = ProviderState::Stopped;
            for (device_id, attempt) in state.in_flight.drain() {
                debug!("Cancelling connection attempt to {}", device_id);
                attempt.token.cancel();
            }
            state.binding.take()
        };
        if let Some(binding) = binding {
            binding.shutdown().await;
        }

        info!("LAN discovery stopped");
        self.inner.emit(ProviderEvent::Stopped);
        Ok(())
    }

    async fn network_changed(&self) -> Result<()> {
        let binding = {
            let mut state = self.inner.state.lock().await;
            if state.status != ProviderState::Running {
                debug!("Network changed while {:?}, nothing to rebind", state.status);
                return Ok(());
            }
            state.status = ProviderState::Starting;
            state.binding.take()
        };
        info!("Network changed, rebinding discovery sockets");
        if let Some(binding) = binding {
            binding.shutdown().await;
        }
        self.inner.bind_and_announce().await
    }
}

impl Inner {
    fn emit(&self, event: ProviderEvent) {
        if self.events.send(event).is_err() {
            debug!("Provider event dropped, no receiver");
        }
    }

    /// Bind both sockets, start their loops and broadcast once
    ///
    /// Expects the state to be `Starting`.
    async fn bind_and_announce(self: &Arc<Self>) -> Result<()> {
        let bound = {
            let mut state = self.state.lock().await;
            match self.bind(&mut state).await {
                Ok(tcp_port) => {
                    state.status = ProviderState::Running;
                    Ok(tcp_port)
                }
                Err(e) => {
                    state.status = ProviderState::Stopped;
                    Err(e)
                }
            }
        };

        let tcp_port = match bound {
            Ok(port) => port,
            Err(e) => {
                error!("Failed to start LAN discovery: {}", e);
                self.emit(ProviderEvent::Error {
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        info!("LAN discovery running, links on TCP port {}", tcp_port);
        self.emit(ProviderEvent::Started { tcp_port });

        if let Err(e) = self.broadcast_identity().await {
            warn!("Initial identity broadcast failed: {}", e);
        }
        Ok(())
    }

    async fn bind(self: &Arc<Self>, state: &mut State) -> Result<u16> {
        let udp_addr = SocketAddr::new(self.network.bind_address, self.network.discovery_port);
        let udp = UdpSocket::bind(udp_addr).await.map_err(|e| {
            ProtocolError::transport(format!("cannot bind discovery socket {}: {}", udp_addr, e))
        })?;
        udp.set_broadcast(true)?;
        let udp = Arc::new(udp);

        let listener =
            super::bind_tcp_in_range(self.network.bind_address, self.network.tcp_port_range)
                .await?;
        let tcp_port = listener.local_addr()?.port();

        let token = self.root.child_token();
        let tasks = vec![
            tokio::spawn(udp_loop(Arc::clone(self), Arc::clone(&udp), token.clone())),
            tokio::spawn(accept_loop(Arc::clone(self), listener, token.clone())),
        ];

        state.identity = state.identity.clone().with_tcp_port(tcp_port);
        state.binding = Some(Binding {
            udp,
            tcp_port,
            token,
            tasks,
        });
        Ok(tcp_port)
    }

    /// Discovery socket and identity packet, if running
    async fn announcement(&self) -> Result<(Arc<UdpSocket>, Packet)> {
        let state = self.state.lock().await;
        let binding = state
            .binding
            .as_ref()
            .ok_or_else(|| ProtocolError::other("LAN discovery is not running"))?;
        Ok((Arc::clone(&binding.udp), state.identity.to_packet()))
    }

    async fn broadcast_identity(&self) -> Result<()> {
        let (udp, packet) = self.announcement().await?;
        if self.network.discovery_port == 0 {
            debug!("No fixed discovery port, skipping broadcast");
            return Ok(());
        }
        let target = SocketAddr::new(self.network.broadcast_address, self.network.discovery_port);
        udp.send_to(&packet.to_bytes()?, target).await?;
        debug!("Broadcast identity to {}", target);
        Ok(())
    }

    async fn handle_identity(
        self: &Arc<Self>,
        peer: DeviceIdentity,
        source: SocketAddr,
    ) -> DiscoveryDecision {
        let mut state = self.state.lock().await;
        if peer.device_id == state.identity.device_id {
            return DiscoveryDecision::IgnoredSelf;
        }
        if state.status != ProviderState::Running {
            return DiscoveryDecision::NotRunning;
        }

        debug!(
            "Discovered {} ({}) at {}",
            peer.device_name, peer.device_id, source
        );
        self.emit(ProviderEvent::IdentityReceived {
            identity: peer.clone(),
            address: source,
        });

        if state.in_flight.contains_key(&peer.device_id) {
            return DiscoveryDecision::IgnoredInFlight;
        }
        if state.has_open_link(&peer.device_id) {
            return DiscoveryDecision::IgnoredLinked;
        }

        if !should_initiate_connection(&state.identity.device_id, &peer.device_id) {
            let Some(udp) = state.binding.as_ref().map(|binding| Arc::clone(&binding.udp)) else {
                return DiscoveryDecision::NotRunning;
            };
            let reply = state.identity.to_packet();
            drop(state);

            debug!("{} initiates, answering with our identity", peer.device_id);
            match reply.to_bytes() {
                Ok(bytes) => {
                    if let Err(e) = udp.send_to(&bytes, source).await {
                        warn!("Identity reply to {} failed: {}", source, e);
                    }
                }
                Err(e) => warn!("Cannot encode identity reply: {}", e),
            }
            return DiscoveryDecision::AwaitingPeer;
        }

        let Some(port) = peer.tcp_port else {
            warn!("{} announced no TCP port, cannot connect", peer.device_id);
            return DiscoveryDecision::NoTcpPort;
        };

        let attempt_id = state.next_attempt;
        state.next_attempt += 1;
        let token = self.root.child_token();
        state.in_flight.insert(
            peer.device_id.clone(),
            Attempt {
                id: attempt_id,
                token: token.clone(),
            },
        );
        let local = state.identity.clone();
        drop(state);

        let addr = SocketAddr::new(source.ip(), port);
        tokio::spawn(Arc::clone(self).connect(peer, addr, local, attempt_id, token));
        DiscoveryDecision::Connecting
    }

    async fn connect(
        self: Arc<Self>,
        peer: DeviceIdentity,
        addr: SocketAddr,
        local: DeviceIdentity,
        attempt_id: u64,
        token: CancellationToken,
    ) {
        let result = tokio::select! {
            _ = token.cancelled() => None,
            result = handshake::connect(
                addr,
                &peer,
                &local,
                &self.tls,
                &self.certs,
                self.network.connect_timeout(),
            ) => Some(result),
        };

        let mut state = self.state.lock().await;
        if state
            .in_flight
            .get(&peer.device_id)
            .is_some_and(|attempt| attempt.id == attempt_id)
        {
            state.in_flight.remove(&peer.device_id);
        }

        match result {
            None => debug!("Connection attempt to {} cancelled", peer.device_id),
            Some(Ok(established)) => self.register(&mut state, established),
            Some(Err(e)) => {
                drop(state);
                warn!("Connecting to {} at {} failed: {}", peer.device_id, addr, e);
                self.emit(ProviderEvent::Error {
                    message: format!("connection to {} failed: {}", peer.device_id, e),
                });
            }
        }
    }

    /// Wrap a finished handshake into a link and hand it out
    fn register(&self, state: &mut State, established: Established) {
        let identity = established.identity.clone();
        let direction = established.direction;
        let (link, events) = LanLink::spawn(established, Arc::clone(&self.payload));
        state
            .links
            .insert(identity.device_id.clone(), Arc::downgrade(&link));
        state.links.retain(|_, link| link.strong_count() > 0);

        self.emit(ProviderEvent::ConnectionReceived {
            identity,
            link,
            events,
            direction,
        });
    }
}

async fn udp_loop(inner: Arc<Inner>, socket: Arc<UdpSocket>, token: CancellationToken) {
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];
    loop {
        let received = tokio::select! {
            _ = token.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };
        let (len, source) = match received {
            Ok(received) => received,
            Err(e) => {
                debug!("Discovery receive failed: {}", e);
                continue;
            }
        };
        if len > MAX_IDENTITY_PACKET_SIZE {
            debug!("Ignoring {} byte datagram from {}", len, source);
            continue;
        }

        let identity = Packet::from_bytes(&buf[..len]).and_then(|packet| {
            if !packet.is_type(PACKET_TYPE_IDENTITY) {
                return Err(ProtocolError::malformed(format!(
                    "unexpected '{}' on discovery port",
                    packet.packet_type()
                )));
            }
            DeviceIdentity::from_packet(&packet)
        });
        match identity {
            Ok(identity) => {
                let decision = inner.handle_identity(identity, source).await;
                debug!("Datagram from {}: {:?}", source, decision);
            }
            Err(e) => debug!("Invalid discovery datagram from {}: {}", source, e),
        }
    }
    debug!("Discovery loop stopped");
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener, token: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (tcp, remote) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accepting link connection failed: {}", e);
                continue;
            }
        };

        let inner = Arc::clone(&inner);
        let token = token.child_token();
        tokio::spawn(async move {
            let local = inner.state.lock().await.identity.clone();
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = handshake::accept(
                    tcp,
                    remote,
                    &local,
                    &inner.tls,
                    &inner.certs,
                    inner.network.connect_timeout(),
                ) => result,
            };
            match result {
                Ok(established) => {
                    let mut state = inner.state.lock().await;
                    inner.register(&mut state, established);
                }
                Err(e) => {
                    warn!("Incoming connection from {} failed: {}", remote, e);
                    inner.emit(ProviderEvent::Error {
                        message: format!("incoming connection from {} failed: {}", remote, e),
                    });
                }
            }
        });
    }
    debug!("Accept loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CertificateInfo, KeyAlgorithm};
    use crate::network::link::LinkDirection;
    use crate::protocol::DeviceType;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tempfile::TempDir;

    fn loopback_config(dir: &TempDir) -> CoreConfig {
        let mut config = CoreConfig::default();
        config.network.bind_address = IpAddr::V4(Ipv4Addr::LOCALHOST);
        config.network.discovery_port = 0;
        config.network.tcp_port_range = (0, 0);
        config.network.payload_port_range = (0, 0);
        config.storage.payload_dir = Some(dir.path().to_path_buf());
        config
    }

    fn provider(id: &str, dir: &TempDir) -> (LanLinkProvider, mpsc::UnboundedReceiver<ProviderEvent>) {
        let cert = CertificateInfo::generate_with(id, KeyAlgorithm::EcdsaP256).unwrap();
        let certs = Arc::new(CertificateService::in_memory(cert));
        let identity = DeviceIdentity::new(id, id, DeviceType::Laptop);
        LanLinkProvider::new(identity, certs, &loopback_config(dir)).unwrap()
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<ProviderEvent>) -> ProviderEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for provider event")
            .expect("provider channel closed")
    }

    #[test]
    fn test_identity_must_match_certificate() {
        let dir = TempDir::new().unwrap();
        let cert = CertificateInfo::generate_with("alpha", KeyAlgorithm::EcdsaP256).unwrap();
        let certs = Arc::new(CertificateService::in_memory(cert));
        let identity = DeviceIdentity::new("beta", "beta", DeviceType::Laptop);
        assert!(LanLinkProvider::new(identity, certs, &loopback_config(&dir)).is_err());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let dir = TempDir::new().unwrap();
        let (provider, mut events) = provider("alpha", &dir);
        assert_eq!(provider.state().await, ProviderState::Stopped);
        assert!(provider.refresh_discovery().await.is_err());

        provider.start_discovery().await.unwrap();
        assert_eq!(provider.state().await, ProviderState::Running);
        let port = provider.tcp_port().await.unwrap();
        assert!(matches!(
            next_event(&mut events).await,
            ProviderEvent::Started { tcp_port } if tcp_port == port
        ));
        assert_eq!(provider.local_identity().await.tcp_port, Some(port));
        provider.refresh_discovery().await.unwrap();

        provider.stop_discovery().await.unwrap();
        assert_eq!(provider.state().await, ProviderState::Stopped);
        assert!(matches!(next_event(&mut events).await, ProviderEvent::Stopped));
        assert!(provider.tcp_port().await.is_none());
    }

    #[tokio::test]
    async fn test_race_rule_decisions() {
        let dir = TempDir::new().unwrap();
        let (provider, _events) = provider("m", &dir);
        let source: SocketAddr = "127.0.0.1:9".parse().unwrap();

        let peer = DeviceIdentity::new("z", "z", DeviceType::Phone).with_tcp_port(1);
        assert_eq!(
            provider.handle_discovered_identity(peer.clone(), source).await,
            DiscoveryDecision::NotRunning
        );

        provider.start_discovery().await.unwrap();

        let own = provider.local_identity().await;
        assert_eq!(
            provider.handle_discovered_identity(own, source).await,
            DiscoveryDecision::IgnoredSelf
        );

        let lower = DeviceIdentity::new("a", "a", DeviceType::Phone);
        assert_eq!(
            provider.handle_discovered_identity(lower, source).await,
            DiscoveryDecision::AwaitingPeer
        );

        let no_port = DeviceIdentity::new("y", "y", DeviceType::Phone);
        assert_eq!(
            provider.handle_discovered_identity(no_port, source).await,
            DiscoveryDecision::NoTcpPort
        );

        // Nothing listens there; the first attempt stays in flight for a moment
        assert_eq!(
            provider.handle_discovered_identity(peer.clone(), source).await,
            DiscoveryDecision::Connecting
        );
        let second = provider.handle_discovered_identity(peer, source).await;
        assert!(matches!(
            second,
            DiscoveryDecision::IgnoredInFlight | DiscoveryDecision::Connecting
        ));

        provider.stop_discovery().await.unwrap();
    }

    #[tokio::test]
    async fn test_discovery_produces_one_link() {
        let dir = TempDir::new().unwrap();
        let (alpha, mut alpha_events) = provider("alpha", &dir);
        let (beta, mut beta_events) = provider("beta", &dir);
        alpha.start_discovery().await.unwrap();
        beta.start_discovery().await.unwrap();

        let alpha_udp = alpha.discovery_addr().await.unwrap();
        let beta_udp = beta.discovery_addr().await.unwrap();
        // beta answers alpha's identity, alpha connects
        alpha.send_identity_to(beta_udp).await.unwrap();
        beta.send_identity_to(alpha_udp).await.unwrap();

        let mut alpha_link = None;
        while alpha_link.is_none() {
            if let ProviderEvent::ConnectionReceived {
                identity,
                link,
                direction,
                ..
            } = next_event(&mut alpha_events).await
            {
                assert_eq!(identity.device_id, "beta");
                assert_eq!(direction, LinkDirection::Outbound);
                alpha_link = Some(link);
            }
        }

        let mut beta_link = None;
        while beta_link.is_none() {
            if let ProviderEvent::ConnectionReceived { link, direction, .. } =
                next_event(&mut beta_events).await
            {
                assert_eq!(direction, LinkDirection::Inbound);
                beta_link = Some(link);
            }
        }

        // Repeated announcements do not open a second connection
        alpha.send_identity_to(beta_udp).await.unwrap();
        beta.send_identity_to(alpha_udp).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        while let Ok(event) = alpha_events.try_recv() {
            assert!(!event.is_connection(), "unexpected {:?}", event);
        }
        while let Ok(event) = beta_events.try_recv() {
            assert!(!event.is_connection(), "unexpected {:?}", event);
        }

        alpha.stop_discovery().await.unwrap();
        assert!(alpha_link.unwrap().is_open());
        assert!(beta_link.unwrap().is_open());
    }

    #[tokio::test]
    async fn test_network_change_keeps_links() {
        let dir = TempDir::new().unwrap();
        let (alpha, mut alpha_events) = provider("alpha", &dir);
        let (beta, mut beta_events) = provider("beta", &dir);

        // Network change while stopped is a no-op
        alpha.network_changed().await.unwrap();
        assert_eq!(alpha.state().await, ProviderState::Stopped);

        alpha.start_discovery().await.unwrap();
        beta.start_discovery().await.unwrap();
        let alpha_udp = alpha.discovery_addr().await.unwrap();
        let beta_udp = beta.discovery_addr().await.unwrap();
        alpha.send_identity_to(beta_udp).await.unwrap();
        beta.send_identity_to(alpha_udp).await.unwrap();

        let alpha_link = loop {
            if let ProviderEvent::ConnectionReceived { link, .. } =
                next_event(&mut alpha_events).await
            {
                break link;
            }
        };
        let beta_link = loop {
            if let ProviderEvent::ConnectionReceived { link, .. } =
                next_event(&mut beta_events).await
            {
                break link;
            }
        };

        alpha.network_changed().await.unwrap();
        assert_eq!(alpha.state().await, ProviderState::Running);
        let port = alpha.tcp_port().await.expect("listener rebound");
        assert_eq!(alpha.local_identity().await.tcp_port, Some(port));
        assert!(alpha.discovery_addr().await.is_some());
        loop {
            if let ProviderEvent::Started { tcp_port } = next_event(&mut alpha_events).await {
                assert_eq!(tcp_port, port);
                break;
            }
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(alpha_link.is_open());
        assert!(beta_link.is_open());
        while let Ok(event) = alpha_events.try_recv() {
            assert!(!event.is_connection(), "unexpected {:?}", event);
        }

        alpha.stop_discovery().await.unwrap();
        beta.stop_discovery().await.unwrap();
    }
}
