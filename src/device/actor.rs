//! Device actor
//!
//! One task per remote device. Host commands, events of the attached link
//! and the pairing timer are handled serially by that task, so the pairing
//! state machine never sees concurrent inputs. The host talks to the actor
//! through a cloneable [`DeviceHandle`] and listens on the
//! [`DeviceEvent`] channel returned by [`Device::spawn`].

use super::events::DeviceEvent;
use super::pairing::{PairState, PairingAction, PairingInput, PairingSignal, PairingStateMachine};
use crate::config::PairingConfig;
use crate::crypto::CertificateService;
use crate::error::{ProtocolError, Result};
use crate::network::link::{Link, LinkEvent, LinkEventReceiver, LinkId, SendTag};
use crate::plugins::PluginManager;
use crate::protocol::{
    DeviceIdentity, Packet, PairPacket, PACKET_TYPE_IDENTITY, PACKET_TYPE_PAIR, PACKET_TYPE_PING,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Tag the device uses for its own pairing packets
///
/// Completions for it are logged and not reported; hosts should use
/// non-negative tags.
pub const PAIRING_TAG: SendTag = -1;

/// What a host persists about a known device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub identity: DeviceIdentity,
    pub paired: bool,
}

impl DeviceRecord {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            paired: false,
        }
    }
}

/// Point-in-time view of a device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSnapshot {
    pub identity: DeviceIdentity,
    pub pair_state: PairState,
    pub reachable: bool,
    pub link_id: Option<LinkId>,
    /// Packet types currently delivered to plugins
    pub routed_types: Vec<String>,
    pub failed_plugins: Vec<String>,
    /// The attached link presented a certificate other than the trusted one
    pub trust_violation: bool,
}

impl DeviceSnapshot {
    pub fn record(&self) -> DeviceRecord {
        DeviceRecord {
            identity: self.identity.clone(),
            paired: self.pair_state.is_paired(),
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    RequestPairing(Reply<()>),
    AcceptPairing(Reply<()>),
    RejectPairing(Reply<()>),
    Unpair(Reply<()>),
    SendPacket {
        packet: Packet,
        tag: SendTag,
        reply: Reply<()>,
    },
    AttachLink {
        link: Arc<dyn Link>,
        events: LinkEventReceiver,
        reply: Reply<()>,
    },
    UpdateIdentity {
        identity: DeviceIdentity,
        reply: Reply<()>,
    },
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle to a device actor
#[derive(Clone)]
pub struct DeviceHandle {
    device_id: String,
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<DeviceSnapshot>,
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

impl DeviceHandle {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Current state of the device
    pub fn snapshot(&self) -> DeviceSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Watch the snapshot change
    pub fn subscribe(&self) -> watch::Receiver<DeviceSnapshot> {
        self.snapshot.clone()
    }

    /// Ask the peer to pair; needs a reachable link
    pub async fn request_pairing(&self) -> Result<()> {
        self.call(Command::RequestPairing).await
    }

    /// Accept the peer's pending request; needs a reachable link
    pub async fn accept_pairing(&self) -> Result<()> {
        self.call(Command::AcceptPairing).await
    }

    pub async fn reject_pairing(&self) -> Result<()> {
        self.call(Command::RejectPairing).await
    }

    /// Drop the pairing; the peer is told if it is reachable
    pub async fn unpair(&self) -> Result<()> {
        self.call(Command::Unpair).await
    }

    /// Send an application packet to a paired, reachable device
    ///
    /// Delivery is reported as `SendSucceeded`/`SendFailed` for `tag`.
    pub async fn send_packet(&self, packet: Packet, tag: SendTag) -> Result<()> {
        self.call(|reply| Command::SendPacket { packet, tag, reply })
            .await
    }

    /// Make `link` the device's link, replacing the current one
    pub async fn attach_link(&self, link: Arc<dyn Link>, events: LinkEventReceiver) -> Result<()> {
        self.call(|reply| Command::AttachLink {
            link,
            events,
            reply,
        })
        .await
    }

    /// Replace the peer identity, e.g. after a new discovery datagram
    pub async fn update_identity(&self, identity: DeviceIdentity) -> Result<()> {
        self.call(|reply| Command::UpdateIdentity { identity, reply })
            .await
    }

    /// Stop the actor, shut down plugins and disconnect the link
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| ProtocolError::other("device actor stopped"))?;
        rx.await
            .map_err(|_| ProtocolError::other("device actor stopped"))?
    }
}

struct Attached {
    link: Arc<dyn Link>,
    events: LinkEventReceiver,
}

/// State owned by a device actor task
pub struct Device {
    identity: DeviceIdentity,
    certs: Arc<CertificateService>,
    pairing: PairingStateMachine,
    plugins: PluginManager,
    attached: Option<Attached>,
    pair_timeout: Duration,
    timer: Option<Instant>,
    trust_violation: bool,
    events: mpsc::UnboundedSender<DeviceEvent>,
    snapshot: watch::Sender<DeviceSnapshot>,
}

impl Device {
    /// Start the actor for a known or newly discovered device
    ///
    /// `plugins` should already have its plugins registered. A record
    /// marked paired is only honoured if the trust store still has the
    /// device.
    pub fn spawn(
        record: DeviceRecord,
        certs: Arc<CertificateService>,
        mut plugins: PluginManager,
        config: &PairingConfig,
    ) -> (DeviceHandle, mpsc::UnboundedReceiver<DeviceEvent>) {
        let DeviceRecord { identity, paired } = record;
        let trusted = certs.is_trusted(&identity.device_id);
        if paired && !trusted {
            warn!(
                "Device {} was paired but has no trust record, starting unpaired",
                identity.device_id
            );
        }
        let pair_state = if paired && trusted {
            PairState::Paired
        } else {
            PairState::NotPaired
        };

        plugins.update_peer_capabilities(identity.outgoing_capabilities.iter().cloned());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let device = Device {
            identity,
            certs,
            pairing: PairingStateMachine::with_state(pair_state),
            plugins,
            attached: None,
            pair_timeout: config.timeout(),
            timer: None,
            trust_violation: false,
            events: events_tx,
            snapshot: watch::channel(placeholder_snapshot()).0,
        };
        let snapshot_rx = device.snapshot.subscribe();
        device.publish();

        let handle = DeviceHandle {
            device_id: device.identity.device_id.clone(),
            commands: commands_tx,
            snapshot: snapshot_rx,
        };

        info!(
            "Device {} ({}) started as {:?}",
            device.identity.device_name,
            device.identity.device_id,
            device.pairing.state()
        );
        tokio::spawn(device.run(commands_rx));
        (handle, events_rx)
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let deadline = self.timer;
            tokio::select! {
                biased;
                event = next_link_event(&mut self.attached) => self.handle_link_event(event).await,
                command = commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        self.stop().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.stop().await;
                        break;
                    }
                },
                _ = sleep_until(deadline) => {
                    self.timer = None;
                    if let Err(e) = self.apply(PairingInput::TimerExpired) {
                        warn!("Pairing timer for {} failed: {}", self.identity.device_id, e);
                    }
                }
            }
        }
        debug!("Device {} actor stopped", self.identity.device_id);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::RequestPairing(reply) => {
                let result = self
                    .ensure_reachable()
                    .and_then(|()| self.apply(PairingInput::RequestPairing));
                let _ = reply.send(result);
            }
            Command::AcceptPairing(reply) => {
                let result = self
                    .ensure_reachable()
                    .and_then(|()| self.apply(PairingInput::AcceptPairing));
                let _ = reply.send(result);
            }
            Command::RejectPairing(reply) => {
                let _ = reply.send(self.apply(PairingInput::RejectPairing));
            }
            Command::Unpair(reply) => {
                let _ = reply.send(self.apply(PairingInput::Unpair));
            }
            Command::SendPacket { packet, tag, reply } => {
                let _ = reply.send(self.send_application_packet(packet, tag));
            }
            Command::AttachLink {
                link,
                events,
                reply,
            } => {
                let _ = reply.send(self.attach(link, events));
            }
            Command::UpdateIdentity { identity, reply } => {
                let _ = reply.send(self.replace_identity(identity));
            }
            Command::Shutdown(_) => {}
        }
    }

    fn ensure_reachable(&self) -> Result<()> {
        self.require_link().map(|_| ())
    }

    fn require_link(&self) -> Result<&Arc<dyn Link>> {
        self.attached
            .as_ref()
            .map(|attached| &attached.link)
            .filter(|link| link.is_open())
            .ok_or_else(|| ProtocolError::NotReachable(self.identity.device_id.clone()))
    }

    fn send_application_packet(&self, packet: Packet, tag: SendTag) -> Result<()> {
        if packet.is_type(PACKET_TYPE_PAIR) {
            return Err(ProtocolError::pairing(
                "pair packets are sent through the pairing API",
            ));
        }
        if !self.pairing.state().is_paired() || self.trust_violation {
            return Err(ProtocolError::NotPaired(self.identity.device_id.clone()));
        }
        let link = self.require_link()?;
        debug!(
            "Sending '{}' to {} with tag {}",
            packet.packet_type(),
            self.identity.device_id,
            tag
        );
        link.send_packet(packet, tag)
    }

    fn attach(&mut self, link: Arc<dyn Link>, events: LinkEventReceiver) -> Result<()> {
        if link.device_id() != self.identity.device_id {
            return Err(ProtocolError::violation(format!(
                "link for {} offered to device {}",
                link.device_id(),
                self.identity.device_id
            )));
        }

        let was_reachable = self.is_reachable();
        if let Some(previous) = self.attached.take() {
            if previous.link.id() != link.id() && previous.link.is_open() {
                info!(
                    "Replacing {} of {} with {}",
                    previous.link.id(),
                    self.identity.device_id,
                    link.id()
                );
                previous.link.disconnect();
            }
        }

        let identity = link.peer_identity().clone();
        let fingerprint = link.peer_fingerprint().to_string();
        info!("Attached {} to device {}", link.id(), self.identity.device_id);
        self.attached = Some(Attached { link, events });

        if identity != self.identity {
            self.set_identity(identity);
        }

        match self.certs.check_trust(&self.identity.device_id, &fingerprint) {
            Ok(true) => {
                self.trust_violation = false;
                if !self.pairing.state().is_paired() {
                    debug!("{} is already trusted", self.identity.device_id);
                    self.timer = None;
                    self.pairing.restore_paired();
                }
            }
            Ok(false) => {
                self.trust_violation = false;
                if self.pairing.state().is_paired() {
                    warn!(
                        "{} lost its trust record, marking unpaired",
                        self.identity.device_id
                    );
                    self.pairing.reset();
                }
            }
            Err(ProtocolError::TrustViolation {
                expected, presented, ..
            }) => {
                self.trust_violation = true;
                self.timer = None;
                self.pairing.reset();
                self.emit(DeviceEvent::TrustViolation { expected, presented });
            }
            Err(e) => warn!(
                "Trust lookup for {} failed: {}",
                self.identity.device_id, e
            ),
        }

        if !was_reachable {
            self.emit(DeviceEvent::ReachabilityChanged { reachable: true });
        }
        self.publish();
        Ok(())
    }

    fn replace_identity(&mut self, identity: DeviceIdentity) -> Result<()> {
        if identity.device_id != self.identity.device_id {
            return Err(ProtocolError::violation(format!(
                "identity of {} offered to device {}",
                identity.device_id, self.identity.device_id
            )));
        }
        if identity != self.identity {
            self.set_identity(identity);
            self.publish();
        }
        Ok(())
    }

    /// Swap the identity wholesale and reload plugin routes
    fn set_identity(&mut self, identity: DeviceIdentity) {
        debug!("Identity of {} updated", identity.device_id);
        self.identity = identity;
        self.emit(DeviceEvent::IdentityUpdated {
            identity: self.identity.clone(),
        });
        let outgoing = self.identity.outgoing_capabilities.iter().cloned();
        if self.plugins.update_peer_capabilities(outgoing) {
            self.emit(DeviceEvent::PluginsChanged {
                routed_types: self.plugins.routed_types(),
            });
        }
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::PacketReceived(packet) => self.dispatch(packet).await,
            LinkEvent::SendSucceeded { tag } if tag == PAIRING_TAG => {
                debug!("Pairing packet delivered to {}", self.identity.device_id);
            }
            LinkEvent::SendFailed { tag, error } if tag == PAIRING_TAG => {
                warn!(
                    "Pairing packet to {} failed: {}",
                    self.identity.device_id, error
                );
            }
            LinkEvent::SendSucceeded { tag } => self.emit(DeviceEvent::SendSucceeded { tag }),
            LinkEvent::SendFailed { tag, error } => {
                self.emit(DeviceEvent::SendFailed { tag, error })
            }
            LinkEvent::PayloadProgress {
                tag,
                packet_id,
                transferred,
                total,
            } => self.emit(DeviceEvent::PayloadProgress {
                tag,
                packet_id,
                transferred,
                total,
            }),
            LinkEvent::PayloadFailed {
                tag,
                packet_id,
                error,
            } => self.emit(DeviceEvent::PayloadFailed {
                tag,
                packet_id,
                error,
            }),
            LinkEvent::Destroyed { reason } => {
                info!(
                    "Link of {} destroyed: {}",
                    self.identity.device_id,
                    reason.as_deref().unwrap_or("disconnected")
                );
                self.attached = None;
                self.emit(DeviceEvent::LinkDestroyed { reason });
                self.emit(DeviceEvent::ReachabilityChanged { reachable: false });
                self.publish();
            }
        }
    }

    async fn dispatch(&mut self, packet: Packet) {
        match packet.packet_type() {
            PACKET_TYPE_IDENTITY => match DeviceIdentity::from_packet(&packet) {
                Ok(identity) => {
                    if let Err(e) = self.replace_identity(identity) {
                        warn!("Ignoring identity packet: {}", e);
                    }
                }
                Err(e) => warn!(
                    "Invalid identity packet from {}: {}",
                    self.identity.device_id, e
                ),
            },
            PACKET_TYPE_PAIR => match PairPacket::parse(&packet) {
                Ok(pair) => {
                    if let Err(e) = self.apply(PairingInput::PeerPacket(pair)) {
                        warn!("Pair packet from {} failed: {}", self.identity.device_id, e);
                    }
                }
                Err(e) => warn!(
                    "Invalid pair packet from {}: {}",
                    self.identity.device_id, e
                ),
            },
            PACKET_TYPE_PING => {
                info!("Ping from {}", self.identity.device_id);
                self.emit(DeviceEvent::PingReceived {
                    message: packet.get_str("message").map(str::to_string),
                });
            }
            packet_type => {
                if !self.is_authorized() {
                    warn!(
                        target: "security_audit",
                        "Dropping '{}' from {}: device is not paired with this certificate",
                        packet_type, self.identity.device_id
                    );
                    return;
                }
                if !self.plugins.can_route(packet_type) {
                    debug!(
                        "No plugin for '{}' from {}",
                        packet_type, self.identity.device_id
                    );
                    return;
                }
                if let Err(e) = self.plugins.route_packet(&packet).await {
                    warn!("{}", e);
                }
            }
        }
    }

    /// Paired, and the link presents the trusted certificate
    fn is_authorized(&self) -> bool {
        if !self.pairing.state().is_paired() || self.trust_violation {
            return false;
        }
        let Some(attached) = &self.attached else {
            return false;
        };
        matches!(
            self.certs
                .check_trust(&self.identity.device_id, attached.link.peer_fingerprint()),
            Ok(true)
        )
    }

    fn apply(&mut self, input: PairingInput) -> Result<()> {
        let actions = self.pairing.handle(input)?;
        for action in actions {
            self.perform(action);
        }
        self.publish();
        Ok(())
    }

    fn perform(&mut self, action: PairingAction) {
        let device_id = self.identity.device_id.clone();
        match action {
            PairingAction::Send(pair) => match self.require_link() {
                Ok(link) => {
                    if let Err(e) = link.send_packet(pair.to_packet(), PAIRING_TAG) {
                        warn!("Could not send pair packet to {}: {}", device_id, e);
                    }
                }
                Err(_) => debug!("{} unreachable, pair packet not sent", device_id),
            },
            PairingAction::StartTimer => {
                self.timer = Some(Instant::now() + self.pair_timeout);
            }
            PairingAction::CancelTimer => self.timer = None,
            PairingAction::RecordTrust => {
                let fingerprint = self
                    .attached
                    .as_ref()
                    .map(|attached| attached.link.peer_fingerprint().to_string());
                match fingerprint {
                    Some(fingerprint) => {
                        if let Err(e) = self.certs.record_trust(&device_id, &fingerprint) {
                            warn!("Could not record trust for {}: {}", device_id, e);
                        }
                        self.trust_violation = false;
                    }
                    None => warn!("Paired with {} without a link to pin", device_id),
                }
            }
            PairingAction::ClearTrust => {
                if let Err(e) = self.certs.clear_trust(&device_id) {
                    warn!("Could not clear trust for {}: {}", device_id, e);
                }
            }
            PairingAction::Notify(signal) => {
                let event = match signal {
                    PairingSignal::RequestReceived { timestamp } => {
                        info!("Pair request from {}", device_id);
                        DeviceEvent::PairRequest {
                            verification_key: self.verification_key(timestamp),
                        }
                    }
                    PairingSignal::Timeout => {
                        info!("Pair request to {} timed out", device_id);
                        DeviceEvent::PairTimeout
                    }
                    PairingSignal::Success => {
                        info!("Paired with {}", device_id);
                        DeviceEvent::PairSuccess
                    }
                    PairingSignal::Rejected => {
                        info!("Pairing with {} rejected", device_id);
                        DeviceEvent::PairRejected
                    }
                    PairingSignal::Unpaired => {
                        info!("Unpaired from {}", device_id);
                        DeviceEvent::Unpaired
                    }
                };
                self.emit(event);
            }
        }
    }

    fn verification_key(&self, timestamp: Option<i64>) -> Option<String> {
        let attached = self.attached.as_ref()?;
        self.certs
            .verification_key(attached.link.peer_certificate(), timestamp)
            .map_err(|e| debug!("No verification key for {}: {}", self.identity.device_id, e))
            .ok()
    }

    fn is_reachable(&self) -> bool {
        self.attached
            .as_ref()
            .is_some_and(|attached| attached.link.is_open())
    }

    fn emit(&self, event: DeviceEvent) {
        if self.events.send(event).is_err() {
            debug!("Device event dropped, no receiver");
        }
    }

    fn publish(&self) {
        self.snapshot.send_replace(DeviceSnapshot {
            identity: self.identity.clone(),
            pair_state: self.pairing.state(),
            reachable: self.is_reachable(),
            link_id: self.attached.as_ref().map(|attached| attached.link.id()),
            routed_types: self.plugins.routed_types(),
            failed_plugins: self.plugins.failed_plugins(),
            trust_violation: self.trust_violation,
        });
    }

    async fn stop(&mut self) {
        if let Some(attached) = self.attached.take() {
            attached.link.disconnect();
        }
        if let Err(e) = self.plugins.shutdown_all().await {
            warn!("Plugin shutdown for {} failed: {}", self.identity.device_id, e);
        }
        self.timer = None;
        self.publish();
    }
}

fn placeholder_snapshot() -> DeviceSnapshot {
    DeviceSnapshot {
        identity: DeviceIdentity::new("", "", Default::default()),
        pair_state: PairState::NotPaired,
        reachable: false,
        link_id: None,
        routed_types: Vec::new(),
        failed_plugins: Vec::new(),
        trust_violation: false,
    }
}

/// Next event of the attached link; pending forever without one
async fn next_link_event(attached: &mut Option<Attached>) -> LinkEvent {
    match attached {
        Some(attached) => match attached.events.recv().await {
            Some(event) => event,
            None => LinkEvent::Destroyed {
                reason: Some("link event channel closed".to_string()),
            },
        },
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CertificateInfo, KeyAlgorithm};
    use crate::network::link::LinkDirection;
    use crate::plugins::Plugin;
    use crate::protocol::DeviceType;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Debug)]
    struct MockLink {
        id: LinkId,
        identity: DeviceIdentity,
        fingerprint: String,
        open: AtomicBool,
        sent: Mutex<Vec<Packet>>,
    }

    impl MockLink {
        fn new(identity: DeviceIdentity, fingerprint: &str) -> Arc<Self> {
            Arc::new(Self {
                id: LinkId::next(),
                identity,
                fingerprint: fingerprint.to_string(),
                open: AtomicBool::new(true),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent_pairs(&self) -> Vec<PairPacket> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter_map(|p| PairPacket::parse(p).ok())
                .collect()
        }
    }

    impl Link for MockLink {
        fn id(&self) -> LinkId {
            self.id
        }
        fn device_id(&self) -> &str {
            &self.identity.device_id
        }
        fn peer_identity(&self) -> &DeviceIdentity {
            &self.identity
        }
        fn peer_certificate(&self) -> &[u8] {
            &[]
        }
        fn peer_fingerprint(&self) -> &str {
            &self.fingerprint
        }
        fn direction(&self) -> LinkDirection {
            LinkDirection::Inbound
        }
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
        fn send_packet(&self, packet: Packet, _tag: SendTag) -> Result<()> {
            if !self.is_open() {
                return Err(ProtocolError::LinkClosed);
            }
            self.sent.lock().unwrap().push(packet);
            Ok(())
        }
        fn disconnect(&self) {
            self.open.store(false, Ordering::SeqCst);
        }
    }

    struct Recorder {
        received: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Plugin for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }
        fn incoming_capabilities(&self) -> Vec<String> {
            vec!["kdeconnect.clipboard".to_string()]
        }
        fn outgoing_capabilities(&self) -> Vec<String> {
            vec![]
        }
        async fn handle_packet(&mut self, packet: &Packet) -> Result<()> {
            self.received
                .lock()
                .unwrap()
                .push(packet.packet_type().to_string());
            Ok(())
        }
        async fn initialize(&mut self) -> Result<()> {
            Ok(())
        }
        async fn shutdown(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        handle: DeviceHandle,
        events: mpsc::UnboundedReceiver<DeviceEvent>,
        certs: Arc<CertificateService>,
        received: Arc<Mutex<Vec<String>>>,
        peer: DeviceIdentity,
    }

    async fn fixture(paired: bool) -> Fixture {
        let certs = Arc::new(CertificateService::in_memory(
            CertificateInfo::generate_with("local", KeyAlgorithm::EcdsaP256).unwrap(),
        ));
        let peer = DeviceIdentity::new("peer", "Peer", DeviceType::Phone)
            .with_capabilities(["kdeconnect.ping"], ["kdeconnect.clipboard"]);
        if paired {
            certs.record_trust("peer", "AA:AA").unwrap();
        }

        let received = Arc::new(Mutex::new(Vec::new()));
        let mut plugins = PluginManager::new();
        plugins
            .register_plugin(Box::new(Recorder {
                received: Arc::clone(&received),
            }))
            .await
            .unwrap();

        let record = DeviceRecord {
            identity: peer.clone(),
            paired,
        };
        let config = PairingConfig { timeout_secs: 30 };
        let (handle, events) = Device::spawn(record, Arc::clone(&certs), plugins, &config);
        Fixture {
            handle,
            events,
            certs,
            received,
            peer,
        }
    }

    async fn attach(
        fixture: &Fixture,
        fingerprint: &str,
    ) -> (Arc<MockLink>, mpsc::UnboundedSender<LinkEvent>) {
        let link = MockLink::new(fixture.peer.clone(), fingerprint);
        let (tx, rx) = mpsc::unbounded_channel();
        fixture.handle.attach_link(link.clone(), rx).await.unwrap();
        (link, tx)
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<DeviceEvent>) -> DeviceEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for device event")
            .expect("device channel closed")
    }

    /// Round trip through the actor so earlier link events are processed
    async fn settle(handle: &DeviceHandle) {
        let _ = handle.update_identity(handle.snapshot().identity).await;
    }

    #[tokio::test]
    async fn test_pairing_requires_link() {
        let fixture = fixture(false).await;
        assert!(matches!(
            fixture.handle.request_pairing().await,
            Err(ProtocolError::NotReachable(_))
        ));
        assert!(matches!(
            fixture
                .handle
                .send_packet(Packet::new("kdeconnect.clipboard", json!({})), 1)
                .await,
            Err(ProtocolError::NotPaired(_))
        ));
    }

    #[tokio::test]
    async fn test_request_then_peer_accepts() {
        let mut fixture = fixture(false).await;
        let (link, tx) = attach(&fixture, "AA:BB").await;
        assert_eq!(
            next_event(&mut fixture.events).await,
            DeviceEvent::ReachabilityChanged { reachable: true }
        );

        fixture.handle.request_pairing().await.unwrap();
        assert_eq!(fixture.handle.snapshot().pair_state, PairState::RequestedByLocal);
        assert!(link.sent_pairs()[0].pair);

        tx.send(LinkEvent::PacketReceived(PairPacket::accept().to_packet()))
            .unwrap();
        assert_eq!(next_event(&mut fixture.events).await, DeviceEvent::PairSuccess);
        assert_eq!(fixture.handle.snapshot().pair_state, PairState::Paired);
        assert!(fixture.certs.check_trust("peer", "AA:BB").unwrap());

        // Paired: application packets go out and come in
        fixture
            .handle
            .send_packet(Packet::new("kdeconnect.clipboard", json!({"content": "x"})), 7)
            .await
            .unwrap();
        tx.send(LinkEvent::PacketReceived(Packet::new(
            "kdeconnect.clipboard",
            json!({"content": "y"}),
        )))
        .unwrap();
        settle(&fixture.handle).await;
        assert_eq!(*fixture.received.lock().unwrap(), vec!["kdeconnect.clipboard"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_times_out_once() {
        let mut fixture = fixture(false).await;
        let (link, _tx) = attach(&fixture, "AA:BB").await;
        let _ = next_event(&mut fixture.events).await;

        fixture.handle.request_pairing().await.unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;

        assert_eq!(next_event(&mut fixture.events).await, DeviceEvent::PairTimeout);
        assert_eq!(fixture.handle.snapshot().pair_state, PairState::NotPaired);
        // Request, then the cancel sent on expiry
        let pairs = link.sent_pairs();
        assert_eq!(pairs.len(), 2);
        assert!(!pairs[1].pair);

        tokio::time::advance(Duration::from_secs(60)).await;
        settle(&fixture.handle).await;
        assert!(fixture.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_trust_violation_blocks_plugins() {
        let mut fixture = fixture(true).await;
        assert_eq!(fixture.handle.snapshot().pair_state, PairState::Paired);

        let (_link, tx) = attach(&fixture, "EE:EE").await;
        assert_eq!(
            next_event(&mut fixture.events).await,
            DeviceEvent::TrustViolation {
                expected: "AA:AA".to_string(),
                presented: "EE:EE".to_string(),
            }
        );
        let snapshot = fixture.handle.snapshot();
        assert!(snapshot.trust_violation);
        assert_eq!(snapshot.pair_state, PairState::NotPaired);

        tx.send(LinkEvent::PacketReceived(Packet::new(
            "kdeconnect.clipboard",
            json!({"content": "z"}),
        )))
        .unwrap();
        settle(&fixture.handle).await;
        assert!(fixture.received.lock().unwrap().is_empty());

        // The record survives until a new pairing replaces it
        assert_eq!(
            fixture.certs.trusted_fingerprint("peer").unwrap().as_deref(),
            Some("AA:AA")
        );
    }

    #[tokio::test]
    async fn test_peer_request_accept_and_unpair() {
        let mut fixture = fixture(false).await;
        let (link, tx) = attach(&fixture, "AA:BB").await;
        let _ = next_event(&mut fixture.events).await;

        tx.send(LinkEvent::PacketReceived(PairPacket::request().to_packet()))
            .unwrap();
        assert!(matches!(
            next_event(&mut fixture.events).await,
            DeviceEvent::PairRequest { .. }
        ));

        fixture.handle.accept_pairing().await.unwrap();
        assert_eq!(next_event(&mut fixture.events).await, DeviceEvent::PairSuccess);
        assert!(link.sent_pairs().last().unwrap().pair);

        fixture.handle.unpair().await.unwrap();
        assert_eq!(next_event(&mut fixture.events).await, DeviceEvent::Unpaired);
        assert!(!link.sent_pairs().last().unwrap().pair);
        assert!(!fixture.certs.is_trusted("peer"));
    }

    #[tokio::test]
    async fn test_link_replacement_and_loss() {
        let mut fixture = fixture(true).await;
        let (first, _first_tx) = attach(&fixture, "AA:AA").await;
        let _ = next_event(&mut fixture.events).await;
        assert_eq!(fixture.handle.snapshot().pair_state, PairState::Paired);

        let (second, second_tx) = attach(&fixture, "AA:AA").await;
        assert!(!first.is_open());
        assert!(second.is_open());
        assert_eq!(fixture.handle.snapshot().link_id, Some(second.id()));

        second_tx
            .send(LinkEvent::Destroyed {
                reason: Some("reset".to_string()),
            })
            .unwrap();
        assert_eq!(
            next_event(&mut fixture.events).await,
            DeviceEvent::LinkDestroyed {
                reason: Some("reset".to_string())
            }
        );
        assert_eq!(
            next_event(&mut fixture.events).await,
            DeviceEvent::ReachabilityChanged { reachable: false }
        );
        let snapshot = fixture.handle.snapshot();
        assert!(!snapshot.reachable);
        assert_eq!(snapshot.pair_state, PairState::Paired);
        assert!(snapshot.record().paired);
    }

    #[tokio::test]
    async fn test_identity_packet_reloads_routes() {
        let mut fixture = fixture(true).await;
        let (_link, tx) = attach(&fixture, "AA:AA").await;
        let _ = next_event(&mut fixture.events).await;
        assert_eq!(fixture.handle.snapshot().routed_types, vec!["kdeconnect.clipboard"]);

        let updated = DeviceIdentity::new("peer", "Renamed", DeviceType::Phone)
            .with_capabilities(["kdeconnect.ping"], ["kdeconnect.ping"]);
        tx.send(LinkEvent::PacketReceived(updated.to_packet())).unwrap();

        assert!(matches!(
            next_event(&mut fixture.events).await,
            DeviceEvent::IdentityUpdated { identity } if identity.device_name == "Renamed"
        ));
        assert_eq!(
            next_event(&mut fixture.events).await,
            DeviceEvent::PluginsChanged {
                routed_types: vec![]
            }
        );
    }
}
