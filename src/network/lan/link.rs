//! LAN link
//!
//! One TLS session over TCP, split into a reader task and a writer task.
//! `send_packet` only queues; the writer serializes packets in order and
//! hands payloads to their own side-channel tasks so a large transfer never
//! blocks control traffic.
//!
//! Closing is funnelled through one flag: whoever flips it first (local
//! `disconnect()`, a read error, a write error, or dropping the link)
//! records the reason and cancels the session token. The writer task then
//! fails whatever is still queued and emits `Destroyed` as its last act, so
//! that event is sent exactly once.

use super::handshake::Established;
use super::payload::{self, PayloadSettings, PayloadUpload};
use crate::error::{ProtocolError, Result};
use crate::network::link::{
    Link, LinkDirection, LinkEvent, LinkEventReceiver, LinkId, SendTag,
};
use crate::protocol::{DeviceIdentity, Packet, Payload, MAX_PACKET_SIZE};
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsStream;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound for the TLS close_notify on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

type Stream = TlsStream<TcpStream>;

struct Outbound {
    packet: Packet,
    tag: SendTag,
}

/// State shared by the link handle and its tasks
struct Shared {
    id: LinkId,
    device_id: String,
    remote_addr: SocketAddr,
    peer_fingerprint: String,
    settings: Arc<PayloadSettings>,
    closed: AtomicBool,
    reason: Mutex<Option<String>>,
    shutdown: CancellationToken,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl Shared {
    fn emit(&self, event: LinkEvent) {
        // The owner may have stopped listening
        let _ = self.events.send(event);
    }

    /// Flip the closed flag; only the first caller's reason is kept
    fn close(&self, reason: Option<String>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        match &reason {
            Some(reason) => info!("{} to {} closing: {}", self.id, self.device_id, reason),
            None => info!("{} to {} disconnected locally", self.id, self.device_id),
        }
        if let Ok(mut slot) = self.reason.lock() {
            *slot = reason;
        }
        self.shutdown.cancel();
    }

    fn take_reason(&self) -> Option<String> {
        self.reason.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// A TLS link to one peer on the local network
pub struct LanLink {
    identity: DeviceIdentity,
    peer_certificate: Vec<u8>,
    direction: LinkDirection,
    outbound: mpsc::UnboundedSender<Outbound>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for LanLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanLink")
            .field("id", &self.shared.id)
            .field("device_id", &self.identity.device_id)
            .field("remote_addr", &self.shared.remote_addr)
            .field("direction", &self.direction)
            .field("open", &self.is_open())
            .finish()
    }
}

impl LanLink {
    /// Start the reader and writer tasks for a finished handshake
    pub fn spawn(
        established: Established,
        settings: Arc<PayloadSettings>,
    ) -> (Arc<LanLink>, LinkEventReceiver) {
        let Established {
            stream,
            identity,
            peer_certificate,
            peer_fingerprint,
            remote_addr,
            direction,
        } = established;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            id: LinkId::next(),
            device_id: identity.device_id.clone(),
            remote_addr,
            peer_fingerprint,
            settings,
            closed: AtomicBool::new(false),
            reason: Mutex::new(None),
            shutdown: CancellationToken::new(),
            events: events_tx,
        });

        let (read_half, write_half) = tokio::io::split(stream);
        tokio::spawn(read_loop(read_half, Arc::clone(&shared)));
        tokio::spawn(write_loop(write_half, outbound_rx, Arc::clone(&shared)));

        debug!("{} to {} at {} started", shared.id, shared.device_id, remote_addr);

        let link = Arc::new(LanLink {
            identity,
            peer_certificate,
            direction,
            outbound: outbound_tx,
            shared,
        });
        (link, events_rx)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.remote_addr
    }
}

impl Link for LanLink {
    fn id(&self) -> LinkId {
        self.shared.id
    }

    fn device_id(&self) -> &str {
        &self.identity.device_id
    }

    fn peer_identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    fn peer_certificate(&self) -> &[u8] {
        &self.peer_certificate
    }

    fn peer_fingerprint(&self) -> &str {
        &self.shared.peer_fingerprint
    }

    fn direction(&self) -> LinkDirection {
        self.direction
    }

    fn is_open(&self) -> bool {
        !self.shared.closed.load(Ordering::SeqCst)
    }

    fn send_packet(&self, packet: Packet, tag: SendTag) -> Result<()> {
        if !self.is_open() {
            return Err(ProtocolError::LinkClosed);
        }
        self.outbound
            .send(Outbound { packet, tag })
            .map_err(|_| ProtocolError::LinkClosed)
    }

    fn disconnect(&self) {
        self.shared.close(None);
    }
}

impl Drop for LanLink {
    fn drop(&mut self) {
        self.shared.close(Some("link dropped".to_string()));
    }
}

async fn read_loop(read_half: ReadHalf<Stream>, shared: Arc<Shared>) {
    let mut frames = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_PACKET_SIZE));

    loop {
        let frame = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            frame = frames.next() => frame,
        };

        let line = match frame {
            Some(Ok(line)) => line,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                warn!("{} received a frame over {} bytes", shared.id, MAX_PACKET_SIZE);
                shared.close(Some(
                    ProtocolError::violation(format!("frame exceeds {} bytes", MAX_PACKET_SIZE))
                        .to_string(),
                ));
                break;
            }
            Some(Err(LinesCodecError::Io(e))) if e.kind() == std::io::ErrorKind::InvalidData => {
                warn!("{} received a frame that is not UTF-8", shared.id);
                shared.close(Some(
                    ProtocolError::violation(format!("frame is not UTF-8: {}", e)).to_string(),
                ));
                break;
            }
            Some(Err(LinesCodecError::Io(e))) => {
                shared.close(Some(ProtocolError::from(e).to_string()));
                break;
            }
            None => {
                shared.close(Some("connection closed by peer".to_string()));
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let packet = match Packet::from_bytes(line.as_bytes()) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("{} received an undecodable frame: {}", shared.id, e);
                shared.close(Some(ProtocolError::violation(e.to_string()).to_string()));
                break;
            }
        };

        debug!(
            "{} received '{}' from {}",
            shared.id,
            packet.packet_type(),
            shared.device_id
        );

        if packet.expects_payload() {
            tokio::spawn(receive_payload(packet, Arc::clone(&shared)));
        } else {
            shared.emit(LinkEvent::PacketReceived(packet));
        }
    }
}

async fn write_loop(
    mut write_half: WriteHalf<Stream>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    shared: Arc<Shared>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            next = outbound.recv() => next,
        };
        let Some(Outbound { packet, tag }) = next else {
            shared.close(None);
            break;
        };

        let sent = tokio::select! {
            result = send_one(&mut write_half, packet, tag, &shared) => result,
            _ = shared.shutdown.cancelled() => Err(ProtocolError::LinkClosed),
        };
        if let Err(e) = sent {
            shared.emit(LinkEvent::SendFailed {
                tag,
                error: e.to_string(),
            });
            if matches!(e, ProtocolError::LinkClosed) {
                break;
            }
            if e.is_fatal_to_link() {
                shared.close(Some(e.to_string()));
                break;
            }
        }
    }

    outbound.close();
    while let Ok(Outbound { tag, .. }) = outbound.try_recv() {
        shared.emit(LinkEvent::SendFailed {
            tag,
            error: ProtocolError::LinkClosed.to_string(),
        });
    }

    if tokio::time::timeout(SHUTDOWN_GRACE, write_half.shutdown())
        .await
        .is_err()
    {
        debug!("{} TLS shutdown did not finish in time", shared.id);
    }

    shared.emit(LinkEvent::Destroyed {
        reason: shared.take_reason(),
    });
}

/// Write one packet; packets with a payload get a side channel first
///
/// Only control-channel failures are returned; payload failures are
/// reported from the transfer task.
async fn send_one<W>(writer: &mut W, mut packet: Packet, tag: SendTag, shared: &Arc<Shared>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let Some(payload) = packet.take_payload() else {
        write_packet(writer, &packet).await?;
        debug!("{} sent '{}'", shared.id, packet.packet_type());
        shared.emit(LinkEvent::SendSucceeded { tag });
        return Ok(());
    };

    let total = match packet.payload_size.and_then(|size| u64::try_from(size).ok()) {
        Some(size) => size,
        None => match &payload {
            Payload::Bytes(data) => data.len() as u64,
            Payload::File(path) => tokio::fs::metadata(path)
                .await
                .map_err(|e| ProtocolError::other(format!("cannot read payload {:?}: {}", path, e)))?
                .len(),
        },
    };

    let upload = PayloadUpload::bind(&shared.settings).await?;
    packet.set_payload_port(upload.port());
    packet.payload_size = Some(total as i64);
    write_packet(writer, &packet).await?;
    debug!(
        "{} sent '{}' with a {} byte payload on port {}",
        shared.id,
        packet.packet_type(),
        total,
        upload.port()
    );

    let packet_id = packet.id;
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let progress_shared = Arc::clone(&shared);
        let progress = move |transferred| {
            progress_shared.emit(LinkEvent::PayloadProgress {
                tag: Some(tag),
                packet_id,
                transferred,
                total: Some(total),
            });
        };

        let result = tokio::select! {
            result = upload.serve(payload, total, &shared.peer_fingerprint, &shared.settings, progress) => result,
            _ = shared.shutdown.cancelled() => Err(ProtocolError::LinkClosed),
        };

        match result {
            Ok(_) => shared.emit(LinkEvent::SendSucceeded { tag }),
            Err(e) => {
                warn!("{} payload for packet {} failed: {}", shared.id, packet_id, e);
                shared.emit(LinkEvent::PayloadFailed {
                    tag: Some(tag),
                    packet_id,
                    error: e.to_string(),
                });
                shared.emit(LinkEvent::SendFailed {
                    tag,
                    error: e.to_string(),
                });
            }
        }
    });

    Ok(())
}

async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = packet.to_bytes()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Fetch the payload of `packet`, then deliver the packet with the file
async fn receive_payload(mut packet: Packet, shared: Arc<Shared>) {
    let packet_id = packet.id;
    let Some(port) = packet.payload_port() else {
        return;
    };
    let total = packet.payload_size.and_then(|size| u64::try_from(size).ok());
    let address = SocketAddr::new(shared.remote_addr.ip(), port);
    let file_name = payload::payload_file_name(packet_id, packet.get_str("filename"));

    let progress_shared = Arc::clone(&shared);
    let progress = move |transferred| {
        progress_shared.emit(LinkEvent::PayloadProgress {
            tag: None,
            packet_id,
            transferred,
            total,
        });
    };

    let result = tokio::select! {
        result = payload::download(
            address,
            total,
            &file_name,
            &shared.peer_fingerprint,
            &shared.settings,
            progress,
        ) => result,
        _ = shared.shutdown.cancelled() => Err(ProtocolError::LinkClosed),
    };

    match result {
        Ok(path) => {
            packet.set_payload(Payload::File(path));
            shared.emit(LinkEvent::PacketReceived(packet));
        }
        Err(e) => {
            warn!("{} payload of packet {} failed: {}", shared.id, packet_id, e);
            shared.emit(LinkEvent::PayloadFailed {
                tag: None,
                packet_id,
                error: e.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CertificateInfo, CertificateService, KeyAlgorithm, TlsConfig};
    use crate::network::lan::handshake;
    use crate::protocol::DeviceType;
    use bytes::Bytes;
    use serde_json::json;
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    struct Pair {
        alpha: Arc<LanLink>,
        alpha_events: LinkEventReceiver,
        beta: Arc<LanLink>,
        beta_events: LinkEventReceiver,
        _dir: TempDir,
    }

    /// Both ends of a finished handshake, before any link task runs
    struct Handshaken {
        alpha: Established,
        alpha_settings: Arc<PayloadSettings>,
        beta: Established,
        beta_settings: Arc<PayloadSettings>,
        dir: TempDir,
    }

    async fn handshaken_pair() -> Handshaken {
        let dir = TempDir::new().unwrap();
        let mut sides = Vec::new();
        for id in ["alpha", "beta"] {
            let cert = CertificateInfo::generate_with(id, KeyAlgorithm::EcdsaP256).unwrap();
            let tls = TlsConfig::new(&cert).unwrap();
            let settings = Arc::new(PayloadSettings {
                tls: tls.clone(),
                bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port_range: (0, 0),
                accept_timeout: Duration::from_secs(5),
                payload_dir: dir.path().join(id),
            });
            let identity = DeviceIdentity::new(id, id, DeviceType::Desktop);
            sides.push((identity, tls, CertificateService::in_memory(cert), settings));
        }
        let (beta, alpha) = (sides.pop().unwrap(), sides.pop().unwrap());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = async {
            let (tcp, remote) = listener.accept().await.unwrap();
            handshake::accept(tcp, remote, &beta.0, &beta.1, &beta.2, Duration::from_secs(5))
                .await
                .unwrap()
        };
        let connect = async {
            handshake::connect(addr, &beta.0, &alpha.0, &alpha.1, &alpha.2, Duration::from_secs(5))
                .await
                .unwrap()
        };
        let (at_beta, at_alpha) = tokio::join!(accept, connect);
        Handshaken {
            alpha: at_alpha,
            alpha_settings: alpha.3,
            beta: at_beta,
            beta_settings: beta.3,
            dir,
        }
    }

    async fn linked_pair() -> Pair {
        let sides = handshaken_pair().await;
        let (alpha_link, alpha_events) = LanLink::spawn(sides.alpha, sides.alpha_settings);
        let (beta_link, beta_events) = LanLink::spawn(sides.beta, sides.beta_settings);
        Pair {
            alpha: alpha_link,
            alpha_events,
            beta: beta_link,
            beta_events,
            _dir: sides.dir,
        }
    }

    async fn next_event(events: &mut LinkEventReceiver) -> LinkEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for link event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_packets_flow_both_ways() {
        let mut pair = linked_pair().await;
        assert_eq!(pair.alpha.device_id(), "beta");
        assert_eq!(pair.beta.device_id(), "alpha");
        assert_eq!(pair.alpha.direction(), LinkDirection::Outbound);
        assert_eq!(pair.beta.direction(), LinkDirection::Inbound);

        pair.alpha
            .send_packet(Packet::new("kdeconnect.ping", json!({"message": "hi"})), 1)
            .unwrap();
        assert!(matches!(
            next_event(&mut pair.alpha_events).await,
            LinkEvent::SendSucceeded { tag: 1 }
        ));
        match next_event(&mut pair.beta_events).await {
            LinkEvent::PacketReceived(packet) => {
                assert!(packet.is_type("kdeconnect.ping"));
                assert_eq!(packet.get_str("message"), Some("hi"));
            }
            other => panic!("unexpected event {:?}", other),
        }

        pair.beta
            .send_packet(Packet::new("kdeconnect.custom", json!({"n": 2})), 2)
            .unwrap();
        match next_event(&mut pair.alpha_events).await {
            LinkEvent::PacketReceived(packet) => assert_eq!(packet.get_i64("n"), Some(2)),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_payload_arrives_as_file() {
        let mut pair = linked_pair().await;
        let data = Bytes::from(vec![7u8; 150 * 1024]);

        let packet = Packet::new("kdeconnect.share.request", json!({"filename": "blob.bin"}))
            .with_payload_bytes(data.clone());
        pair.alpha.send_packet(packet, 9).unwrap();

        let received = loop {
            match next_event(&mut pair.beta_events).await {
                LinkEvent::PacketReceived(packet) => break packet,
                LinkEvent::PayloadProgress { tag, .. } => assert_eq!(tag, None),
                other => panic!("unexpected event {:?}", other),
            }
        };
        let Some(Payload::File(path)) = received.payload() else {
            panic!("payload missing");
        };
        assert!(path.ends_with(format!("{}_blob.bin", received.id)));
        assert_eq!(tokio::fs::read(path).await.unwrap(), data.to_vec());

        loop {
            match next_event(&mut pair.alpha_events).await {
                LinkEvent::SendSucceeded { tag } => {
                    assert_eq!(tag, 9);
                    break;
                }
                LinkEvent::PayloadProgress { tag, .. } => assert_eq!(tag, Some(9)),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_disconnect_destroys_exactly_once() {
        let mut pair = linked_pair().await;

        pair.alpha.disconnect();
        pair.alpha.disconnect();
        assert!(!pair.alpha.is_open());
        assert!(matches!(
            pair.alpha.send_packet(Packet::new("kdeconnect.ping", json!({})), 3),
            Err(ProtocolError::LinkClosed)
        ));

        // The socket error seen after the local close must not add a second event
        pair.beta.disconnect();

        match next_event(&mut pair.alpha_events).await {
            LinkEvent::Destroyed { reason } => assert_eq!(reason, None),
            other => panic!("unexpected event {:?}", other),
        }
        let extra = tokio::time::timeout(Duration::from_millis(300), pair.alpha_events.recv()).await;
        assert!(extra.is_err(), "unexpected second event: {:?}", extra);
    }

    #[tokio::test]
    async fn test_remote_close_is_reported() {
        let mut pair = linked_pair().await;
        pair.alpha.disconnect();

        match next_event(&mut pair.beta_events).await {
            LinkEvent::Destroyed { reason } => assert!(reason.is_some()),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(!pair.beta.is_open());
    }

    #[tokio::test]
    async fn test_non_utf8_frame_is_a_violation() {
        let sides = handshaken_pair().await;
        let (alpha, mut alpha_events) = LanLink::spawn(sides.alpha, sides.alpha_settings);
        let mut raw = sides.beta.stream;

        raw.write_all(b"{\"id\":1,\"type\":\"\xff\xfe\"}\n").await.unwrap();
        raw.flush().await.unwrap();

        match next_event(&mut alpha_events).await {
            LinkEvent::Destroyed { reason } => {
                let reason = reason.expect("violation should carry a reason");
                assert!(reason.contains("Protocol violation"), "reason was {}", reason);
                assert!(reason.contains("not UTF-8"), "reason was {}", reason);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(!alpha.is_open());
        drop(sides.dir);
    }
}
