//! Link handshake
//!
//! Both directions run the same steps with swapped roles:
//!
//! 1. TCP connect / accept
//! 2. Initiator sends its identity packet in plain text
//! 3. TLS handshake, initiator as **TLS SERVER**, acceptor as **TLS CLIENT**
//! 4. Protocol 8+: both sides send their identity again inside TLS; the
//!    device id must not change
//! 5. Peer certificate Common Name must equal the announced device id
//!
//! Steps 1 to 4 are bounded by the connect timeout. Reads are done byte by
//! byte so nothing that follows the identity line is swallowed.

use crate::crypto::tls::{peer_certificate, server_name_for};
use crate::crypto::{CertificateService, TlsConfig};
use crate::error::{ProtocolError, Result};
use crate::network::link::LinkDirection;
use crate::protocol::{DeviceIdentity, Packet, MAX_IDENTITY_PACKET_SIZE};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsStream;
use tracing::{debug, info, warn};

/// Lowest protocol version that repeats the identity inside TLS
const IDENTITY_IN_TLS_VERSION: i32 = 8;

/// A finished handshake, ready to become a link
pub struct Established {
    pub stream: TlsStream<TcpStream>,
    /// Authoritative peer identity
    pub identity: DeviceIdentity,
    pub peer_certificate: Vec<u8>,
    pub peer_fingerprint: String,
    pub remote_addr: SocketAddr,
    pub direction: LinkDirection,
}

impl std::fmt::Debug for Established {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Established")
            .field("device_id", &self.identity.device_id)
            .field("remote_addr", &self.remote_addr)
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

/// Open a link to a discovered peer (we are TLS SERVER)
///
/// `peer` is the identity received over UDP; it is authoritative for
/// peers older than protocol 8.
pub async fn connect(
    addr: SocketAddr,
    peer: &DeviceIdentity,
    local: &DeviceIdentity,
    tls: &TlsConfig,
    certs: &CertificateService,
    timeout: Duration,
) -> Result<Established> {
    info!("Connecting to {} at {} (we are TLS SERVER)", peer.device_id, addr);

    let (stream, identity, cert_der) = tokio::time::timeout(timeout, async {
        let mut tcp = TcpStream::connect(addr).await?;
        debug!("TCP connection established to {}", addr);

        write_identity(&mut tcp, local).await?;

        let mut tls_stream = tls
            .acceptor()
            .accept(tcp)
            .await
            .map_err(|e| ProtocolError::tls(format!("handshake with {} failed: {}", addr, e)))?;
        let cert = peer_certificate(tls_stream.get_ref().1)?;

        let identity = if repeats_identity_in_tls(local, peer) {
            exchange_identities(&mut tls_stream, local, &peer.device_id).await?
        } else {
            peer.clone()
        };

        Ok::<_, ProtocolError>((TlsStream::Server(tls_stream), identity, cert))
    })
    .await
    .map_err(|_| ProtocolError::transport(format!("connecting to {} timed out", addr)))??;

    finish(
        stream,
        identity,
        cert_der,
        addr,
        LinkDirection::Outbound,
        certs,
    )
}

/// Complete a link on an accepted socket (we are TLS CLIENT)
pub async fn accept(
    mut tcp: TcpStream,
    remote_addr: SocketAddr,
    local: &DeviceIdentity,
    tls: &TlsConfig,
    certs: &CertificateService,
    timeout: Duration,
) -> Result<Established> {
    debug!("TCP connection accepted from {}", remote_addr);

    let (stream, identity, cert_der) = tokio::time::timeout(timeout, async {
        let line = read_line_limited(&mut tcp, MAX_IDENTITY_PACKET_SIZE).await?;
        let announced = DeviceIdentity::from_packet(&Packet::from_bytes(&line)?)?;
        if announced.device_id == local.device_id {
            return Err(ProtocolError::violation("peer announced our own device id"));
        }
        info!(
            "Received identity of {} ({}) from {}",
            announced.device_name, announced.device_id, remote_addr
        );

        let mut tls_stream = tls
            .connector()
            .connect(server_name_for(remote_addr.ip()), tcp)
            .await
            .map_err(|e| {
                ProtocolError::tls(format!("handshake with {} failed: {}", remote_addr, e))
            })?;
        let cert = peer_certificate(tls_stream.get_ref().1)?;

        let identity = if repeats_identity_in_tls(local, &announced) {
            exchange_identities(&mut tls_stream, local, &announced.device_id).await?
        } else {
            announced
        };

        Ok::<_, ProtocolError>((TlsStream::Client(tls_stream), identity, cert))
    })
    .await
    .map_err(|_| {
        ProtocolError::transport(format!("handshake with {} timed out", remote_addr))
    })??;

    finish(
        stream,
        identity,
        cert_der,
        remote_addr,
        LinkDirection::Inbound,
        certs,
    )
}

fn finish(
    stream: TlsStream<TcpStream>,
    identity: DeviceIdentity,
    peer_certificate: Vec<u8>,
    remote_addr: SocketAddr,
    direction: LinkDirection,
    certs: &CertificateService,
) -> Result<Established> {
    let peer_fingerprint = certs.verify_peer_certificate(&identity.device_id, &peer_certificate)?;
    info!(
        "TLS link with {} at {} established ({:?})",
        identity.device_id, remote_addr, direction
    );
    Ok(Established {
        stream,
        identity,
        peer_certificate,
        peer_fingerprint,
        remote_addr,
        direction,
    })
}

/// Whether both sides speak a version that repeats the identity inside TLS
///
/// Each side decides from the same pair of versions, so a mixed pair falls
/// back to the plain-text identity on both ends.
fn repeats_identity_in_tls(local: &DeviceIdentity, peer: &DeviceIdentity) -> bool {
    local.protocol_version.min(peer.protocol_version) >= IDENTITY_IN_TLS_VERSION
}

/// Send our identity, then read the peer's and check it is the same device
async fn exchange_identities<S>(
    stream: &mut S,
    local: &DeviceIdentity,
    expected_device_id: &str,
) -> Result<DeviceIdentity>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_identity(stream, local).await?;

    let line = read_line_limited(stream, MAX_IDENTITY_PACKET_SIZE).await?;
    let identity = DeviceIdentity::from_packet(&Packet::from_bytes(&line)?)?;
    if identity.device_id != expected_device_id {
        warn!(
            target: "security_audit",
            "Device id changed during handshake: {} became {}",
            expected_device_id, identity.device_id
        );
        return Err(ProtocolError::violation("device id changed during TLS handshake"));
    }
    debug!("Identity exchange inside TLS completed with {}", expected_device_id);
    Ok(identity)
}

async fn write_identity<W>(writer: &mut W, local: &DeviceIdentity) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = local.to_packet().to_bytes()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one newline-terminated line of at most `max` bytes
///
/// The newline is included in the result.
pub async fn read_line_limited<R>(reader: &mut R, max: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            return Err(ProtocolError::transport(
                "connection closed before a complete line",
            ));
        }
        line.push(byte[0]);
        if line.len() > max {
            return Err(ProtocolError::violation(format!(
                "line exceeds {} bytes",
                max
            )));
        }
        if byte[0] == b'\n' {
            return Ok(line);
        }
    }
}
