//! Payload side channel
//!
//! Bulk data never travels on the control link. The sender binds a
//! short-lived listener, announces its port in `payloadTransferInfo` and
//! waits; the receiver connects to the same host on that port. The sender
//! is the TLS server, the receiver the TLS client, and each side checks
//! that the certificate on the side channel is the one of the control link.

use crate::config::CoreConfig;
use crate::crypto::tls::{peer_certificate, server_name_for};
use crate::crypto::{CertificateInfo, TlsConfig};
use crate::error::{ProtocolError, Result};
use crate::protocol::Payload;
use std::io::Cursor;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Bytes moved per read/write round and per progress report
const CHUNK_SIZE: usize = 64 * 1024;

/// Everything a link needs to move payloads
#[derive(Debug, Clone)]
pub struct PayloadSettings {
    pub tls: TlsConfig,
    /// Address payload listeners bind to
    pub bind_address: IpAddr,
    /// Inclusive port range for payload listeners
    pub port_range: (u16, u16),
    /// How long a sender waits for the receiver to connect
    pub accept_timeout: Duration,
    /// Directory incoming payloads are written to
    pub payload_dir: PathBuf,
}

impl PayloadSettings {
    pub fn from_config(tls: TlsConfig, config: &CoreConfig) -> Self {
        Self {
            tls,
            bind_address: config.network.bind_address,
            port_range: config.network.payload_port_range,
            accept_timeout: config.network.payload_accept_timeout(),
            payload_dir: config.storage.payload_dir(),
        }
    }
}

/// Listener serving one outgoing payload
#[derive(Debug)]
pub struct PayloadUpload {
    listener: TcpListener,
    port: u16,
}

impl PayloadUpload {
    /// Bind a listener on the first free payload port
    pub async fn bind(settings: &PayloadSettings) -> Result<Self> {
        let listener = super::bind_tcp_in_range(settings.bind_address, settings.port_range).await?;
        let port = listener.local_addr()?.port();
        Ok(Self { listener, port })
    }

    /// Port to announce in `payloadTransferInfo`
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the receiver and stream `total` bytes of `payload`
    ///
    /// `progress` is called with the running byte count after every chunk.
    pub async fn serve<F>(
        self,
        payload: Payload,
        total: u64,
        peer_fingerprint: &str,
        settings: &PayloadSettings,
        mut progress: F,
    ) -> Result<u64>
    where
        F: FnMut(u64) + Send,
    {
        let (tcp, remote) = tokio::time::timeout(settings.accept_timeout, self.listener.accept())
            .await
            .map_err(|_| {
                ProtocolError::transport(format!(
                    "receiver did not connect to payload port {} in time",
                    self.port
                ))
            })??;
        debug!("Payload receiver connected from {}", remote);

        let mut tls = settings
            .tls
            .acceptor()
            .accept(tcp)
            .await
            .map_err(|e| ProtocolError::tls(format!("payload handshake failed: {}", e)))?;
        check_fingerprint(peer_certificate(tls.get_ref().1)?, peer_fingerprint)?;

        let mut source: Box<dyn AsyncRead + Unpin + Send> = match payload {
            Payload::Bytes(data) => Box::new(Cursor::new(data)),
            Payload::File(path) => Box::new(tokio::fs::File::open(&path).await?),
        };

        let sent = pump(&mut source, &mut tls, Some(total), &mut progress).await?;
        if sent < total {
            return Err(ProtocolError::transport(format!(
                "payload source ended after {} of {} bytes",
                sent, total
            )));
        }
        tls.shutdown().await?;

        info!("Sent payload of {} bytes to {}", sent, remote);
        Ok(sent)
    }
}

/// Fetch a payload announced on the control link
///
/// Writes it to `file_name` inside the payload directory and returns the
/// full path. A partially written file is removed on failure.
pub async fn download<F>(
    address: SocketAddr,
    total: Option<u64>,
    file_name: &str,
    peer_fingerprint: &str,
    settings: &PayloadSettings,
    mut progress: F,
) -> Result<PathBuf>
where
    F: FnMut(u64) + Send,
{
    tokio::fs::create_dir_all(&settings.payload_dir).await?;
    let path = settings.payload_dir.join(file_name);

    let result = async {
        let tcp = TcpStream::connect(address).await?;
        let mut tls = settings
            .tls
            .connector()
            .connect(server_name_for(address.ip()), tcp)
            .await
            .map_err(|e| ProtocolError::tls(format!("payload handshake failed: {}", e)))?;
        check_fingerprint(peer_certificate(tls.get_ref().1)?, peer_fingerprint)?;

        let mut file = tokio::fs::File::create(&path).await?;
        let received = pump(&mut tls, &mut file, total, &mut progress).await?;
        if let Some(total) = total {
            if received < total {
                return Err(ProtocolError::transport(format!(
                    "payload truncated after {} of {} bytes",
                    received, total
                )));
            }
        }
        file.sync_all().await?;
        Ok::<_, ProtocolError>(received)
    }
    .await;

    match result {
        Ok(received) => {
            info!("Received payload of {} bytes into {:?}", received, path);
            Ok(path)
        }
        Err(e) => {
            if let Err(remove_err) = tokio::fs::remove_file(&path).await {
                debug!("Could not remove partial payload {:?}: {}", path, remove_err);
            }
            Err(e)
        }
    }
}

/// Local file name for an incoming payload
///
/// Only the last component of a peer-supplied name is used, prefixed with
/// the packet id so concurrent transfers cannot collide.
pub fn payload_file_name(packet_id: i64, suggested: Option<&str>) -> String {
    let name = suggested
        .and_then(|name| Path::new(name).file_name())
        .and_then(|name| name.to_str())
        .filter(|name| !name.starts_with('.'))
        .unwrap_or("payload");
    format!("{}_{}", packet_id, name)
}

fn check_fingerprint(cert_der: Vec<u8>, expected: &str) -> Result<()> {
    let presented = CertificateInfo::calculate_fingerprint(&cert_der);
    if presented != expected {
        warn!(
            target: "security_audit",
            "Payload channel presented {} instead of link certificate {}",
            presented, expected
        );
        return Err(ProtocolError::TrustViolation {
            device_id: crate::crypto::certificate::common_name(&cert_der).unwrap_or_default(),
            expected: expected.to_string(),
            presented,
        });
    }
    Ok(())
}

async fn pump<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    limit: Option<u64>,
    progress: &mut F,
) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
    F: FnMut(u64),
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut transferred = 0u64;
    loop {
        let want = match limit {
            Some(limit) => limit.saturating_sub(transferred).min(CHUNK_SIZE as u64) as usize,
            None => CHUNK_SIZE,
        };
        if want == 0 {
            break;
        }
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        transferred += n as u64;
        progress(transferred);
    }
    writer.flush().await?;
    Ok(transferred)
}
