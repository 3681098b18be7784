//! TLS configuration
//!
//! Every link and payload channel is TLS with mutual certificates. No CA is
//! involved: any self-signed certificate is accepted during the handshake
//! (trust-on-first-use) and the fingerprint is judged afterwards by the
//! [`CertificateService`](crate::crypto::CertificateService). The handshake
//! signatures are still verified, so the peer has to hold the private key of
//! the certificate it presents.
//!
//! ## Inverted roles
//!
//! The protocol uses **inverted TLS roles** on the control link:
//! - The device that **initiates** the TCP connection acts as **TLS SERVER**
//! - The device that **accepts** the TCP connection acts as **TLS CLIENT**
//!
//! ## Who initiates
//!
//! Both peers see each other's broadcasts at about the same time. To end up
//! with a single connection, only the device with the lexicographically
//! **smaller** id connects; see [`should_initiate_connection`].

use crate::crypto::CertificateInfo;
use crate::error::{ProtocolError, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{ClientConfig, CommonState, DigitallySignedStruct, ServerConfig, SignatureScheme};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

/// Trust-on-first-use verifier for the TLS client side
///
/// Accepts any certificate; handshake signatures are checked against it.
#[derive(Debug)]
struct TofuServerVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for TofuServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Trust-on-first-use verifier for the TLS server side
///
/// Client certificates are mandatory.
#[derive(Debug)]
struct TofuClientVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ClientCertVerifier for TofuClientVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }

    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

/// Whether the local device opens the TCP connection to a peer
///
/// - `true` → we initiate TCP (and become TLS SERVER)
/// - `false` → we wait for the peer (and become TLS CLIENT)
pub fn should_initiate_connection(our_device_id: &str, peer_device_id: &str) -> bool {
    our_device_id < peer_device_id
}

/// Name passed to the TLS client
///
/// Peers have no DNS names and the verifier ignores it, so the peer IP is
/// used.
pub fn server_name_for(ip: IpAddr) -> ServerName<'static> {
    ServerName::from(ip)
}

/// DER certificate presented by the other end of a finished handshake
pub fn peer_certificate(state: &CommonState) -> Result<Vec<u8>> {
    state
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|cert| cert.as_ref().to_vec())
        .ok_or_else(|| ProtocolError::tls("peer presented no certificate"))
}

/// Client and server configurations built from the local identity
#[derive(Clone)]
pub struct TlsConfig {
    /// Used by the TCP acceptor (TLS client) and by payload receivers
    client_config: Arc<ClientConfig>,
    /// Used by the TCP initiator (TLS server) and by payload senders
    server_config: Arc<ServerConfig>,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig").finish_non_exhaustive()
    }
}

impl TlsConfig {
    /// Create TLS configuration from certificate
    pub fn new(cert_info: &CertificateInfo) -> Result<Self> {
        debug!("Creating TLS config for device {}", cert_info.device_id);

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let algorithms = provider.signature_verification_algorithms;

        let cert_der = CertificateDer::from(cert_info.certificate.clone());
        let key_der = PrivateKeyDer::try_from(cert_info.private_key.clone())
            .map_err(|e| ProtocolError::certificate(format!("Invalid private key: {}", e)))?;

        let client_config = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(TofuServerVerifier { algorithms }))
            .with_client_auth_cert(vec![cert_der.clone()], key_der.clone_key())
            .map_err(|e| {
                ProtocolError::certificate(format!("Failed to create client config: {}", e))
            })?;

        let server_config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(Arc::new(TofuClientVerifier { algorithms }))
            .with_single_cert(vec![cert_der], key_der)
            .map_err(|e| {
                ProtocolError::certificate(format!("Failed to create server config: {}", e))
            })?;

        Ok(Self {
            client_config: Arc::new(client_config),
            server_config: Arc::new(server_config),
        })
    }

    pub fn client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.client_config)
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.server_config)
    }

    /// Connector for the TLS client role
    pub fn connector(&self) -> tokio_rustls::TlsConnector {
        tokio_rustls::TlsConnector::from(self.client_config())
    }

    /// Acceptor for the TLS server role
    pub fn acceptor(&self) -> tokio_rustls::TlsAcceptor {
        tokio_rustls::TlsAcceptor::from(self.server_config())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyAlgorithm;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn test_should_initiate_connection() {
        assert!(should_initiate_connection("alpha", "beta"));
        assert!(!should_initiate_connection("beta", "alpha"));

        // Same device ID never initiates
        assert!(!should_initiate_connection("alpha", "alpha"));
    }

    #[test]
    fn test_tls_config_creation() {
        let rsa = CertificateInfo::generate("rsa_device").unwrap();
        assert!(TlsConfig::new(&rsa).is_ok());

        let ec = CertificateInfo::generate_with("ec_device", KeyAlgorithm::EcdsaP256).unwrap();
        assert!(TlsConfig::new(&ec).is_ok());
    }

    #[tokio::test]
    async fn test_inverted_handshake_exposes_both_certificates() {
        let initiator = CertificateInfo::generate_with("initiator", KeyAlgorithm::EcdsaP256).unwrap();
        let acceptor = CertificateInfo::generate_with("acceptor", KeyAlgorithm::EcdsaP256).unwrap();
        let initiator_tls = TlsConfig::new(&initiator).unwrap();
        let acceptor_tls = TlsConfig::new(&acceptor).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept_side = tokio::spawn(async move {
            let (tcp, peer) = listener.accept().await.unwrap();
            let mut tls = acceptor_tls
                .connector()
                .connect(server_name_for(peer.ip()), tcp)
                .await
                .unwrap();
            let seen = peer_certificate(tls.get_ref().1).unwrap();
            let mut buf = [0u8; 5];
            tls.read_exact(&mut buf).await.unwrap();
            (seen, buf)
        });

        let tcp = TcpStream::connect(addr).await.unwrap();
        let mut tls = initiator_tls.acceptor().accept(tcp).await.unwrap();
        let seen_by_initiator = peer_certificate(tls.get_ref().1).unwrap();
        tls.write_all(b"hello").await.unwrap();
        tls.flush().await.unwrap();

        let (seen_by_acceptor, buf) = accept_side.await.unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(seen_by_initiator, acceptor.certificate);
        assert_eq!(seen_by_acceptor, initiator.certificate);
    }
}
