//! Certificate service
//!
//! Owns the local identity certificate and the trust-record store, and
//! answers the one question every other layer asks: may traffic from this
//! device id, arriving over a session with this certificate, be trusted?
//!
//! Transport-level acceptance and trust are separate. Any peer can complete
//! a TLS handshake; only a peer whose fingerprint equals its stored trust
//! record has its application packets delivered.

use crate::crypto::certificate::{self, CertificateInfo, KeyAlgorithm};
use crate::crypto::trust::{FileTrustStore, MemoryTrustStore, TrustRecord, TrustStore};
use crate::error::{ProtocolError, Result};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::{info, warn};

/// File name of the trust store inside the data directory
pub const TRUST_STORE_FILE: &str = "trusted_devices.json";

/// Number of hex characters shown to users when comparing keys
const VERIFICATION_KEY_LEN: usize = 8;

/// Local identity plus trust records
pub struct CertificateService {
    identity: CertificateInfo,
    trust: Box<dyn TrustStore>,
}

impl std::fmt::Debug for CertificateService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateService")
            .field("device_id", &self.identity.device_id)
            .field("fingerprint", &self.identity.fingerprint)
            .finish_non_exhaustive()
    }
}

impl CertificateService {
    /// Build from an identity and any trust store
    pub fn new(identity: CertificateInfo, trust: impl TrustStore + 'static) -> Self {
        Self {
            identity,
            trust: Box::new(trust),
        }
    }

    /// Identity with a volatile trust store
    pub fn in_memory(identity: CertificateInfo) -> Self {
        Self::new(identity, MemoryTrustStore::new())
    }

    /// Load or create the identity and trust store kept in `data_dir`
    pub fn open(data_dir: impl AsRef<Path>, algorithm: KeyAlgorithm) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let identity = CertificateInfo::load_or_generate(data_dir, algorithm)?;
        let trust = FileTrustStore::open(data_dir.join(TRUST_STORE_FILE))?;
        info!(
            "Certificate service ready for device {} ({})",
            identity.device_id, identity.fingerprint
        );
        Ok(Self::new(identity, trust))
    }

    pub fn identity(&self) -> &CertificateInfo {
        &self.identity
    }

    pub fn device_id(&self) -> &str {
        &self.identity.device_id
    }

    pub fn local_fingerprint(&self) -> &str {
        &self.identity.fingerprint
    }

    /// Fingerprint pinned for a device, if it is trusted
    pub fn trusted_fingerprint(&self, device_id: &str) -> Result<Option<String>> {
        Ok(self
            .trust
            .get(device_id)?
            .filter(|record| record.trusted)
            .map(|record| record.fingerprint))
    }

    pub fn is_trusted(&self, device_id: &str) -> bool {
        matches!(self.trusted_fingerprint(device_id), Ok(Some(_)))
    }

    /// Compare a presented fingerprint with the trust record
    ///
    /// `Ok(true)` when trusted and equal, `Ok(false)` when the device is not
    /// trusted at all, `TrustViolation` when it is trusted with another
    /// certificate.
    pub fn check_trust(&self, device_id: &str, fingerprint: &str) -> Result<bool> {
        match self.trusted_fingerprint(device_id)? {
            None => Ok(false),
            Some(expected) if expected == fingerprint => Ok(true),
            Some(expected) => {
                warn!(
                    target: "security_audit",
                    "Device {} presented fingerprint {} but {} is trusted",
                    device_id, fingerprint, expected
                );
                Err(ProtocolError::TrustViolation {
                    device_id: device_id.to_string(),
                    expected,
                    presented: fingerprint.to_string(),
                })
            }
        }
    }

    /// Pin a fingerprint; called only when pairing is accepted
    pub fn record_trust(&self, device_id: &str, fingerprint: &str) -> Result<()> {
        info!(
            target: "security_audit",
            "Trusting device {} with fingerprint {}",
            device_id, fingerprint
        );
        self.trust.put(TrustRecord::trusted(device_id, fingerprint))
    }

    /// Forget a device; called on unpair
    pub fn clear_trust(&self, device_id: &str) -> Result<()> {
        info!(target: "security_audit", "Clearing trust for device {}", device_id);
        self.trust.remove(device_id)
    }

    /// Check a peer certificate against the device id it claims
    ///
    /// Returns the certificate fingerprint.
    pub fn verify_peer_certificate(&self, claimed_id: &str, cert_der: &[u8]) -> Result<String> {
        let fingerprint = CertificateInfo::calculate_fingerprint(cert_der);
        let common_name = certificate::common_name(cert_der)?;
        if common_name != claimed_id {
            warn!(
                target: "security_audit",
                "Certificate CN {} does not match claimed device id {}",
                common_name, claimed_id
            );
            return Err(ProtocolError::TrustViolation {
                device_id: claimed_id.to_string(),
                expected: claimed_id.to_string(),
                presented: common_name,
            });
        }
        Ok(fingerprint)
    }

    /// Short key both users can compare before accepting a pair request
    ///
    /// SHA-256 over both public keys, the lexicographically larger one
    /// first, followed by the decimal pairing timestamp when one is given.
    /// Both sides compute the same value.
    pub fn verification_key(&self, peer_cert_der: &[u8], timestamp: Option<i64>) -> Result<String> {
        let local = self.identity.public_key_der()?;
        let remote = certificate::public_key_der(peer_cert_der)?;

        let mut hasher = Sha256::new();
        if remote < local {
            hasher.update(&local);
            hasher.update(&remote);
        } else {
            hasher.update(&remote);
            hasher.update(&local);
        }
        if let Some(ts) = timestamp {
            hasher.update(ts.to_string().as_bytes());
        }

        let hex: String = hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect();
        Ok(hex[..VERIFICATION_KEY_LEN].to_string())
    }
}
