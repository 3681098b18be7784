//! Local identity certificate
//!
//! Every device owns one self-signed certificate whose Common Name is its
//! device id. The certificate is generated once, stored as PEM next to its
//! private key and reloaded on every start, so the device id and the
//! fingerprint peers pinned stay stable across restarts.
//!
//! ## Certificate layout
//!
//! - **Organization (O)**: "KDE"
//! - **Organizational Unit (OU)**: "Kde connect"
//! - **Common Name (CN)**: device id
//! - **Validity**: 10 years
//! - **Key**: RSA 2048 (default) or ECDSA P-256

use crate::error::{ProtocolError, Result};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rsa::{pkcs8::EncodePrivateKey, RsaPrivateKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};
use x509_parser::prelude::*;

/// Certificate validity period (10 years)
const CERT_VALIDITY_YEARS: u64 = 10;

/// Organization name in certificate
const CERT_ORG: &str = "KDE";

/// Organizational unit in certificate
const CERT_ORG_UNIT: &str = "Kde connect";

/// File name of the PEM certificate inside the data directory
pub const CERTIFICATE_FILE: &str = "certificate.pem";

/// File name of the PEM private key inside the data directory
pub const PRIVATE_KEY_FILE: &str = "privateKey.pem";

/// Key type of a newly generated identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    /// RSA 2048 with SHA-256, what every other implementation expects
    #[default]
    #[serde(rename = "rsa2048")]
    Rsa2048,
    /// ECDSA P-256 with SHA-256, much faster to generate
    #[serde(rename = "ecdsa-p256")]
    EcdsaP256,
}

/// Device certificate information
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    /// Device id, also the certificate Common Name
    pub device_id: String,

    /// DER-encoded certificate
    pub certificate: Vec<u8>,

    /// DER-encoded private key (PKCS#8)
    pub private_key: Vec<u8>,

    /// SHA256 fingerprint of the certificate
    pub fingerprint: String,
}

impl CertificateInfo {
    /// Generate a new self-signed RSA 2048-bit certificate for a device
    pub fn generate(device_id: impl Into<String>) -> Result<Self> {
        Self::generate_with(device_id, KeyAlgorithm::Rsa2048)
    }

    /// Generate a new self-signed certificate with the given key type
    pub fn generate_with(device_id: impl Into<String>, algorithm: KeyAlgorithm) -> Result<Self> {
        let device_id = device_id.into();

        info!(
            "Generating {:?} certificate for device: {}",
            algorithm, device_id
        );

        let mut params = CertificateParams::new(vec![device_id.clone()]);

        match algorithm {
            KeyAlgorithm::Rsa2048 => {
                // rcgen cannot generate RSA keys itself
                let mut rng = rand::thread_rng();
                let private_key = RsaPrivateKey::new(&mut rng, 2048).map_err(|e| {
                    ProtocolError::certificate(format!("Failed to generate RSA key: {}", e))
                })?;
                let private_key_der = private_key.to_pkcs8_der().map_err(|e| {
                    ProtocolError::certificate(format!("Failed to encode private key: {}", e))
                })?;
                let key_pair = KeyPair::from_der(private_key_der.as_bytes()).map_err(|e| {
                    ProtocolError::certificate(format!("Failed to import key pair: {}", e))
                })?;
                params.alg = &rcgen::PKCS_RSA_SHA256;
                params.key_pair = Some(key_pair);
            }
            KeyAlgorithm::EcdsaP256 => {
                params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;
            }
        }

        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, CERT_ORG);
        dn.push(DnType::OrganizationalUnitName, CERT_ORG_UNIT);
        dn.push(DnType::CommonName, device_id.clone());
        params.distinguished_name = dn;

        let validity = Duration::from_secs(CERT_VALIDITY_YEARS * 365 * 24 * 60 * 60);
        params.not_before = ::time::OffsetDateTime::now_utc() - Duration::from_secs(24 * 60 * 60);
        params.not_after = params.not_before + validity;
        params.is_ca = rcgen::IsCa::NoCa;
        params.key_usages = vec![
            rcgen::KeyUsagePurpose::DigitalSignature,
            rcgen::KeyUsagePurpose::KeyEncipherment,
            rcgen::KeyUsagePurpose::KeyAgreement,
        ];

        let cert = rcgen::Certificate::from_params(params)?;
        let certificate = cert.serialize_der()?;
        let private_key = cert.serialize_private_key_der();
        let fingerprint = Self::calculate_fingerprint(&certificate);

        info!(
            "Generated certificate for device {} with fingerprint: {}",
            device_id, fingerprint
        );

        Ok(Self {
            device_id,
            certificate,
            private_key,
            fingerprint,
        })
    }

    /// Load the identity stored in `dir`, generating one on first use
    ///
    /// A fresh identity gets a random device id.
    pub fn load_or_generate(dir: impl AsRef<Path>, algorithm: KeyAlgorithm) -> Result<Self> {
        let dir = dir.as_ref();
        let cert_path = dir.join(CERTIFICATE_FILE);
        let key_path = dir.join(PRIVATE_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            let info = Self::load_from_files(&cert_path, &key_path)?;
            info.validate()?;
            return Ok(info);
        }

        let device_id = uuid::Uuid::new_v4().simple().to_string();
        let info = Self::generate_with(device_id, algorithm)?;
        info.save_to_files(&cert_path, &key_path)?;
        Ok(info)
    }

    /// Calculate SHA256 fingerprint of a certificate
    ///
    /// Returns fingerprint in format: XX:XX:XX:...:XX (hex bytes separated by colons)
    pub fn calculate_fingerprint(cert_der: &[u8]) -> String {
        Sha256::digest(cert_der)
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<String>>()
            .join(":")
    }

    /// Save certificate and private key to PEM files
    pub fn save_to_files(
        &self,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<()> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        for parent in [cert_path.parent(), key_path.parent()].into_iter().flatten() {
            fs::create_dir_all(parent)?;
        }

        let cert_pem = ::pem::encode(&::pem::Pem::new("CERTIFICATE", self.certificate.clone()));
        let key_pem = ::pem::encode(&::pem::Pem::new("PRIVATE KEY", self.private_key.clone()));

        fs::write(cert_path, cert_pem.as_bytes())?;
        fs::write(key_path, key_pem.as_bytes())?;

        info!(
            "Saved certificate to {:?} and private key to {:?}",
            cert_path, key_path
        );

        Ok(())
    }

    /// Load certificate and private key from PEM files
    pub fn load_from_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        debug!("Loading certificate from {:?}", cert_path);

        let cert_pem = ::pem::parse(fs::read(cert_path)?).map_err(|e| {
            ProtocolError::certificate(format!("Failed to parse certificate PEM: {}", e))
        })?;
        if cert_pem.tag() != "CERTIFICATE" {
            return Err(ProtocolError::certificate(format!(
                "Expected CERTIFICATE tag, got {}",
                cert_pem.tag()
            )));
        }

        let key_pem = ::pem::parse(fs::read(key_path)?).map_err(|e| {
            ProtocolError::certificate(format!("Failed to parse private key PEM: {}", e))
        })?;
        if key_pem.tag() != "PRIVATE KEY" {
            return Err(ProtocolError::certificate(format!(
                "Expected PRIVATE KEY tag, got {}",
                key_pem.tag()
            )));
        }

        let info = Self::from_der(cert_pem.contents().to_vec(), key_pem.contents().to_vec())?;

        info!(
            "Loaded certificate for device {} with fingerprint: {}",
            info.device_id, info.fingerprint
        );

        Ok(info)
    }

    /// Load certificate and private key from DER bytes
    pub fn from_der(cert_der: Vec<u8>, key_der: Vec<u8>) -> Result<Self> {
        let device_id = common_name(&cert_der)?;
        let fingerprint = Self::calculate_fingerprint(&cert_der);

        Ok(Self {
            device_id,
            certificate: cert_der,
            private_key: key_der,
            fingerprint,
        })
    }

    /// DER-encoded SubjectPublicKeyInfo of this certificate
    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        public_key_der(&self.certificate)
    }

    /// Validate certificate format and contents
    ///
    /// Checks:
    /// - Certificate can be parsed
    /// - Common Name matches the device id
    /// - Certificate is inside its validity period
    /// - Key is RSA or EC
    pub fn validate(&self) -> Result<()> {
        let (_, cert) = X509Certificate::from_der(&self.certificate).map_err(|e| {
            ProtocolError::certificate(format!("Failed to parse certificate: {}", e))
        })?;

        if common_name(&self.certificate)? != self.device_id {
            return Err(ProtocolError::certificate(
                "Common Name does not match device id",
            ));
        }

        let now = ::time::OffsetDateTime::now_utc();
        if now < cert.validity().not_before.to_datetime() {
            return Err(ProtocolError::certificate("Certificate not yet valid"));
        }
        if now > cert.validity().not_after.to_datetime() {
            return Err(ProtocolError::certificate("Certificate has expired"));
        }

        let algo = &cert.public_key().algorithm.algorithm;
        if algo != &x509_parser::oid_registry::OID_PKCS1_RSAENCRYPTION
            && algo != &x509_parser::oid_registry::OID_KEY_TYPE_EC_PUBLIC_KEY
        {
            return Err(ProtocolError::certificate(format!(
                "Unsupported key algorithm OID: {:?}",
                algo
            )));
        }

        Ok(())
    }
}

/// Common Name of a DER certificate
pub fn common_name(cert_der: &[u8]) -> Result<String> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| ProtocolError::certificate(format!("Failed to parse certificate: {}", e)))?;

    for rdn in cert.subject().iter() {
        for attr in rdn.iter() {
            if attr.attr_type() == &x509_parser::oid_registry::OID_X509_COMMON_NAME {
                let cn = attr.as_str().map_err(|e| {
                    ProtocolError::certificate(format!("Failed to extract CN: {}", e))
                })?;
                return Ok(cn.to_string());
            }
        }
    }

    Err(ProtocolError::certificate(
        "Certificate does not contain Common Name",
    ))
}

/// DER-encoded SubjectPublicKeyInfo of a DER certificate
pub fn public_key_der(cert_der: &[u8]) -> Result<Vec<u8>> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| ProtocolError::certificate(format!("Failed to parse certificate: {}", e)))?;
    Ok(cert.public_key().raw.to_vec())
}
