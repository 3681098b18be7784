//! Cryptography module
//!
//! This module contains:
//! - `certificate`: local identity certificate generation and storage
//! - `trust`: trust records pinning peer fingerprints
//! - `service`: `CertificateService`, the trust decision point
//! - `tls`: rustls configuration with trust-on-first-use verifiers

pub mod certificate;
pub mod service;
pub mod tls;
pub mod trust;

pub use certificate::{CertificateInfo, KeyAlgorithm};
pub use service::CertificateService;
pub use tls::{should_initiate_connection, TlsConfig};
pub use trust::{FileTrustStore, MemoryTrustStore, TrustRecord, TrustStore};
