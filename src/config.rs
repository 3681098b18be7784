//! TOML configuration
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working configuration that speaks the standard ports:
//!
//! ```toml
//! [device]
//! name = "Workstation"
//! device_type = "desktop"
//!
//! [network]
//! discovery_port = 1716
//! tcp_port_range = [1716, 1764]
//!
//! [pairing]
//! timeout_secs = 30
//! ```

use crate::crypto::KeyAlgorithm;
use crate::error::{ProtocolError, Result};
use crate::protocol::DeviceType;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// UDP discovery port
pub const DEFAULT_DISCOVERY_PORT: u16 = 1716;

/// First TCP port tried for the link listener
pub const DEFAULT_TCP_PORT_MIN: u16 = 1716;

/// Last TCP port tried for the link listener
pub const DEFAULT_TCP_PORT_MAX: u16 = 1764;

/// First TCP port tried for payload transfers
pub const DEFAULT_PAYLOAD_PORT_MIN: u16 = 1739;

/// Last TCP port tried for payload transfers
pub const DEFAULT_PAYLOAD_PORT_MAX: u16 = 1764;

/// Seconds a local pair request waits for an answer
pub const DEFAULT_PAIRING_TIMEOUT_SECS: u64 = 30;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub device: DeviceConfig,
    pub network: NetworkConfig,
    pub pairing: PairingConfig,
    pub storage: StorageConfig,
}

/// Local device settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Display name announced to peers
    pub name: String,
    pub device_type: DeviceType,
    /// Key type used when the identity certificate is first generated
    pub key_algorithm: KeyAlgorithm,
    pub protocol_version: i32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "Unnamed device".to_string(),
            device_type: DeviceType::Desktop,
            key_algorithm: KeyAlgorithm::default(),
            protocol_version: crate::PROTOCOL_VERSION,
        }
    }
}

/// Socket settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the UDP and TCP sockets bind to
    pub bind_address: IpAddr,
    /// Destination of identity broadcasts
    pub broadcast_address: IpAddr,
    pub discovery_port: u16,
    /// Inclusive range searched for the link listener
    pub tcp_port_range: (u16, u16),
    /// Inclusive range searched for payload listeners
    pub payload_port_range: (u16, u16),
    /// Upper bound for TCP connect plus TLS handshake of a new link
    pub connect_timeout_secs: u64,
    /// How long a payload sender waits for the receiver to connect
    pub payload_accept_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            broadcast_address: IpAddr::V4(Ipv4Addr::BROADCAST),
            discovery_port: DEFAULT_DISCOVERY_PORT,
            tcp_port_range: (DEFAULT_TCP_PORT_MIN, DEFAULT_TCP_PORT_MAX),
            payload_port_range: (DEFAULT_PAYLOAD_PORT_MIN, DEFAULT_PAYLOAD_PORT_MAX),
            connect_timeout_secs: 10,
            payload_accept_timeout_secs: 10,
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn payload_accept_timeout(&self) -> Duration {
        Duration::from_secs(self.payload_accept_timeout_secs)
    }
}

/// Pairing settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    pub timeout_secs: u64,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_PAIRING_TIMEOUT_SECS,
        }
    }
}

impl PairingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Where identity, trust records and received payloads live
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for the identity certificate and trust records
    pub data_dir: Option<PathBuf>,
    /// Directory received payloads are written to
    pub payload_dir: Option<PathBuf>,
}

impl StorageConfig {
    /// Data directory, falling back to `./connect-link`
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("connect-link"))
    }

    /// Payload directory, falling back to the system temp directory
    pub fn payload_dir(&self) -> PathBuf {
        self.payload_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("connect-link-payloads"))
    }
}

impl CoreConfig {
    /// Parse configuration text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file; a missing file yields the defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        debug!("Loading config from {:?}", path);
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Write to a file, creating parent directories
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Reject settings the core cannot run with
    pub fn validate(&self) -> Result<()> {
        for (name, (start, end)) in [
            ("tcp_port_range", self.network.tcp_port_range),
            ("payload_port_range", self.network.payload_port_range),
        ] {
            if start > end {
                return Err(ProtocolError::Config(format!(
                    "{} is inverted: {}-{}",
                    name, start, end
                )));
            }
        }
        if self.pairing.timeout_secs == 0 {
            return Err(ProtocolError::Config(
                "pairing.timeout_secs must be positive".to_string(),
            ));
        }
        if self.device.name.trim().is_empty() {
            return Err(ProtocolError::Config("device.name is empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_use_standard_ports() {
        let config = CoreConfig::default();
        assert_eq!(config.network.discovery_port, 1716);
        assert_eq!(config.network.tcp_port_range, (1716, 1764));
        assert_eq!(config.network.payload_port_range, (1739, 1764));
        assert_eq!(config.pairing.timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = CoreConfig::from_toml_str(
            r#"
            [device]
            name = "Laptop"
            device_type = "laptop"
            key_algorithm = "ecdsa-p256"

            [pairing]
            timeout_secs = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.device.name, "Laptop");
        assert_eq!(config.device.device_type, DeviceType::Laptop);
        assert_eq!(config.device.key_algorithm, KeyAlgorithm::EcdsaP256);
        assert_eq!(config.pairing.timeout_secs, 5);
        assert_eq!(config.network.discovery_port, 1716);
    }

    #[test]
    fn test_inverted_range_rejected() {
        let result = CoreConfig::from_toml_str(
            r#"
            [network]
            tcp_port_range = [1800, 1700]
            "#,
        );
        assert!(matches!(result, Err(ProtocolError::Config(_))));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let result = CoreConfig::from_toml_str("[pairing]\ntimeout_secs = 0\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = CoreConfig::default();
        config.device.name = "Phone".to_string();
        config.network.discovery_port = 17160;
        config.save(&path).unwrap();

        let loaded = CoreConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let loaded = CoreConfig::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(loaded, CoreConfig::default());
    }
}
