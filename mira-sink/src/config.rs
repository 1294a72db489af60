//! Configuration for the mirroring sink.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mira_core::{Features, MiraError, ReceiverConfig};
use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Listener settings.
    pub network: NetworkConfig,
    /// What the receiver reports about itself.
    pub device: DeviceConfig,
    /// Pairing handshake settings.
    pub pairing: PairingConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address every listener binds to.
    pub bind_address: String,
    /// TCP port for control connections.
    pub control_port: u16,
    /// UDP port for stream data; the control datagram port is the next one.
    pub data_port: u16,
    /// How many ports to try before giving up on a listener.
    pub port_attempts: u16,
    /// Bound on each bind attempt in milliseconds.
    pub start_timeout_ms: u64,
}

/// Device description.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Display name handed to the advertiser.
    pub name: String,
    pub model: String,
    pub source_version: String,
    /// Capability mask, either `0xLOW,0xHIGH` or a single integer.
    pub features: String,
    /// Directory holding the persisted identity.
    pub state_dir: PathBuf,
}

/// Pairing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    /// Seconds before an untouched pairing session is discarded.
    pub idle_timeout_secs: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            control_port: 7000,
            data_port: 7100,
            port_attempts: 10,
            start_timeout_ms: 2000,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "Mira".into(),
            model: "AppleTV3,2".into(),
            source_version: "220.68".into(),
            features: Features::RECEIVER.to_advertised(),
            state_dir: PathBuf::from(".mira"),
        }
    }
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 60,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl SinkConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// The default configuration as TOML text.
    pub fn default_toml() -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(&Self::default())
    }

    /// Where the identity store lives.
    pub fn identity_path(&self) -> PathBuf {
        self.device.state_dir.join("identity.json")
    }

    /// Where the presence records are published for the advertiser.
    pub fn advertisement_path(&self) -> PathBuf {
        self.device.state_dir.join("advertisement.json")
    }

    /// Convert into the receiver's runtime parameters.
    pub fn to_receiver_config(&self) -> Result<ReceiverConfig, MiraError> {
        let bind_address: IpAddr = self.network.bind_address.parse().map_err(|_| {
            MiraError::Other(format!("invalid bind address: {}", self.network.bind_address))
        })?;

        Ok(ReceiverConfig {
            bind_address,
            control_port: self.network.control_port,
            data_port: self.network.data_port,
            port_attempts: self.network.port_attempts.max(1),
            start_timeout: Duration::from_millis(self.network.start_timeout_ms.max(1)),
            name: self.device.name.clone(),
            model: self.device.model.clone(),
            source_version: self.device.source_version.clone(),
            features: Features::parse(&self.device.features)?,
            pairing_idle_timeout: Duration::from_secs(self.pairing.idle_timeout_secs),
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = SinkConfig::default_toml().unwrap();
        assert!(text.contains("control_port"));
        assert!(text.contains("[device]"));
        assert!(text.contains("0x5A7FFFF7,0x1E"));
    }

    #[test]
    fn roundtrip_config() {
        let text = SinkConfig::default_toml().unwrap();
        let parsed: SinkConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.network.control_port, 7000);
        assert_eq!(parsed.network.data_port, 7100);
        assert_eq!(parsed.pairing.idle_timeout_secs, 60);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let parsed: SinkConfig = toml::from_str("[network]\ncontrol_port = 7777\n").unwrap();
        assert_eq!(parsed.network.control_port, 7777);
        assert_eq!(parsed.network.data_port, 7100);
        assert_eq!(parsed.device.model, "AppleTV3,2");
    }

    #[test]
    fn load_falls_back_on_missing_or_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = SinkConfig::load(&dir.path().join("absent.toml"));
        assert_eq!(missing.network.control_port, 7000);

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "network = 5").unwrap();
        assert_eq!(SinkConfig::load(&bad).logging.level, "info");
    }

    #[test]
    fn to_receiver_config_converts_units() {
        let mut cfg = SinkConfig::default();
        cfg.network.start_timeout_ms = 1500;
        cfg.network.port_attempts = 0;
        let rc = cfg.to_receiver_config().unwrap();
        assert_eq!(rc.start_timeout, Duration::from_millis(1500));
        assert_eq!(rc.port_attempts, 1);
        assert_eq!(rc.features, Features::RECEIVER);
        assert!(rc.bind_address.is_unspecified());
    }

    #[test]
    fn to_receiver_config_rejects_bad_values() {
        let mut cfg = SinkConfig::default();
        cfg.network.bind_address = "not-an-ip".into();
        assert!(cfg.to_receiver_config().is_err());

        let mut cfg = SinkConfig::default();
        cfg.device.features = "0xNOPE".into();
        assert!(cfg.to_receiver_config().is_err());
    }
}
