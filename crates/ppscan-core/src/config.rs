//! Driver configuration file.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::model::ScannerModel;
use crate::port::PortSpec;
use crate::probe::ProbeOptions;
use crate::session::SessionOptions;
use crate::transport::TransportMode;

/// Settings shared by every front end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Skip model detection and assume this model.
    pub model: Option<ScannerModel>,
    /// Ring handshakes sent during the probe.
    pub ring_count: u32,
    pub ring_delay_ms: u64,
    /// Transfer modes the probe may pick, e.g. without `epp32` or `ecp`.
    pub allowed_modes: Vec<TransportMode>,
    /// Use this mode without running the ladder.
    pub force_mode: Option<TransportMode>,
    /// Re-home thoroughly on open.
    pub recover: bool,
    /// Bytes requested per scan data read.
    pub buffer_size: usize,
    pub lamp_warmup_ms: u64,
    /// Port the scanner is attached to.
    pub port: PortSpec,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            model: None,
            ring_count: 3,
            ring_delay_ms: 10,
            allowed_modes: TransportMode::LADDER.to_vec(),
            force_mode: None,
            recover: false,
            buffer_size: 0x10000,
            lamp_warmup_ms: 500,
            port: PortSpec::default(),
        }
    }
}

impl DriverConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DriverConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn probe_options(&self) -> ProbeOptions {
        ProbeOptions {
            ring_count: self.ring_count,
            ring_delay: Duration::from_millis(self.ring_delay_ms),
            allowed_modes: self.allowed_modes.clone(),
            force_mode: self.force_mode,
        }
    }
}

impl From<&DriverConfig> for SessionOptions {
    fn from(config: &DriverConfig) -> Self {
        SessionOptions {
            recover: config.recover,
            buffer_size: config.buffer_size.max(1),
            lamp_warmup: Duration::from_millis(config.lamp_warmup_ms),
            ..SessionOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ppscan.toml");
        let config = DriverConfig {
            port: PortSpec::Address(0x378),
            model: Some(ScannerModel::Model1600),
            allowed_modes: vec![TransportMode::Ps2, TransportMode::Epp8],
            force_mode: Some(TransportMode::Byte),
            recover: true,
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();
        let loaded = DriverConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: DriverConfig = toml::from_str(
            r#"
            model = "610"
            allowed_modes = ["ps2", "epp8"]

            [port]
            device = "/dev/parport1"
            "#,
        )
        .unwrap();
        assert_eq!(config.model, Some(ScannerModel::Model610));
        assert_eq!(config.port, PortSpec::Device("/dev/parport1".into()));
        assert_eq!(config.ring_count, 3);
        let probe = config.probe_options();
        assert_eq!(probe.allowed_modes, vec![TransportMode::Ps2, TransportMode::Epp8]);
    }
}
