//! Port access layer.

#[cfg(unix)]
pub mod direct;
pub mod lock;
pub mod mock;
#[cfg(target_os = "linux")]
pub mod ppdev;
pub mod traits;

#[cfg(unix)]
pub use direct::DirectPort;
pub use lock::PortLock;
pub use mock::{MockChip, MockPort};
#[cfg(target_os = "linux")]
pub use ppdev::PpdevPort;
pub use traits::{ParallelPort, PortCapabilities, PortError, PortRegister};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where the scanner is attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortSpec {
    /// Raw I/O at a base address through `/dev/port` (e.g. 0x378).
    Address(u16),
    /// OS parallel port device (e.g. `/dev/parport0`).
    Device(String),
}

impl PortSpec {
    /// Parse a port argument: hex/decimal addresses or a device path.
    pub fn parse(text: &str) -> Self {
        let trimmed = text.trim();
        let parsed = match trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
            Some(hex) => u16::from_str_radix(hex, 16).ok(),
            None => trimmed.parse::<u16>().ok(),
        };
        match parsed {
            Some(addr) => PortSpec::Address(addr),
            None => PortSpec::Device(trimmed.to_string()),
        }
    }

    /// Open the port described by this spec.
    pub fn open(&self) -> Result<Box<dyn ParallelPort>, PortError> {
        match self {
            #[cfg(unix)]
            PortSpec::Address(addr) => Ok(Box::new(DirectPort::open(*addr)?)),
            #[cfg(target_os = "linux")]
            PortSpec::Device(path) => Ok(Box::new(PpdevPort::open(path)?)),
            #[allow(unreachable_patterns)]
            other => Err(PortError::OpenFailed {
                port: other.to_string(),
                message: "port backend not available on this platform".into(),
            }),
        }
    }
}

impl Default for PortSpec {
    fn default() -> Self {
        PortSpec::Device("/dev/parport0".into())
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSpec::Address(addr) => write!(f, "0x{:03X}", addr),
            PortSpec::Device(path) => write!(f, "{}", path),
        }
    }
}
