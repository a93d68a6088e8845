//! Transfer modes layered on the raw port.
//!
//! A `Transport` owns the port and routes register and block transfers
//! through the encoding of the active `TransportMode`.

mod ecp;
mod epp;
pub mod retry;
pub mod signals;
mod spp;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use crate::port::{ParallelPort, PortError, PortRegister};

pub use retry::{Attempt, retry_with_limit};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Port error: {0}")]
    Port(#[from] PortError),

    #[error("Timeout waiting for {operation} after {iterations} polls")]
    Timeout {
        operation: &'static str,
        iterations: usize,
    },

    #[error("Short transfer: expected {expected} bytes, got {actual}")]
    ShortTransfer { expected: usize, actual: usize },

    #[error("Transfer mode {mode} not available on this port")]
    ModeUnavailable { mode: TransportMode },
}

/// IEEE 1284 transfer mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// PS/2 nibble mode: two status-line nibbles per byte.
    Ps2,
    /// Bidirectional byte mode.
    Byte,
    /// EPP, one byte per strobe.
    Epp8,
    /// EPP, four bytes per strobe.
    Epp32,
    /// ECP hardware FIFO.
    Ecp,
}

impl TransportMode {
    /// Probe ladder, slowest first.
    pub const LADDER: [TransportMode; 4] = [
        TransportMode::Ps2,
        TransportMode::Epp8,
        TransportMode::Epp32,
        TransportMode::Ecp,
    ];
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMode::Ps2 => write!(f, "PS2"),
            TransportMode::Byte => write!(f, "BYTE"),
            TransportMode::Epp8 => write!(f, "EPP8"),
            TransportMode::Epp32 => write!(f, "EPP32"),
            TransportMode::Ecp => write!(f, "ECP"),
        }
    }
}

impl FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ps2" | "nibble" => Ok(TransportMode::Ps2),
            "byte" => Ok(TransportMode::Byte),
            "epp8" | "epp" => Ok(TransportMode::Epp8),
            "epp32" => Ok(TransportMode::Epp32),
            "ecp" => Ok(TransportMode::Ecp),
            other => Err(format!("unknown transfer mode '{}'", other)),
        }
    }
}

/// Port plus active transfer mode.
pub struct Transport<P: ParallelPort> {
    port: P,
    mode: TransportMode,
}

impl<P: ParallelPort> Transport<P> {
    pub fn new(port: P, mode: TransportMode) -> Self {
        Self { port, mode }
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: TransportMode) {
        trace!(from = %self.mode, to = %mode, "Transfer mode switched");
        self.mode = mode;
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Read one ASIC register.
    pub fn read_register(&mut self, reg: u8) -> Result<u8, TransportError> {
        let value = match self.mode {
            TransportMode::Ps2 => spp::register_read_nibble(&mut self.port, reg)?,
            TransportMode::Byte => spp::register_read_byte(&mut self.port, reg)?,
            TransportMode::Epp8 | TransportMode::Epp32 => epp::register_read(&mut self.port, reg)?,
            TransportMode::Ecp => ecp::register_read(&mut self.port, reg)?,
        };
        trace!(reg = format!("0x{:02X}", reg), value = format!("0x{:02X}", value), "register read");
        Ok(value)
    }

    /// Write one ASIC register.
    pub fn write_register(&mut self, reg: u8, value: u8) -> Result<(), TransportError> {
        trace!(reg = format!("0x{:02X}", reg), value = format!("0x{:02X}", value), "register write");
        match self.mode {
            TransportMode::Ps2 | TransportMode::Byte => {
                spp::register_write(&mut self.port, reg, value)
            }
            TransportMode::Epp8 | TransportMode::Epp32 => {
                epp::register_write(&mut self.port, reg, value)
            }
            TransportMode::Ecp => ecp::register_write(&mut self.port, reg, value),
        }
    }

    /// Read `len` bytes from the ASIC block buffer.
    pub fn read_block(&mut self, len: usize) -> Result<Vec<u8>, TransportError> {
        let data = match self.mode {
            TransportMode::Ps2 => spp::block_read_nibble(&mut self.port, len)?,
            TransportMode::Byte => spp::block_read_byte(&mut self.port, len)?,
            TransportMode::Epp8 => epp::block_read(&mut self.port, len, false)?,
            TransportMode::Epp32 => epp::block_read(&mut self.port, len, true)?,
            TransportMode::Ecp => ecp::block_read(&mut self.port, len)?,
        };
        if data.len() != len {
            return Err(TransportError::ShortTransfer {
                expected: len,
                actual: data.len(),
            });
        }
        trace!(len, "block read");
        Ok(data)
    }

    /// Write `data` into the ASIC block buffer.
    pub fn write_block(&mut self, data: &[u8]) -> Result<(), TransportError> {
        trace!(len = data.len(), "block write");
        match self.mode {
            TransportMode::Ps2 | TransportMode::Byte => spp::block_write(&mut self.port, data),
            TransportMode::Epp8 => epp::block_write(&mut self.port, data, false),
            TransportMode::Epp32 => epp::block_write(&mut self.port, data, true),
            TransportMode::Ecp => ecp::block_write(&mut self.port, data),
        }
    }

    /// Sample the status lines.
    pub fn raw_status(&mut self) -> Result<u8, TransportError> {
        Ok(self.port.inb(PortRegister::Status)?)
    }

    /// Clock a handshake sequence onto the data lines, one strobe per byte.
    pub fn send_handshake(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.port.outb(PortRegister::Control, signals::CTRL_IDLE)?;
        for &byte in bytes {
            self.port.outb(PortRegister::Data, byte)?;
        }
        Ok(())
    }
}
