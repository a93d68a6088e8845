//! Direct register access through `/dev/port`.
//!
//! Each byte offset of `/dev/port` is an I/O port, so the parallel port
//! registers live at `base + offset`. Requires root (CAP_SYS_RAWIO).

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;

use tracing::{debug, info, instrument};

use super::traits::{ParallelPort, PortCapabilities, PortError, PortRegister};
use crate::transport::signals::{ECR_FIFO_EMPTY, ECR_FIFO_FULL};

const DEV_PORT: &str = "/dev/port";

/// Parallel port driven through raw I/O.
pub struct DirectPort {
    file: File,
    base: u64,
    name: String,
    capabilities: PortCapabilities,
}

impl DirectPort {
    /// Open the port at `base` (e.g. 0x378) and detect its features.
    #[instrument(level = "info", fields(base = format!("0x{:03X}", base)))]
    pub fn open(base: u16) -> Result<Self, PortError> {
        let name = format!("0x{:03X}", base);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(DEV_PORT)
            .map_err(|e| PortError::OpenFailed {
                port: name.clone(),
                message: format!("{}: {}", DEV_PORT, e),
            })?;

        let mut port = Self {
            file,
            base: base as u64,
            name,
            capabilities: PortCapabilities::default(),
        };
        port.capabilities.ecp = port.detect_ecp()?;

        info!(
            port = %port.name,
            ecp = port.capabilities.ecp,
            "Direct I/O port opened"
        );
        Ok(port)
    }

    /// An ECR answers with FIFO empty set and full clear, and keeps the mode
    /// bits we write to it.
    fn detect_ecp(&mut self) -> Result<bool, PortError> {
        let saved = self.inb(PortRegister::EcpControl)?;
        if saved & (ECR_FIFO_EMPTY | ECR_FIFO_FULL) != ECR_FIFO_EMPTY {
            return Ok(false);
        }
        self.outb(PortRegister::EcpControl, 0x34)?;
        let probe = self.inb(PortRegister::EcpControl)?;
        self.outb(PortRegister::EcpControl, saved)?;
        debug!(ecr = format!("0x{:02X}", probe), "ECR probe");
        Ok(probe == 0x35)
    }
}

impl ParallelPort for DirectPort {
    fn inb(&mut self, reg: PortRegister) -> Result<u8, PortError> {
        let mut byte = [0u8; 1];
        self.file.read_exact_at(&mut byte, self.base + reg.offset())?;
        Ok(byte[0])
    }

    fn outb(&mut self, reg: PortRegister, value: u8) -> Result<(), PortError> {
        self.file.write_all_at(&[value], self.base + reg.offset())?;
        Ok(())
    }

    fn capabilities(&self) -> PortCapabilities {
        self.capabilities
    }

    fn name(&self) -> &str {
        &self.name
    }
}
