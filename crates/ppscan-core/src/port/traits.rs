//! Parallel port access abstraction.
//!
//! Defines the `ParallelPort` trait for register-level port I/O,
//! allowing different implementations (direct I/O, ppdev, mock).

use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PortError {
    #[error("Failed to open port {port}: {message}")]
    OpenFailed { port: String, message: String },

    #[error("Port {port} is already claimed")]
    Busy { port: String },

    #[error("Failed to claim port {port}: {message}")]
    ClaimFailed { port: String, message: String },

    #[error("Register {register} not supported by {backend}")]
    Unsupported {
        register: PortRegister,
        backend: &'static str,
    },

    #[error("ioctl {request} failed: {source}")]
    Ioctl {
        request: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Injected fault after {operations} operations")]
    InjectedFault { operations: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Logical registers of a PC parallel port.
///
/// Offsets are relative to the port base address (SPP/EPP block) or to
/// base + 0x400 (ECP extended block).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortRegister {
    /// Data lines (base + 0). In ECP mode this is the address/command FIFO.
    Data,
    /// Status lines (base + 1), read only.
    Status,
    /// Control lines (base + 2).
    Control,
    /// EPP address strobe cycle (base + 3).
    EppAddress,
    /// EPP data strobe cycle (base + 4).
    EppData,
    /// ECP data FIFO (base + 0x400).
    EcpFifo,
    /// ECP extended control register (base + 0x402).
    EcpControl,
}

impl PortRegister {
    /// Offset of the register from the port base address.
    pub fn offset(&self) -> u64 {
        match self {
            PortRegister::Data => 0,
            PortRegister::Status => 1,
            PortRegister::Control => 2,
            PortRegister::EppAddress => 3,
            PortRegister::EppData => 4,
            PortRegister::EcpFifo => 0x400,
            PortRegister::EcpControl => 0x402,
        }
    }
}

impl fmt::Display for PortRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortRegister::Data => write!(f, "DATA"),
            PortRegister::Status => write!(f, "STATUS"),
            PortRegister::Control => write!(f, "CONTROL"),
            PortRegister::EppAddress => write!(f, "EPPADDR"),
            PortRegister::EppData => write!(f, "EPPDATA"),
            PortRegister::EcpFifo => write!(f, "ECPFIFO"),
            PortRegister::EcpControl => write!(f, "ECR"),
        }
    }
}

/// Hardware features reported by the port or the OS driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortCapabilities {
    /// Bidirectional data lines (PS/2 and byte modes).
    pub bidirectional: bool,
    /// EPP address/data cycles.
    pub epp: bool,
    /// ECP FIFO and extended control register.
    pub ecp: bool,
}

impl Default for PortCapabilities {
    fn default() -> Self {
        Self {
            bidirectional: true,
            epp: true,
            ecp: false,
        }
    }
}

/// Abstract parallel port interface.
///
/// Every call is a single blocking bus operation. Implementations are
/// exclusively owned by one `Connection`.
pub trait ParallelPort: Send {
    /// Read one byte from a port register.
    fn inb(&mut self, reg: PortRegister) -> Result<u8, PortError>;

    /// Write one byte to a port register.
    fn outb(&mut self, reg: PortRegister, value: u8) -> Result<(), PortError>;

    /// Read four bytes in a single 32-bit cycle (EPP data only).
    fn inl(&mut self, reg: PortRegister) -> Result<[u8; 4], PortError> {
        let mut word = [0u8; 4];
        for byte in word.iter_mut() {
            *byte = self.inb(reg)?;
        }
        Ok(word)
    }

    /// Write four bytes in a single 32-bit cycle (EPP data only).
    fn outl(&mut self, reg: PortRegister, word: [u8; 4]) -> Result<(), PortError> {
        for byte in word {
            self.outb(reg, byte)?;
        }
        Ok(())
    }

    /// Features available on this port.
    fn capabilities(&self) -> PortCapabilities;

    /// Human readable port name, also used as the lock key.
    fn name(&self) -> &str;
}

impl<P: ParallelPort + ?Sized> ParallelPort for Box<P> {
    fn inb(&mut self, reg: PortRegister) -> Result<u8, PortError> {
        (**self).inb(reg)
    }

    fn outb(&mut self, reg: PortRegister, value: u8) -> Result<(), PortError> {
        (**self).outb(reg, value)
    }

    fn inl(&mut self, reg: PortRegister) -> Result<[u8; 4], PortError> {
        (**self).inl(reg)
    }

    fn outl(&mut self, reg: PortRegister, word: [u8; 4]) -> Result<(), PortError> {
        (**self).outl(reg, word)
    }

    fn capabilities(&self) -> PortCapabilities {
        (**self).capabilities()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
