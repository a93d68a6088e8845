//! Linux ppdev (`/dev/parportN`) backend.
//!
//! Status/control/data lines map to the PPR*/PPW* ioctls. EPP address and
//! data cycles are plain `read`/`write` calls after switching the IEEE 1284
//! mode. The kernel owns the ECP FIFO, so ECR reads are synthesized from the
//! transfer direction.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;

use tracing::{debug, info, instrument, warn};

use super::traits::{ParallelPort, PortCapabilities, PortError, PortRegister};
use crate::transport::signals::{CTRL_REVERSE, ECR_ECP, ECR_FIFO_EMPTY, ECR_MODE_MASK};

const fn ioc(dir: u32, nr: u32, size: u32) -> u32 {
    (dir << 30) | (size << 16) | ((b'p' as u32) << 8) | nr
}

const IOC_NONE: u32 = 0;
const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const PPSETMODE: u32 = ioc(IOC_WRITE, 0x80, 4);
const PPRSTATUS: u32 = ioc(IOC_READ, 0x81, 1);
const PPRCONTROL: u32 = ioc(IOC_READ, 0x83, 1);
const PPWCONTROL: u32 = ioc(IOC_WRITE, 0x84, 1);
const PPRDATA: u32 = ioc(IOC_READ, 0x85, 1);
const PPWDATA: u32 = ioc(IOC_WRITE, 0x86, 1);
const PPCLAIM: u32 = ioc(IOC_NONE, 0x8b, 0);
const PPRELEASE: u32 = ioc(IOC_NONE, 0x8c, 0);
const PPDATADIR: u32 = ioc(IOC_WRITE, 0x90, 4);
const PPGETMODES: u32 = ioc(IOC_READ, 0x97, 4);

const PARPORT_MODE_TRISTATE: u32 = 1 << 1;
const PARPORT_MODE_EPP: u32 = 1 << 2;
const PARPORT_MODE_ECP: u32 = 1 << 3;

const IEEE1284_MODE_COMPAT: libc::c_int = 1 << 8;
const IEEE1284_MODE_ECP: libc::c_int = 1 << 4;
const IEEE1284_MODE_EPP: libc::c_int = 1 << 6;
const IEEE1284_ADDR: libc::c_int = 1 << 13;

/// Parallel port accessed through the ppdev driver.
pub struct PpdevPort {
    file: File,
    name: String,
    capabilities: PortCapabilities,
    mode: libc::c_int,
    control: u8,
    ecr: u8,
}

impl PpdevPort {
    /// Open and claim a ppdev device.
    #[instrument(level = "info")]
    pub fn open(path: &str) -> Result<Self, PortError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| PortError::OpenFailed {
                port: path.to_string(),
                message: e.to_string(),
            })?;

        let mut port = Self {
            file,
            name: path.to_string(),
            capabilities: PortCapabilities::default(),
            mode: IEEE1284_MODE_COMPAT,
            control: 0,
            ecr: 0,
        };

        port.ioctl_none(PPCLAIM, "PPCLAIM")
            .map_err(|e| PortError::ClaimFailed {
                port: path.to_string(),
                message: e.to_string(),
            })?;

        let mut modes: libc::c_uint = 0;
        match port.ioctl_ptr(PPGETMODES, "PPGETMODES", &mut modes) {
            Ok(()) => {
                port.capabilities = PortCapabilities {
                    bidirectional: modes & PARPORT_MODE_TRISTATE != 0,
                    epp: modes & PARPORT_MODE_EPP != 0,
                    ecp: modes & PARPORT_MODE_ECP != 0,
                };
            }
            Err(e) => warn!(error = %e, "PPGETMODES failed, assuming EPP without ECP"),
        }

        info!(
            port = %path,
            epp = port.capabilities.epp,
            ecp = port.capabilities.ecp,
            "ppdev port claimed"
        );
        Ok(port)
    }

    fn ioctl_none(&self, request: u32, name: &'static str) -> Result<(), PortError> {
        // SAFETY: request takes no argument and the fd is owned by self.
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), request as _) };
        if rc < 0 {
            return Err(PortError::Ioctl {
                request: name,
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    fn ioctl_ptr<T>(&self, request: u32, name: &'static str, arg: &mut T) -> Result<(), PortError> {
        // SAFETY: `arg` points to a value of the size encoded in `request`.
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), request as _, arg as *mut T) };
        if rc < 0 {
            return Err(PortError::Ioctl {
                request: name,
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    fn set_mode(&mut self, mode: libc::c_int) -> Result<(), PortError> {
        if self.mode != mode {
            let mut arg = mode;
            self.ioctl_ptr(PPSETMODE, "PPSETMODE", &mut arg)?;
            debug!(mode = format!("0x{:04X}", mode), "IEEE 1284 mode set");
            self.mode = mode;
        }
        Ok(())
    }

    fn cycle_read(&mut self, mode: libc::c_int) -> Result<u8, PortError> {
        self.set_mode(mode)?;
        let mut byte = [0u8; 1];
        self.file.read_exact(&mut byte)?;
        Ok(byte[0])
    }

    fn cycle_write(&mut self, mode: libc::c_int, bytes: &[u8]) -> Result<(), PortError> {
        self.set_mode(mode)?;
        self.file.write_all(bytes)?;
        Ok(())
    }
}

impl ParallelPort for PpdevPort {
    fn inb(&mut self, reg: PortRegister) -> Result<u8, PortError> {
        let mut value: u8 = 0;
        match reg {
            PortRegister::Data => self.ioctl_ptr(PPRDATA, "PPRDATA", &mut value)?,
            PortRegister::Status => self.ioctl_ptr(PPRSTATUS, "PPRSTATUS", &mut value)?,
            PortRegister::Control => self.ioctl_ptr(PPRCONTROL, "PPRCONTROL", &mut value)?,
            PortRegister::EppAddress => value = self.cycle_read(IEEE1284_MODE_EPP | IEEE1284_ADDR)?,
            PortRegister::EppData => value = self.cycle_read(IEEE1284_MODE_EPP)?,
            PortRegister::EcpFifo => value = self.cycle_read(IEEE1284_MODE_ECP)?,
            PortRegister::EcpControl => {
                let fifo = if self.control & CTRL_REVERSE != 0 {
                    0
                } else {
                    ECR_FIFO_EMPTY
                };
                value = (self.ecr & ECR_MODE_MASK) | fifo;
            }
        }
        Ok(value)
    }

    fn outb(&mut self, reg: PortRegister, value: u8) -> Result<(), PortError> {
        let mut arg = value;
        match reg {
            PortRegister::Data if self.ecr & ECR_MODE_MASK == ECR_ECP => {
                self.cycle_write(IEEE1284_MODE_ECP | IEEE1284_ADDR, &[value])?
            }
            PortRegister::Data => self.ioctl_ptr(PPWDATA, "PPWDATA", &mut arg)?,
            PortRegister::Control => {
                if (value ^ self.control) & CTRL_REVERSE != 0 {
                    let mut dir: libc::c_int = i32::from(value & CTRL_REVERSE != 0);
                    self.ioctl_ptr(PPDATADIR, "PPDATADIR", &mut dir)?;
                }
                self.ioctl_ptr(PPWCONTROL, "PPWCONTROL", &mut arg)?;
                self.control = value;
            }
            PortRegister::EppAddress => {
                self.cycle_write(IEEE1284_MODE_EPP | IEEE1284_ADDR, &[value])?
            }
            PortRegister::EppData => self.cycle_write(IEEE1284_MODE_EPP, &[value])?,
            PortRegister::EcpFifo => self.cycle_write(IEEE1284_MODE_ECP, &[value])?,
            PortRegister::EcpControl => {
                self.ecr = value;
                if value & ECR_MODE_MASK != ECR_ECP {
                    self.set_mode(IEEE1284_MODE_COMPAT)?;
                }
            }
            PortRegister::Status => {
                return Err(PortError::Unsupported {
                    register: reg,
                    backend: "ppdev",
                });
            }
        }
        Ok(())
    }

    fn inl(&mut self, reg: PortRegister) -> Result<[u8; 4], PortError> {
        if reg != PortRegister::EppData {
            return Err(PortError::Unsupported {
                register: reg,
                backend: "ppdev",
            });
        }
        self.set_mode(IEEE1284_MODE_EPP)?;
        let mut word = [0u8; 4];
        self.file.read_exact(&mut word)?;
        Ok(word)
    }

    fn outl(&mut self, reg: PortRegister, word: [u8; 4]) -> Result<(), PortError> {
        if reg != PortRegister::EppData {
            return Err(PortError::Unsupported {
                register: reg,
                backend: "ppdev",
            });
        }
        self.cycle_write(IEEE1284_MODE_EPP, &word)
    }

    fn capabilities(&self) -> PortCapabilities {
        self.capabilities
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for PpdevPort {
    fn drop(&mut self) {
        if let Err(e) = self.set_mode(IEEE1284_MODE_COMPAT) {
            warn!(port = %self.name, error = %e, "Failed to restore compatibility mode");
        }
        if let Err(e) = self.ioctl_none(PPRELEASE, "PPRELEASE") {
            warn!(port = %self.name, error = %e, "Failed to release port");
        }
    }
}
