//! EPP address/data strobe cycles, 8 and 32 bit.

use super::TransportError;
use super::signals::*;
use crate::port::{ParallelPort, PortRegister};

pub(crate) fn register_write<P: ParallelPort>(
    port: &mut P,
    reg: u8,
    value: u8,
) -> Result<(), TransportError> {
    port.outb(PortRegister::EppAddress, ADDR_WRITE | (reg & ADDR_REGISTER_MASK))?;
    port.outb(PortRegister::EppData, value)?;
    Ok(())
}

pub(crate) fn register_read<P: ParallelPort>(port: &mut P, reg: u8) -> Result<u8, TransportError> {
    port.outb(PortRegister::EppAddress, reg & ADDR_REGISTER_MASK)?;
    Ok(port.inb(PortRegister::EppData)?)
}

pub(crate) fn block_write<P: ParallelPort>(
    port: &mut P,
    data: &[u8],
    wide: bool,
) -> Result<(), TransportError> {
    port.outb(PortRegister::EppAddress, ADDR_BLOCK_WRITE)?;
    let tail = if wide {
        let mut words = data.chunks_exact(4);
        for word in words.by_ref() {
            port.outl(PortRegister::EppData, [word[0], word[1], word[2], word[3]])?;
        }
        words.remainder()
    } else {
        data
    };
    for &byte in tail {
        port.outb(PortRegister::EppData, byte)?;
    }
    Ok(())
}

pub(crate) fn block_read<P: ParallelPort>(
    port: &mut P,
    len: usize,
    wide: bool,
) -> Result<Vec<u8>, TransportError> {
    port.outb(PortRegister::EppAddress, ADDR_BLOCK_READ)?;
    let mut data = Vec::with_capacity(len);
    if wide {
        for _ in 0..len / 4 {
            data.extend_from_slice(&port.inl(PortRegister::EppData)?);
        }
    }
    while data.len() < len {
        data.push(port.inb(PortRegister::EppData)?);
    }
    Ok(data)
}
