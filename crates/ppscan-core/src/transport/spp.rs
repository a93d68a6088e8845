//! SPP-style handshakes: PS2/nibble and byte modes.
//!
//! Addresses and data bytes are latched from the data lines by control
//! strobes. Reads come back either as two status-line nibbles (nibble mode)
//! or on the data lines with the direction bit set (byte mode).

use tracing::warn;

use super::TransportError;
use super::signals::*;
use crate::port::{ParallelPort, PortRegister};

fn latch<P: ParallelPort>(port: &mut P, value: u8, strobe: u8) -> Result<(), TransportError> {
    port.outb(PortRegister::Data, value)?;
    port.outb(PortRegister::Control, strobe)?;
    port.outb(PortRegister::Control, CTRL_IDLE)?;
    Ok(())
}

pub(crate) fn address<P: ParallelPort>(port: &mut P, addr: u8) -> Result<(), TransportError> {
    latch(port, addr, CTRL_ADDR)
}

pub(crate) fn write_byte<P: ParallelPort>(port: &mut P, value: u8) -> Result<(), TransportError> {
    latch(port, value, CTRL_WRITE)
}

/// Status lines are sampled twice; a mismatch is a soft glitch that is
/// logged and resolved by a third sample.
fn sample_nibble<P: ParallelPort>(port: &mut P, select: u8) -> Result<u8, TransportError> {
    port.outb(PortRegister::Control, select)?;
    let first = port.inb(PortRegister::Status)?;
    let second = port.inb(PortRegister::Status)?;
    if first != second {
        warn!(
            first = format!("0x{:02X}", first),
            second = format!("0x{:02X}", second),
            "Unstable status lines during nibble read"
        );
        return Ok(port.inb(PortRegister::Status)? & 0xF0);
    }
    Ok(first & 0xF0)
}

pub(crate) fn read_nibble_byte<P: ParallelPort>(port: &mut P) -> Result<u8, TransportError> {
    let low = sample_nibble(port, CTRL_NIBBLE_LO)?;
    let high = sample_nibble(port, CTRL_NIBBLE_HI)?;
    port.outb(PortRegister::Control, CTRL_IDLE)?;
    Ok((low >> 4) | high)
}

pub(crate) fn read_data_byte<P: ParallelPort>(port: &mut P) -> Result<u8, TransportError> {
    port.outb(PortRegister::Control, CTRL_BYTE_READ)?;
    let value = port.inb(PortRegister::Data)?;
    port.outb(PortRegister::Control, CTRL_REVERSE | CTRL_IDLE)?;
    Ok(value)
}

pub(crate) fn register_write<P: ParallelPort>(
    port: &mut P,
    reg: u8,
    value: u8,
) -> Result<(), TransportError> {
    address(port, ADDR_WRITE | (reg & ADDR_REGISTER_MASK))?;
    write_byte(port, value)
}

pub(crate) fn register_read_nibble<P: ParallelPort>(
    port: &mut P,
    reg: u8,
) -> Result<u8, TransportError> {
    address(port, reg & ADDR_REGISTER_MASK)?;
    read_nibble_byte(port)
}

pub(crate) fn register_read_byte<P: ParallelPort>(
    port: &mut P,
    reg: u8,
) -> Result<u8, TransportError> {
    address(port, reg & ADDR_REGISTER_MASK)?;
    port.outb(PortRegister::Control, CTRL_REVERSE | CTRL_IDLE)?;
    let value = read_data_byte(port)?;
    port.outb(PortRegister::Control, CTRL_IDLE)?;
    Ok(value)
}

pub(crate) fn block_write<P: ParallelPort>(port: &mut P, data: &[u8]) -> Result<(), TransportError> {
    address(port, ADDR_BLOCK_WRITE)?;
    for &byte in data {
        write_byte(port, byte)?;
    }
    Ok(())
}

pub(crate) fn block_read_nibble<P: ParallelPort>(
    port: &mut P,
    len: usize,
) -> Result<Vec<u8>, TransportError> {
    address(port, ADDR_BLOCK_READ)?;
    let mut data = Vec::with_capacity(len);
    for _ in 0..len {
        data.push(read_nibble_byte(port)?);
    }
    Ok(data)
}

pub(crate) fn block_read_byte<P: ParallelPort>(
    port: &mut P,
    len: usize,
) -> Result<Vec<u8>, TransportError> {
    address(port, ADDR_BLOCK_READ)?;
    port.outb(PortRegister::Control, CTRL_REVERSE | CTRL_IDLE)?;
    let mut data = Vec::with_capacity(len);
    for _ in 0..len {
        data.push(read_data_byte(port)?);
    }
    port.outb(PortRegister::Control, CTRL_IDLE)?;
    Ok(data)
}
