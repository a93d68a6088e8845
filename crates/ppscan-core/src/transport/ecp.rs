//! ECP FIFO transfers.
//!
//! Every push waits for "not full" and every pop for "not empty" on the
//! extended control register. The ECR is switched to ECP mode at the start
//! of each transfer and back to PS2 mode afterwards.

use tracing::trace;

use super::TransportError;
use super::retry::{Attempt, retry_with_limit};
use super::signals::*;
use crate::port::{ParallelPort, PortRegister};

fn wait_fifo<P: ParallelPort>(
    port: &mut P,
    mask: u8,
    operation: &'static str,
) -> Result<(), TransportError> {
    let ready = retry_with_limit(FIFO_WAIT_LIMIT, |_| {
        let ecr = port.inb(PortRegister::EcpControl)?;
        Ok::<_, TransportError>(if ecr & mask == 0 {
            Attempt::Done(())
        } else {
            Attempt::Retry
        })
    })?;
    ready.ok_or(TransportError::Timeout {
        operation,
        iterations: FIFO_WAIT_LIMIT,
    })
}

fn wait_drained<P: ParallelPort>(port: &mut P) -> Result<(), TransportError> {
    let drained = retry_with_limit(FIFO_WAIT_LIMIT, |_| {
        let ecr = port.inb(PortRegister::EcpControl)?;
        Ok::<_, TransportError>(if ecr & ECR_FIFO_EMPTY != 0 {
            Attempt::Done(())
        } else {
            Attempt::Retry
        })
    })?;
    drained.ok_or(TransportError::Timeout {
        operation: "ECP FIFO drain",
        iterations: FIFO_WAIT_LIMIT,
    })
}

fn enter_forward<P: ParallelPort>(port: &mut P) -> Result<(), TransportError> {
    port.outb(PortRegister::Control, CTRL_IDLE)?;
    port.outb(PortRegister::EcpControl, ECR_ECP)?;
    Ok(())
}

fn enter_reverse<P: ParallelPort>(port: &mut P) -> Result<(), TransportError> {
    wait_drained(port)?;
    port.outb(PortRegister::Control, CTRL_REVERSE | CTRL_IDLE)?;
    trace!("ECP direction reversed");
    Ok(())
}

fn leave<P: ParallelPort>(port: &mut P) -> Result<(), TransportError> {
    port.outb(PortRegister::Control, CTRL_IDLE)?;
    port.outb(PortRegister::EcpControl, ECR_PS2)?;
    Ok(())
}

fn push<P: ParallelPort>(port: &mut P, reg: PortRegister, value: u8) -> Result<(), TransportError> {
    wait_fifo(port, ECR_FIFO_FULL, "ECP FIFO not full")?;
    port.outb(reg, value)?;
    Ok(())
}

fn pop<P: ParallelPort>(port: &mut P) -> Result<u8, TransportError> {
    wait_fifo(port, ECR_FIFO_EMPTY, "ECP FIFO not empty")?;
    Ok(port.inb(PortRegister::EcpFifo)?)
}

pub(crate) fn register_write<P: ParallelPort>(
    port: &mut P,
    reg: u8,
    value: u8,
) -> Result<(), TransportError> {
    enter_forward(port)?;
    push(port, PortRegister::Data, ADDR_WRITE | (reg & ADDR_REGISTER_MASK))?;
    push(port, PortRegister::EcpFifo, value)?;
    wait_drained(port)?;
    leave(port)
}

pub(crate) fn register_read<P: ParallelPort>(port: &mut P, reg: u8) -> Result<u8, TransportError> {
    enter_forward(port)?;
    push(port, PortRegister::Data, reg & ADDR_REGISTER_MASK)?;
    enter_reverse(port)?;
    let value = pop(port)?;
    leave(port)?;
    Ok(value)
}

pub(crate) fn block_write<P: ParallelPort>(port: &mut P, data: &[u8]) -> Result<(), TransportError> {
    enter_forward(port)?;
    push(port, PortRegister::Data, ADDR_BLOCK_WRITE)?;
    for &byte in data {
        push(port, PortRegister::EcpFifo, byte)?;
    }
    wait_drained(port)?;
    leave(port)
}

pub(crate) fn block_read<P: ParallelPort>(
    port: &mut P,
    len: usize,
) -> Result<Vec<u8>, TransportError> {
    enter_forward(port)?;
    push(port, PortRegister::Data, ADDR_BLOCK_READ)?;
    enter_reverse(port)?;
    let mut data = Vec::with_capacity(len);
    for _ in 0..len {
        data.push(pop(port)?);
    }
    leave(port)?;
    Ok(data)
}
