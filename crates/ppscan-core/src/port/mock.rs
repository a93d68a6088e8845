//! Mock parallel port for testing.
//!
//! Decodes the signaling of every transfer mode (SPP handshakes, EPP
//! cycles, ECP FIFO) into an emulated scanner chip with a 64-entry register
//! file and a block buffer. Block reads continue where the previous one
//! stopped; a block write rewinds the buffer. Clones share state, so a test
//! can keep a handle after the port has been moved into a `Connection`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::traits::{ParallelPort, PortCapabilities, PortError, PortRegister};
use crate::protocol::constants::{
    ASIC_VERSION, LINK_READY, REG_LINK_STATUS, REG_SCANNER_STATUS, REG_VERSION, SYNC_MAGIC,
};
use crate::transport::signals::*;

/// Which chip answers on the emulated bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockChip {
    /// Register-addressed bridge chip (1220/1600/2000 family).
    Bridged,
    /// Direct sensor controller (610 family): no version register.
    Direct,
    /// Nothing attached.
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    None,
    RegisterRead(u8),
    RegisterWrite(u8),
    BlockRead,
    BlockWrite,
}

#[derive(Debug)]
struct MockState {
    chip: MockChip,
    capabilities: PortCapabilities,
    registers: [u8; 64],
    register_queues: HashMap<u8, VecDeque<u8>>,
    register_log: Vec<(u8, u8)>,
    buffer: Vec<u8>,
    read_cursor: usize,
    block_queue: VecDeque<u8>,
    block_log: Vec<u8>,
    pending: Pending,
    data_latch: u8,
    control: u8,
    ecr: u8,
    ecr_writes: usize,
    presented: u8,
    history: VecDeque<u8>,
    connected: bool,
    ring_ack: bool,
    direct_synced: bool,
    operations: usize,
    fail_after: Option<usize>,
    corrupt_epp32: bool,
}

impl MockState {
    fn new(chip: MockChip) -> Self {
        let mut registers = [0u8; 64];
        registers[REG_VERSION as usize] = ASIC_VERSION;
        registers[REG_LINK_STATUS as usize] = LINK_READY;
        Self {
            chip,
            capabilities: PortCapabilities::default(),
            registers,
            register_queues: HashMap::new(),
            register_log: Vec::new(),
            buffer: Vec::new(),
            read_cursor: 0,
            block_queue: VecDeque::new(),
            block_log: Vec::new(),
            pending: Pending::None,
            data_latch: 0,
            control: CTRL_IDLE,
            ecr: ECR_PS2,
            ecr_writes: 0,
            presented: 0,
            history: VecDeque::with_capacity(9),
            connected: false,
            ring_ack: false,
            direct_synced: false,
            operations: 0,
            fail_after: None,
            corrupt_epp32: false,
        }
    }

    fn tick(&mut self) -> Result<(), PortError> {
        self.operations += 1;
        match self.fail_after {
            Some(limit) if self.operations > limit => Err(PortError::InjectedFault {
                operations: limit,
            }),
            _ => Ok(()),
        }
    }

    fn registers_live(&self) -> bool {
        self.chip == MockChip::Bridged && self.connected
    }

    fn buffer_live(&self) -> bool {
        match self.chip {
            MockChip::Bridged => self.connected,
            MockChip::Direct => self.direct_synced,
            MockChip::Absent => false,
        }
    }

    fn ecp_mode(&self) -> bool {
        self.capabilities.ecp && (self.ecr & ECR_MODE_MASK) == ECR_ECP
    }

    fn address(&mut self, addr: u8) {
        self.pending = match addr {
            ADDR_BLOCK_WRITE => {
                self.buffer.clear();
                self.read_cursor = 0;
                Pending::BlockWrite
            }
            ADDR_BLOCK_READ => Pending::BlockRead,
            a if a & ADDR_WRITE != 0 => Pending::RegisterWrite(a & ADDR_REGISTER_MASK),
            a => Pending::RegisterRead(a & ADDR_REGISTER_MASK),
        };
    }

    fn data_write(&mut self, value: u8) {
        match self.pending {
            Pending::RegisterWrite(reg) if self.registers_live() => {
                self.registers[reg as usize] = value;
                self.register_log.push((reg, value));
                self.pending = Pending::None;
            }
            Pending::BlockWrite if self.buffer_live() => {
                self.buffer.push(value);
                self.block_log.push(value);
            }
            _ => {}
        }
    }

    fn data_read(&mut self) -> u8 {
        match self.pending {
            Pending::RegisterRead(reg) if self.registers_live() => {
                self.pending = Pending::None;
                self.register_queues
                    .get_mut(&reg)
                    .and_then(|q| q.pop_front())
                    .unwrap_or(self.registers[reg as usize])
            }
            Pending::BlockRead if self.buffer_live() => {
                if let Some(byte) = self.block_queue.pop_front() {
                    return byte;
                }
                let byte = self.buffer.get(self.read_cursor).copied().unwrap_or(0xFF);
                self.read_cursor += 1;
                byte
            }
            _ => 0xFF,
        }
    }

    fn record_data_lines(&mut self, value: u8) {
        self.data_latch = value;
        self.ring_ack = false;
        if self.history.len() == 9 {
            self.history.pop_front();
        }
        self.history.push_back(value);

        let tail: Vec<u8> = self.history.iter().copied().collect();
        if tail.len() == 9 && tail[..7] == HANDSHAKE_PREFIX && tail[8] == HANDSHAKE_TRAILER {
            match (tail[7], self.chip) {
                (_, MockChip::Absent) => {}
                (CMD_RING, _) => self.ring_ack = true,
                (CMD_CONNECT, _) => self.connected = true,
                (CMD_DISCONNECT, _) => {
                    self.connected = false;
                    self.pending = Pending::None;
                }
                _ => {}
            }
        }
        if self.chip == MockChip::Direct && tail.ends_with(&SYNC_MAGIC) {
            self.direct_synced = true;
        }
    }

    fn control_write(&mut self, value: u8) {
        match value {
            CTRL_ADDR => self.address(self.data_latch),
            CTRL_WRITE => self.data_write(self.data_latch),
            CTRL_NIBBLE_LO | CTRL_BYTE_READ => self.presented = self.data_read(),
            _ => {}
        }
        self.control = value;
    }

    fn status(&self) -> u8 {
        match self.control {
            CTRL_NIBBLE_LO => ((self.presented & 0x0F) << 4) | 0x08,
            CTRL_NIBBLE_HI => (self.presented & 0xF0) | 0x08,
            _ if self.ring_ack => RING_ACK | 0x07,
            _ if self.chip == MockChip::Direct && self.direct_synced => LINK_READY,
            _ => 0x78,
        }
    }

    fn ecr_read(&self) -> u8 {
        if !self.capabilities.ecp {
            return 0xFF;
        }
        let fifo = if self.control & CTRL_REVERSE != 0 {
            0
        } else {
            ECR_FIFO_EMPTY
        };
        (self.ecr & ECR_MODE_MASK) | fifo
    }
}

/// Mock port for unit testing transfer modes, probing and the link layer.
#[derive(Clone)]
pub struct MockPort {
    state: Arc<Mutex<MockState>>,
    name: String,
}

impl MockPort {
    /// Bridge-chip scanner on an EPP capable port without ECP.
    pub fn new() -> Self {
        Self::with_chip(MockChip::Bridged)
    }

    /// Direct sensor controller scanner.
    pub fn direct() -> Self {
        Self::with_chip(MockChip::Direct)
    }

    pub fn with_chip(chip: MockChip) -> Self {
        static NEXT_ID: AtomicUsize = AtomicUsize::new(0);
        Self {
            state: Arc::new(Mutex::new(MockState::new(chip))),
            name: format!("mock{}", NEXT_ID.fetch_add(1, Ordering::Relaxed)),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Set the name used as the lock key.
    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Override port features.
    pub fn with_capabilities(self, capabilities: PortCapabilities) -> Self {
        self.state().capabilities = capabilities;
        self
    }

    /// Fail every port operation after `operations` have succeeded.
    pub fn fail_after(&self, operations: usize) {
        let mut state = self.state();
        state.fail_after = Some(state.operations + operations);
    }

    /// Stop injecting faults.
    pub fn clear_fault(&self) {
        self.state().fail_after = None;
    }

    /// Flip a bit in every 32-bit EPP data write.
    pub fn corrupt_epp32(&self) {
        self.state().corrupt_epp32 = true;
    }

    /// Number of port operations performed so far.
    pub fn operations(&self) -> usize {
        self.state().operations
    }

    /// Preset a register value.
    pub fn set_register(&self, reg: u8, value: u8) {
        self.state().registers[(reg & ADDR_REGISTER_MASK) as usize] = value;
    }

    /// Current register value.
    pub fn register(&self, reg: u8) -> u8 {
        self.state().registers[(reg & ADDR_REGISTER_MASK) as usize]
    }

    /// Queue values returned by successive reads of `reg`.
    pub fn queue_register_reads(&self, reg: u8, values: &[u8]) {
        self.state()
            .register_queues
            .entry(reg & ADDR_REGISTER_MASK)
            .or_default()
            .extend(values.iter().copied());
    }

    /// Queue bytes returned by block reads before the buffer contents.
    pub fn queue_block_read(&self, data: &[u8]) {
        self.state().block_queue.extend(data.iter().copied());
    }

    /// All register writes as `(register, value)` pairs.
    pub fn register_writes(&self) -> Vec<(u8, u8)> {
        self.state().register_log.clone()
    }

    /// Values written to a single register, in order.
    pub fn writes_to(&self, reg: u8) -> Vec<u8> {
        self.state()
            .register_log
            .iter()
            .filter(|(r, _)| *r == reg)
            .map(|(_, v)| *v)
            .collect()
    }

    /// Every byte written through block transfers.
    pub fn block_writes(&self) -> Vec<u8> {
        self.state().block_log.clone()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        let mut state = self.state();
        state.register_log.clear();
        state.block_log.clear();
    }

    /// Number of extended control register writes (ECP mode switches).
    pub fn ecr_writes(&self) -> usize {
        self.state().ecr_writes
    }

    /// Whether the bridge chip is in register access mode.
    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    /// Report a busy or idle scanner through the status register.
    pub fn set_scanner_status(&self, value: u8) {
        self.set_register(REG_SCANNER_STATUS, value);
    }
}

impl Default for MockPort {
    fn default() -> Self {
        Self::new()
    }
}

impl ParallelPort for MockPort {
    fn inb(&mut self, reg: PortRegister) -> Result<u8, PortError> {
        let mut state = self.state();
        state.tick()?;
        let value = match reg {
            PortRegister::Data => {
                if state.control & CTRL_REVERSE != 0 {
                    state.presented
                } else {
                    state.data_latch
                }
            }
            PortRegister::Status => state.status(),
            PortRegister::Control => state.control,
            PortRegister::EppData if state.capabilities.epp => state.data_read(),
            PortRegister::EcpFifo if state.ecp_mode() => state.data_read(),
            PortRegister::EcpControl => state.ecr_read(),
            _ => 0xFF,
        };
        Ok(value)
    }

    fn outb(&mut self, reg: PortRegister, value: u8) -> Result<(), PortError> {
        let mut state = self.state();
        state.tick()?;
        match reg {
            PortRegister::Data if state.ecp_mode() => state.address(value),
            PortRegister::Data => state.record_data_lines(value),
            PortRegister::Control => state.control_write(value),
            PortRegister::EppAddress if state.capabilities.epp => state.address(value),
            PortRegister::EppData if state.capabilities.epp => state.data_write(value),
            PortRegister::EcpFifo if state.ecp_mode() => state.data_write(value),
            PortRegister::EcpControl if state.capabilities.ecp => {
                state.ecr = value;
                state.ecr_writes += 1;
            }
            _ => {}
        }
        Ok(())
    }

    fn inl(&mut self, reg: PortRegister) -> Result<[u8; 4], PortError> {
        let mut state = self.state();
        state.tick()?;
        let mut word = [0xFFu8; 4];
        if reg == PortRegister::EppData && state.capabilities.epp {
            for byte in word.iter_mut() {
                *byte = state.data_read();
            }
        }
        Ok(word)
    }

    fn outl(&mut self, reg: PortRegister, mut word: [u8; 4]) -> Result<(), PortError> {
        let mut state = self.state();
        state.tick()?;
        if reg == PortRegister::EppData && state.capabilities.epp {
            if state.corrupt_epp32 {
                word[0] ^= 0x01;
            }
            for byte in word {
                state.data_write(byte);
            }
        }
        Ok(())
    }

    fn capabilities(&self) -> PortCapabilities {
        self.state().capabilities
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect(port: &mut MockPort) {
        for byte in handshake_sequence(CMD_CONNECT) {
            port.outb(PortRegister::Data, byte).unwrap();
        }
    }

    #[test]
    fn test_mock_epp_register_access() {
        let mut port = MockPort::new();
        connect(&mut port);
        assert!(port.is_connected());

        port.outb(PortRegister::EppAddress, REG_VERSION).unwrap();
        assert_eq!(port.inb(PortRegister::EppData).unwrap(), ASIC_VERSION);

        port.outb(PortRegister::EppAddress, ADDR_WRITE | 0x12).unwrap();
        port.outb(PortRegister::EppData, 0x5A).unwrap();
        assert_eq!(port.register(0x12), 0x5A);
        assert_eq!(port.register_writes(), vec![(0x12, 0x5A)]);
    }

    #[test]
    fn test_mock_disconnected_bus_floats() {
        let mut port = MockPort::new();
        port.outb(PortRegister::EppAddress, REG_VERSION).unwrap();
        assert_eq!(port.inb(PortRegister::EppData).unwrap(), 0xFF);
    }

    #[test]
    fn test_mock_ring_ack() {
        let mut port = MockPort::new();
        for byte in handshake_sequence(CMD_RING) {
            port.outb(PortRegister::Data, byte).unwrap();
        }
        let status = port.inb(PortRegister::Status).unwrap();
        assert_eq!(status & STATUS_MASK, RING_ACK);
    }

    #[test]
    fn test_mock_register_queue() {
        let mut port = MockPort::new();
        connect(&mut port);
        port.queue_register_reads(0x19, &[0xC0, 0xD0]);
        for expected in [0xC0, 0xD0, LINK_READY] {
            port.outb(PortRegister::EppAddress, 0x19).unwrap();
            assert_eq!(port.inb(PortRegister::EppData).unwrap(), expected);
        }
    }

    #[test]
    fn test_mock_fault_injection() {
        let mut port = MockPort::new();
        port.fail_after(2);
        assert!(port.outb(PortRegister::Data, 0).is_ok());
        assert!(port.outb(PortRegister::Data, 0).is_ok());
        assert!(matches!(
            port.outb(PortRegister::Data, 0),
            Err(PortError::InjectedFault { .. })
        ));
        port.clear_fault();
        assert!(port.outb(PortRegister::Data, 0).is_ok());
    }

    #[test]
    fn test_mock_shares_state_between_clones() {
        let mut port = MockPort::new();
        let handle = port.clone();
        connect(&mut port);
        assert!(handle.is_connected());
        assert_eq!(handle.operations(), 9);
    }
}
