//! Line-level constants shared by every transfer mode.

// ============================================================================
// ASIC address byte
// ============================================================================

/// Register number mask in an address byte.
pub const ADDR_REGISTER_MASK: u8 = 0x3F;
/// Address byte flag: the following data cycle writes the register.
pub const ADDR_WRITE: u8 = 0x40;
/// Address byte selecting a block (buffer) read.
pub const ADDR_BLOCK_READ: u8 = 0x80;
/// Address byte selecting a block (buffer) write.
pub const ADDR_BLOCK_WRITE: u8 = 0xC0;

// ============================================================================
// Control lines (SPP / PS2 / byte handshakes)
// ============================================================================

/// nINIT high, everything else released.
pub const CTRL_IDLE: u8 = 0x04;
/// Strobe: latch the data lines as a data byte.
pub const CTRL_WRITE: u8 = 0x05;
/// Autofeed: latch the data lines as an address byte.
pub const CTRL_ADDR: u8 = 0x06;
/// Select-in: present the low nibble of the next byte on the status lines.
pub const CTRL_NIBBLE_LO: u8 = 0x0C;
/// Select-in + autofeed: present the high nibble of the current byte.
pub const CTRL_NIBBLE_HI: u8 = 0x0E;
/// Data direction bit (reverse = peripheral drives the data lines).
pub const CTRL_REVERSE: u8 = 0x20;
/// Reverse + strobe: present the next byte on the data lines.
pub const CTRL_BYTE_READ: u8 = CTRL_REVERSE | CTRL_WRITE;

// ============================================================================
// ECP extended control register
// ============================================================================

/// ECR mode field mask.
pub const ECR_MODE_MASK: u8 = 0xE0;
/// ECR PS2 (bidirectional) mode, used between block transfers.
pub const ECR_PS2: u8 = 0x20;
/// ECR ECP FIFO mode.
pub const ECR_ECP: u8 = 0x60;
/// ECR status: FIFO empty.
pub const ECR_FIFO_EMPTY: u8 = 0x01;
/// ECR status: FIFO full.
pub const ECR_FIFO_FULL: u8 = 0x02;

// ============================================================================
// Handshakes
// ============================================================================

/// Prefix shared by ring and connect sequences on the data lines.
pub const HANDSHAKE_PREFIX: [u8; 7] = [0x22, 0xAA, 0x55, 0x00, 0xFF, 0x87, 0x78];
/// Trailer closing a handshake sequence.
pub const HANDSHAKE_TRAILER: u8 = 0xFF;
/// Switch the bridge chip into register access mode.
pub const CMD_CONNECT: u8 = 0xE0;
/// Leave register access mode.
pub const CMD_DISCONNECT: u8 = 0x30;
/// Presence ring.
pub const CMD_RING: u8 = 0x08;

/// Status lines pattern answering a ring.
pub const RING_ACK: u8 = 0x38;
/// Status lines mask used for every handshake comparison.
pub const STATUS_MASK: u8 = 0xF8;

/// Build a complete handshake sequence for `cmd`.
pub fn handshake_sequence(cmd: u8) -> [u8; 9] {
    let mut seq = [0u8; 9];
    seq[..7].copy_from_slice(&HANDSHAKE_PREFIX);
    seq[7] = cmd;
    seq[8] = HANDSHAKE_TRAILER;
    seq
}

// ============================================================================
// Limits
// ============================================================================

/// Bound on FIFO empty/full polling loops.
pub const FIFO_WAIT_LIMIT: usize = 1000;
