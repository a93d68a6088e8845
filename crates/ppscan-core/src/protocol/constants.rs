//! Wire constants of the scanner command protocol.

// ============================================================================
// ASIC registers (bridged family)
// ============================================================================

/// Chip version register.
pub const REG_VERSION: u8 = 0x0B;
/// Value of `REG_VERSION` on the bridge chip.
pub const ASIC_VERSION: u8 = 0xC7;
/// Link handshake status register.
pub const REG_LINK_STATUS: u8 = 0x19;
/// Scanner status register (motor / ASIC busy bits).
pub const REG_SCANNER_STATUS: u8 = 0x1A;
/// Link data register: sync magic and frame headers go through here.
pub const REG_LINK_DATA: u8 = 0x1C;

// ============================================================================
// Framing
// ============================================================================

/// Sync magic preceding every frame.
pub const SYNC_MAGIC: [u8; 2] = [0x55, 0xAA];
/// Escape byte inside frame bodies.
pub const ESCAPE: u8 = 0x1B;
/// Header size: 3-byte big-endian length + opcode.
pub const HEADER_SIZE: usize = 4;
/// Largest length a header can carry.
pub const MAX_FRAME_LEN: usize = 0xFF_FFFF;

/// Opcode channel mask.
pub const OPCODE_CHANNEL_MASK: u8 = 0x3F;
/// Bridged family: host-to-scanner transfer.
pub const OPCODE_WRITE: u8 = 0x80;
/// Bridged family: scanner-to-host transfer.
pub const OPCODE_READ: u8 = 0xC0;
/// Direct family: read flag inside the opcode.
pub const DIRECT_READ_FLAG: u8 = 0x80;

// ============================================================================
// Link status
// ============================================================================

/// Idle, ready for the next phase.
pub const LINK_READY: u8 = 0xC8;
/// Busy, more data expected.
pub const LINK_BUSY: u8 = 0xC0;
/// Busy with data pending.
pub const LINK_BUSY_DATA: u8 = 0xD0;
/// Retry requested.
pub const LINK_RETRY_BIT: u8 = 0x08;

// ============================================================================
// Sync operations (zero-length frames)
// ============================================================================

pub const SYNC_CONTINUE: u8 = 0xC2;
pub const SYNC_HALT: u8 = 0x00;
pub const SYNC_COMMIT: u8 = 0x40;

// ============================================================================
// Command channels
// ============================================================================

/// CCD window: geometry, resolution, gains and offsets.
pub const CMD_CCD: u8 = 0x01;
/// Motor: moves, scan motion, lamp and status.
pub const CMD_MOTOR: u8 = 0x02;
/// Pixel data.
pub const CMD_DATA: u8 = 0x04;
/// Shading coefficients followed by the gamma tables.
pub const CMD_SHADING: u8 = 0x08;
/// Sensor exposure.
pub const CMD_EXPOSURE: u8 = 0x10;
/// Image filter block.
pub const CMD_FILTER: u8 = 0x20;

pub const CCD_BLOCK_LEN: usize = 36;
pub const MOTOR_BLOCK_LEN: usize = 16;
pub const EXPOSURE_BLOCK_LEN: usize = 8;
pub const FILTER_BLOCK_LEN: usize = 8;

// ============================================================================
// Scanner status bits
// ============================================================================

/// Motor idle / head at rest.
pub const MOTOR_BIT: u8 = 0x40;
/// ASIC busy.
pub const ASIC_BIT: u8 = 0x10;
/// Lamp on (motor block byte 14).
pub const LAMP_BIT: u8 = 0x20;

// ============================================================================
// Limits
// ============================================================================

/// Resync attempts before a frame is declared failed.
pub const RESYNC_LIMIT: usize = 16;
/// Status reads per sync attempt.
pub const SYNC_POLL_LIMIT: usize = 8;
/// Status reads at the end of a frame.
pub const STATUS_POLL_LIMIT: usize = 256;
/// Status reads after a commit sync.
pub const COMMIT_POLL_LIMIT: usize = 1024;
/// Largest body moved by one frame of a buffer read.
pub const BLOCK_LIMIT: usize = 0x8000;
