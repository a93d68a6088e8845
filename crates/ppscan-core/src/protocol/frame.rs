//! Command frames and their headers.

use std::fmt;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use std::io::Cursor;

use super::ProtocolError;
use super::constants::*;
use super::escape;
use crate::model::AsicFamily;

/// Zero-length frames used as state-transition triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOp {
    /// Keep the current operation going (also the keep-alive between data chunks).
    Continue,
    /// Halt and reset the command engine.
    Halt,
    /// Commit the uploaded blocks and start executing them.
    Commit,
}

impl SyncOp {
    pub fn code(self) -> u8 {
        match self {
            SyncOp::Continue => SYNC_CONTINUE,
            SyncOp::Halt => SYNC_HALT,
            SyncOp::Commit => SYNC_COMMIT,
        }
    }
}

impl fmt::Display for SyncOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOp::Continue => write!(f, "CONTINUE"),
            SyncOp::Halt => write!(f, "HALT"),
            SyncOp::Commit => write!(f, "COMMIT"),
        }
    }
}

/// Transfer direction of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Write,
    Read,
    Sync(SyncOp),
}

/// Frame header: 24-bit big-endian body length and an opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub opcode: u8,
}

impl FrameHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        BigEndian::write_u24(&mut buf[..3], self.length);
        buf[3] = self.opcode;
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::LengthMismatch {
                expected: HEADER_SIZE,
                actual: data.len(),
            });
        }
        let mut cursor = Cursor::new(data);
        let length = cursor.read_u24::<BigEndian>()?;
        let opcode = cursor.read_u8()?;
        Ok(Self { length, opcode })
    }
}

/// One exchange with the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    /// Logical channel (`CMD_*`).
    pub channel: u8,
    pub direction: Direction,
    /// Unescaped body length.
    pub length: usize,
    /// Unescaped body for writes, empty otherwise.
    pub payload: Vec<u8>,
}

impl CommandFrame {
    pub fn write(channel: u8, payload: &[u8]) -> Result<Self, ProtocolError> {
        Self::check_length(payload.len())?;
        Ok(Self {
            channel,
            direction: Direction::Write,
            length: payload.len(),
            payload: payload.to_vec(),
        })
    }

    pub fn read(channel: u8, length: usize) -> Result<Self, ProtocolError> {
        Self::check_length(length)?;
        Ok(Self {
            channel,
            direction: Direction::Read,
            length,
            payload: Vec::new(),
        })
    }

    pub fn sync(op: SyncOp) -> Self {
        Self {
            channel: op.code(),
            direction: Direction::Sync(op),
            length: 0,
            payload: Vec::new(),
        }
    }

    fn check_length(length: usize) -> Result<(), ProtocolError> {
        if length > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge { length });
        }
        Ok(())
    }

    /// Opcode byte for the given chip family.
    ///
    /// The bridged chip flags the direction in the two high bits; the direct
    /// chip only flags reads.
    pub fn opcode(&self, family: AsicFamily) -> u8 {
        match (self.direction, family) {
            (Direction::Sync(op), _) => op.code(),
            (Direction::Write, AsicFamily::Bridged) => {
                (self.channel & OPCODE_CHANNEL_MASK) | OPCODE_WRITE
            }
            (Direction::Read, AsicFamily::Bridged) => {
                (self.channel & OPCODE_CHANNEL_MASK) | OPCODE_READ
            }
            (Direction::Write, AsicFamily::Direct) => self.channel & !DIRECT_READ_FLAG,
            (Direction::Read, AsicFamily::Direct) => self.channel | DIRECT_READ_FLAG,
        }
    }

    pub fn header(&self, family: AsicFamily) -> FrameHeader {
        FrameHeader {
            length: self.length as u32,
            opcode: self.opcode(family),
        }
    }

    /// Escaped body as it goes on the wire.
    pub fn wire_body(&self) -> Vec<u8> {
        escape::encode(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_is_big_endian() {
        let header = FrameHeader {
            length: 0x012345,
            opcode: 0x82,
        };
        assert_eq!(header.to_bytes(), [0x01, 0x23, 0x45, 0x82]);
        assert_eq!(FrameHeader::from_bytes(&header.to_bytes()).unwrap(), header);
        assert!(FrameHeader::from_bytes(&[0x00, 0x01]).is_err());
    }

    #[test]
    fn test_opcodes_per_family() {
        let write = CommandFrame::write(CMD_MOTOR, &[0; 16]).unwrap();
        let read = CommandFrame::read(CMD_MOTOR, 16).unwrap();
        assert_eq!(write.opcode(AsicFamily::Bridged), 0x82);
        assert_eq!(read.opcode(AsicFamily::Bridged), 0xC2);
        assert_eq!(write.opcode(AsicFamily::Direct), 0x02);
        assert_eq!(read.opcode(AsicFamily::Direct), 0x82);

        let sync = CommandFrame::sync(SyncOp::Commit);
        assert_eq!(sync.header(AsicFamily::Bridged).to_bytes(), [0, 0, 0, 0x40]);
        assert_eq!(sync.header(AsicFamily::Direct).to_bytes(), [0, 0, 0, 0x40]);
    }

    #[test]
    fn test_frame_length_limit() {
        assert!(matches!(
            CommandFrame::read(CMD_DATA, MAX_FRAME_LEN + 1),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
        assert!(CommandFrame::read(CMD_DATA, MAX_FRAME_LEN).is_ok());
    }

    #[test]
    fn test_header_length_counts_unescaped_bytes() {
        let frame = CommandFrame::write(CMD_FILTER, &[0x1B, 0x55, 0xAA]).unwrap();
        assert_eq!(frame.header(AsicFamily::Bridged).length, 3);
        assert_eq!(frame.wire_body(), vec![0x1B, 0x1B, 0x1B, 0x55, 0xAA]);
    }
}
