//! Link state machine: sync, header, body, status poll.
//!
//! The bridged chip carries the sync magic and headers through its link
//! data register and reports link status in a register. The direct chip
//! takes everything as one serial stream and answers on the status lines.

use std::fmt;

use tracing::{debug, trace, warn};

use super::ProtocolError;
use super::constants::*;
use super::escape::Decoder;
use super::frame::{CommandFrame, FrameHeader, SyncOp};
use super::status::{LinkStatus, classify};
use crate::model::AsicFamily;
use crate::port::ParallelPort;
use crate::transport::signals::STATUS_MASK;
use crate::transport::{Attempt, Transport, retry_with_limit};

/// Phase of the frame currently on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkPhase {
    #[default]
    Idle,
    Syncing,
    Header,
    Body,
    StatusPoll,
    Done,
}

impl fmt::Display for LinkPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkPhase::Idle => write!(f, "IDLE"),
            LinkPhase::Syncing => write!(f, "SYNCING"),
            LinkPhase::Header => write!(f, "HEADER"),
            LinkPhase::Body => write!(f, "BODY"),
            LinkPhase::StatusPoll => write!(f, "STATUS_POLL"),
            LinkPhase::Done => write!(f, "DONE"),
        }
    }
}

/// A status byte that matched no known pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkWarning {
    pub phase: LinkPhase,
    pub raw: u8,
    /// What the byte was treated as.
    pub resolved: LinkStatus,
}

impl fmt::Display for LinkWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unexpected status 0x{:02X} during {}, treated as {}",
            self.raw, self.phase, self.resolved
        )
    }
}

/// Command-level access to a scanner.
///
/// Implemented by [`Link`] over a real or mock port; session and pipeline
/// code only talks to this trait.
pub trait ScannerLink {
    /// Chip family on the other end.
    fn family(&self) -> AsicFamily;

    /// Send a block on `channel`.
    fn cmd_set(&mut self, channel: u8, data: &[u8]) -> Result<(), ProtocolError>;

    /// Read exactly `len` bytes from `channel`.
    fn cmd_get(&mut self, channel: u8, len: usize) -> Result<Vec<u8>, ProtocolError>;

    /// Bulk read split into frames of at most one block. Returns fewer than
    /// `len` bytes when the scanner reports the end of the transfer early.
    fn cmd_get_buffer(&mut self, channel: u8, len: usize) -> Result<Vec<u8>, ProtocolError>;

    /// Send a zero-length state-transition frame.
    fn cmd_sync(&mut self, op: SyncOp) -> Result<(), ProtocolError>;

    /// Raw scanner status byte (`MOTOR_BIT`, `ASIC_BIT`).
    fn scanner_status(&mut self) -> Result<u8, ProtocolError>;

    /// Drain status mismatches recorded since the last call.
    fn take_warnings(&mut self) -> Vec<LinkWarning>;
}

/// Protocol state machine over a transport.
pub struct Link<P: ParallelPort> {
    transport: Transport<P>,
    family: AsicFamily,
    phase: LinkPhase,
    block_limit: usize,
    warnings: Vec<LinkWarning>,
}

impl<P: ParallelPort> Link<P> {
    pub fn new(transport: Transport<P>, family: AsicFamily) -> Self {
        Self {
            transport,
            family,
            phase: LinkPhase::Idle,
            block_limit: BLOCK_LIMIT,
            warnings: Vec::new(),
        }
    }

    /// Override the per-frame body limit of buffer reads.
    pub fn with_block_limit(mut self, limit: usize) -> Self {
        self.block_limit = limit.max(1);
        self
    }

    pub fn phase(&self) -> LinkPhase {
        self.phase
    }

    pub fn transport(&self) -> &Transport<P> {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut Transport<P> {
        &mut self.transport
    }

    fn goto(&mut self, phase: LinkPhase) {
        trace!(from = %self.phase, to = %phase, "Link phase");
        self.phase = phase;
    }

    fn read_status_byte(&mut self) -> Result<u8, ProtocolError> {
        Ok(match self.family {
            AsicFamily::Bridged => self.transport.read_register(REG_LINK_STATUS)?,
            AsicFamily::Direct => self.transport.raw_status()? & STATUS_MASK,
        })
    }

    fn poll_status(&mut self) -> Result<LinkStatus, ProtocolError> {
        let raw = self.read_status_byte()?;
        let classified = classify(raw);
        if !classified.exact {
            let warning = LinkWarning {
                phase: self.phase,
                raw,
                resolved: classified.status,
            };
            warn!(
                phase = %self.phase,
                raw = format!("0x{:02X}", raw),
                resolved = %classified.status,
                "Unexpected link status"
            );
            self.warnings.push(warning);
        }
        Ok(classified.status)
    }

    /// Poll until ready. `false` means the scanner asked for a retry or
    /// never became ready.
    fn await_ready(&mut self, limit: usize) -> Result<bool, ProtocolError> {
        let ready = retry_with_limit(limit, |_| {
            Ok::<_, ProtocolError>(match self.poll_status()? {
                LinkStatus::Ready => Attempt::Done(true),
                LinkStatus::Retry => Attempt::Done(false),
                LinkStatus::Busy => Attempt::Retry,
            })
        })?;
        Ok(ready.unwrap_or(false))
    }

    fn send_magic(&mut self) -> Result<(), ProtocolError> {
        match self.family {
            AsicFamily::Bridged => {
                for byte in SYNC_MAGIC {
                    self.transport.write_register(REG_LINK_DATA, byte)?;
                }
            }
            AsicFamily::Direct => self.transport.send_handshake(&SYNC_MAGIC)?,
        }
        Ok(())
    }

    fn send_header(&mut self, header: FrameHeader) -> Result<(), ProtocolError> {
        let bytes = header.to_bytes();
        match self.family {
            AsicFamily::Bridged => {
                for byte in bytes {
                    self.transport.write_register(REG_LINK_DATA, byte)?;
                }
            }
            AsicFamily::Direct => self.transport.write_block(&bytes)?,
        }
        Ok(())
    }

    /// Sync and send the header, resyncing when either is not acknowledged.
    fn open_frame(&mut self, header: FrameHeader) -> Result<(), ProtocolError> {
        for attempt in 1..=RESYNC_LIMIT {
            self.goto(LinkPhase::Syncing);
            self.send_magic()?;
            if !self.await_ready(SYNC_POLL_LIMIT)? {
                debug!(attempt, "Sync not acknowledged, resyncing");
                continue;
            }

            self.goto(LinkPhase::Header);
            self.send_header(header)?;
            if self.await_ready(SYNC_POLL_LIMIT)? {
                return Ok(());
            }
            debug!(
                attempt,
                opcode = format!("0x{:02X}", header.opcode),
                "Header not acknowledged, resyncing"
            );
        }
        self.goto(LinkPhase::Idle);
        Err(ProtocolError::SyncExhausted {
            attempts: RESYNC_LIMIT,
        })
    }

    fn write_body(&mut self, frame: &CommandFrame) -> Result<(), ProtocolError> {
        if frame.length == 0 {
            return Ok(());
        }
        self.goto(LinkPhase::Body);
        self.transport.write_block(&frame.wire_body())?;
        Ok(())
    }

    fn read_body(&mut self, len: usize) -> Result<Vec<u8>, ProtocolError> {
        self.goto(LinkPhase::Body);
        let mut decoder = Decoder::new();
        let mut body = Vec::with_capacity(len);
        while body.len() < len {
            // A held escape pair decodes to two bytes from one more raw byte.
            let want = (len - body.len()).saturating_sub(decoder.held().saturating_sub(1));
            if want == 0 {
                break;
            }
            let raw = self.transport.read_block(want)?;
            decoder.push(&raw, &mut body);
        }
        if body.len() != len || decoder.held() != 0 {
            return Err(ProtocolError::LengthMismatch {
                expected: len,
                actual: body.len() + decoder.held(),
            });
        }
        Ok(body)
    }

    fn finish_frame(&mut self, limit: usize) -> Result<(), ProtocolError> {
        self.goto(LinkPhase::StatusPoll);
        let done = retry_with_limit(limit, |_| {
            Ok::<_, ProtocolError>(match self.poll_status()? {
                LinkStatus::Ready => Attempt::Done(()),
                LinkStatus::Busy | LinkStatus::Retry => Attempt::Retry,
            })
        })?;
        match done {
            Some(()) => {
                self.goto(LinkPhase::Done);
                Ok(())
            }
            None => {
                self.goto(LinkPhase::Idle);
                Err(ProtocolError::StatusTimeout { polls: limit })
            }
        }
    }
}

impl<P: ParallelPort> ScannerLink for Link<P> {
    fn family(&self) -> AsicFamily {
        self.family
    }

    fn cmd_set(&mut self, channel: u8, data: &[u8]) -> Result<(), ProtocolError> {
        let frame = CommandFrame::write(channel, data)?;
        debug!(channel = format!("0x{:02X}", channel), len = data.len(), "cmd_set");
        self.open_frame(frame.header(self.family))?;
        self.write_body(&frame)?;
        self.finish_frame(STATUS_POLL_LIMIT)
    }

    fn cmd_get(&mut self, channel: u8, len: usize) -> Result<Vec<u8>, ProtocolError> {
        let frame = CommandFrame::read(channel, len)?;
        debug!(channel = format!("0x{:02X}", channel), len, "cmd_get");
        self.open_frame(frame.header(self.family))?;
        let body = self.read_body(len)?;
        self.finish_frame(STATUS_POLL_LIMIT)?;
        Ok(body)
    }

    fn cmd_get_buffer(&mut self, channel: u8, len: usize) -> Result<Vec<u8>, ProtocolError> {
        debug!(channel = format!("0x{:02X}", channel), len, "cmd_get_buffer");
        let mut data = Vec::with_capacity(len);
        while data.len() < len {
            let piece = (len - data.len()).min(self.block_limit);
            let frame = CommandFrame::read(channel, piece)?;
            self.open_frame(frame.header(self.family))?;
            let body = self.read_body(piece)?;
            data.extend_from_slice(&body);

            if data.len() == len {
                self.finish_frame(STATUS_POLL_LIMIT)?;
                break;
            }
            self.goto(LinkPhase::StatusPoll);
            if self.poll_status()? == LinkStatus::Ready {
                debug!(requested = len, delivered = data.len(), "Scanner ended the transfer");
                self.goto(LinkPhase::Done);
                break;
            }
        }
        Ok(data)
    }

    fn cmd_sync(&mut self, op: SyncOp) -> Result<(), ProtocolError> {
        let frame = CommandFrame::sync(op);
        debug!(op = %op, "cmd_sync");
        self.open_frame(frame.header(self.family))?;
        let limit = match op {
            SyncOp::Commit => COMMIT_POLL_LIMIT,
            SyncOp::Continue | SyncOp::Halt => STATUS_POLL_LIMIT,
        };
        self.finish_frame(limit)
    }

    fn scanner_status(&mut self) -> Result<u8, ProtocolError> {
        match self.family {
            AsicFamily::Bridged => Ok(self.transport.read_register(REG_SCANNER_STATUS)?),
            AsicFamily::Direct => {
                let block = self.cmd_get(CMD_MOTOR, MOTOR_BLOCK_LEN)?;
                Ok(block[MOTOR_BLOCK_LEN - 1])
            }
        }
    }

    fn take_warnings(&mut self) -> Vec<LinkWarning> {
        std::mem::take(&mut self.warnings)
    }
}

impl<L: ScannerLink + ?Sized> ScannerLink for Box<L> {
    fn family(&self) -> AsicFamily {
        (**self).family()
    }

    fn cmd_set(&mut self, channel: u8, data: &[u8]) -> Result<(), ProtocolError> {
        (**self).cmd_set(channel, data)
    }

    fn cmd_get(&mut self, channel: u8, len: usize) -> Result<Vec<u8>, ProtocolError> {
        (**self).cmd_get(channel, len)
    }

    fn cmd_get_buffer(&mut self, channel: u8, len: usize) -> Result<Vec<u8>, ProtocolError> {
        (**self).cmd_get_buffer(channel, len)
    }

    fn cmd_sync(&mut self, op: SyncOp) -> Result<(), ProtocolError> {
        (**self).cmd_sync(op)
    }

    fn scanner_status(&mut self) -> Result<u8, ProtocolError> {
        (**self).scanner_status()
    }

    fn take_warnings(&mut self) -> Vec<LinkWarning> {
        (**self).take_warnings()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::MockPort;
    use crate::protocol::escape;
    use crate::transport::TransportMode;
    use crate::transport::signals::{CMD_CONNECT, handshake_sequence};

    fn bridged_link() -> (Link<MockPort>, MockPort) {
        let mock = MockPort::new();
        let mut transport = Transport::new(mock.clone(), TransportMode::Epp8);
        transport
            .send_handshake(&handshake_sequence(CMD_CONNECT))
            .unwrap();
        (Link::new(transport, AsicFamily::Bridged), mock)
    }

    fn direct_link() -> (Link<MockPort>, MockPort) {
        let mock = MockPort::direct();
        let transport = Transport::new(mock.clone(), TransportMode::Epp8);
        (Link::new(transport, AsicFamily::Direct), mock)
    }

    #[test]
    fn test_bridged_frame_on_the_wire() {
        let (mut link, mock) = bridged_link();
        link.cmd_set(CMD_FILTER, &[0x01, 0x1B, 0x55, 0xAA]).unwrap();

        assert_eq!(
            mock.writes_to(REG_LINK_DATA),
            vec![0x55, 0xAA, 0x00, 0x00, 0x04, 0xA0]
        );
        assert_eq!(
            mock.block_writes(),
            vec![0x01, 0x1B, 0x1B, 0x1B, 0x55, 0xAA]
        );
        assert_eq!(link.phase(), LinkPhase::Done);
        assert!(link.take_warnings().is_empty());
    }

    #[test]
    fn test_bridged_get_decodes_body() {
        let (mut link, _mock) = bridged_link();
        let data = [0x1B, 0x1B, 0x55, 0xAA, 0x07, 0x55];
        link.cmd_set(CMD_FILTER, &data).unwrap();
        assert_eq!(link.cmd_get(CMD_FILTER, data.len()).unwrap(), data);
    }

    #[test]
    fn test_sync_frame_header() {
        let (mut link, mock) = bridged_link();
        link.cmd_sync(SyncOp::Continue).unwrap();
        assert_eq!(
            mock.writes_to(REG_LINK_DATA),
            vec![0x55, 0xAA, 0x00, 0x00, 0x00, 0xC2]
        );
        assert!(mock.block_writes().is_empty());
    }

    #[test]
    fn test_retry_status_triggers_resync() {
        let (mut link, mock) = bridged_link();
        mock.queue_register_reads(REG_LINK_STATUS, &[0xD8]);
        link.cmd_sync(SyncOp::Halt).unwrap();
        assert_eq!(
            mock.writes_to(REG_LINK_DATA),
            vec![0x55, 0xAA, 0x55, 0xAA, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_unknown_status_is_a_warning() {
        let (mut link, mock) = bridged_link();
        mock.queue_register_reads(REG_LINK_STATUS, &[0xC8, 0xC8, 0xE0]);
        link.cmd_sync(SyncOp::Commit).unwrap();
        let warnings = link.take_warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].raw, 0xE0);
        assert_eq!(warnings[0].phase, LinkPhase::StatusPoll);
        assert_eq!(warnings[0].resolved, LinkStatus::Busy);
        assert!(link.take_warnings().is_empty());
    }

    #[test]
    fn test_sync_exhaustion() {
        let (mut link, mock) = bridged_link();
        mock.set_register(REG_LINK_STATUS, 0xD8);
        assert!(matches!(
            link.cmd_sync(SyncOp::Halt),
            Err(ProtocolError::SyncExhausted { attempts: RESYNC_LIMIT })
        ));
        assert_eq!(mock.writes_to(REG_LINK_DATA).len(), 2 * RESYNC_LIMIT);
    }

    #[test]
    fn test_status_poll_timeout() {
        let (mut link, mock) = bridged_link();
        let mut statuses = vec![0xC8, 0xC8];
        statuses.extend(std::iter::repeat_n(0xC0, STATUS_POLL_LIMIT));
        mock.queue_register_reads(REG_LINK_STATUS, &statuses);
        assert!(matches!(
            link.cmd_sync(SyncOp::Continue),
            Err(ProtocolError::StatusTimeout { .. })
        ));
    }

    #[test]
    fn test_buffer_read_is_chunked_and_may_end_early() {
        let (link, mock) = bridged_link();
        let mut link = link.with_block_limit(4);
        mock.queue_block_read(&[1, 2, 3, 4, 5, 6, 7, 8]);
        // piece 1: sync, header, busy; piece 2: sync, header, ready
        mock.queue_register_reads(REG_LINK_STATUS, &[0xC8, 0xC8, 0xD0, 0xC8, 0xC8, 0xC8]);
        let data = link.cmd_get_buffer(CMD_DATA, 12).unwrap();
        assert_eq!(data, vec![1, 2, 3, 4, 5, 6, 7, 8]);

        let headers = mock.writes_to(REG_LINK_DATA);
        assert_eq!(&headers[2..6], &[0x00, 0x00, 0x04, 0xC4]);
    }

    #[test]
    fn test_read_length_mismatch_is_an_error() {
        let (mut link, mock) = bridged_link();
        // An escape pair that would decode past the requested length.
        mock.queue_block_read(&[0x09, 0x1B, 0x55, 0xAA]);
        assert!(matches!(
            link.cmd_get(CMD_MOTOR, 2),
            Err(ProtocolError::LengthMismatch { expected: 2, .. })
        ));
    }

    #[test]
    fn test_direct_stream_framing() {
        let (mut link, mock) = direct_link();
        link.cmd_set(CMD_MOTOR, &[0x55, 0xAA, 0x10]).unwrap();
        assert_eq!(
            mock.block_writes(),
            vec![0x00, 0x00, 0x03, 0x02, 0x1B, 0x55, 0xAA, 0x10]
        );

        let mut block = [0u8; MOTOR_BLOCK_LEN];
        block[MOTOR_BLOCK_LEN - 1] = MOTOR_BIT;
        block[3] = 0x1B;
        mock.clear_writes();
        mock.queue_block_read(&escape::encode(&block));
        assert_eq!(link.scanner_status().unwrap(), MOTOR_BIT);
        assert_eq!(mock.block_writes(), vec![0x00, 0x00, 0x10, 0x82]);
    }
}
