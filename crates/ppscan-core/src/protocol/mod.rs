//! Scanner command protocol: framing, escaping, status handling.

pub mod constants;
pub mod escape;
pub mod frame;
pub mod link;
pub mod status;

use thiserror::Error;

use crate::transport::TransportError;

pub use frame::{CommandFrame, Direction, FrameHeader, SyncOp};
pub use link::{Link, LinkPhase, LinkWarning, ScannerLink};
pub use status::{LinkStatus, classify};

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Sync handshake failed after {attempts} attempts")]
    SyncExhausted { attempts: usize },

    #[error("Scanner did not become ready after {polls} status polls")]
    StatusTimeout { polls: usize },

    #[error("Length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Block read back from channel 0x{channel:02X} differs from the one written")]
    ReadbackMismatch { channel: u8 },

    #[error("Frame body of {length} bytes exceeds the header limit")]
    FrameTooLarge { length: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
