//! Crate-level error aggregate.

use thiserror::Error;

use crate::calibration::CalibrationError;
use crate::port::PortError;
use crate::protocol::ProtocolError;
use crate::session::SessionState;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Port error: {0}")]
    Port(#[from] PortError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Calibration error: {0}")]
    Calibration(#[from] CalibrationError),

    #[error("Scan aborted: {reason}")]
    ScanAborted { reason: String },

    #[error("No supported scanner detected: {reason}")]
    ModelDetection { reason: String },

    #[error("Invalid scan request: {0}")]
    InvalidRequest(String),

    #[error("{operation} is not allowed while the session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
}
