//! ppscan-core: driver for parallel-port CCD flatbed scanners in Rust.
//!
//! This crate talks to the Astra 610P/1220P/1600P/2000P family over a PC
//! parallel port, from raw port registers up to calibrated image lines.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Port**: Register access (ppdev, direct I/O, mock) and port locking
//! - **Transport**: SPP/EPP/ECP byte movers and the handshake sequence
//! - **Protocol**: Escaping, command frames and the link state machine
//! - **Probe**: Chip detection and transfer mode selection
//! - **Connection**: An attached, probed scanner holding its port lock
//! - **Calibration**: Offset, gain, shading and gamma
//! - **Pipeline**: Scan geometry, descrambling, scaling and lineart
//! - **Session**: Head motion, lamp and the scan state machine
//! - **Events**: Observer pattern for UI decoupling
//!
//! # Example
//!
//! ```no_run
//! use ppscan_core::{ColorMode, Connection, DriverConfig, ScanRequest, Session};
//!
//! let config = DriverConfig::default();
//! let connection = Connection::attach_with(&config).expect("no scanner");
//! let mut session = Session::open(connection).expect("init failed");
//!
//! let request = ScanRequest::new(0, 0, 1275, 1750, 150, ColorMode::Gray);
//! let params = session.start_scan(&request).expect("start failed");
//! let mut image = Vec::new();
//! while image.len() < params.bytes_per_line * params.target_height {
//!     let block = session.read_block(1 << 16, 1275, 150, false).expect("read failed");
//!     image.extend(block);
//! }
//! session.close().expect("close failed");
//! ```

pub mod calibration;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod model;
pub mod pipeline;
pub mod port;
pub mod probe;
pub mod protocol;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod sim;

// Re-exports for convenience
pub use calibration::{CalibrationError, CalibrationState, GammaTables};
pub use config::DriverConfig;
pub use connection::Connection;
pub use error::ScanError;
pub use events::{NullObserver, RecordingObserver, ScanEvent, ScanObserver, TracingObserver};
pub use model::{AsicFamily, ScannerModel, SensorLayout};
pub use pipeline::{ColorMode, ScanParameters, ScanRequest};
pub use port::{ParallelPort, PortError, PortSpec};
pub use probe::{ProbeOptions, ProbeReport};
pub use protocol::{ProtocolError, ScannerLink};
pub use session::{CancelToken, ScannerStatus, Session, SessionOptions, SessionState};
pub use transport::{TransportError, TransportMode};
