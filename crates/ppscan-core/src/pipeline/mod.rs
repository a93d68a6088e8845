//! Scan geometry, command blocks and image data processing.

pub mod commands;
pub mod descramble;
pub mod geometry;
pub mod lineart;
pub mod reader;
pub mod scaling;

pub use commands::{CcdWindow, DEFAULT_FILTER, ExposureSettings, MotorCommand};
pub use descramble::{Descrambler, RawFormat};
pub use geometry::{
    ColorMode, LineartParams, ManualCalibration, ScanGeometry, ScanParameters, ScanRequest,
};
pub use reader::ScanPipeline;
