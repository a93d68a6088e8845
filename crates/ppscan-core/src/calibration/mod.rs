//! Photometric calibration: black offset, amplifier gain, per-pixel
//! shading.
//!
//! Each stage drives the scanner through a [`ReferenceSource`], which takes
//! reference scans of the calibration strip with given analog settings.
//! Stages that fail to converge keep their best value and report a
//! [`CalibrationError`] as a warning.

pub mod gain;
pub mod gamma;
pub mod offset;
pub mod shading;

use std::fmt;

use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::error::ScanError;
use crate::model::{AsicFamily, ScannerModel, SensorLayout};
use crate::pipeline::ManualCalibration;

pub use gamma::GammaTables;

/// Highest offset code.
pub const MAX_OFFSET_CODE: u8 = 63;
/// Neutral shading coefficient.
pub const SHADING_UNITY: u8 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationStage {
    Offset,
    Gain,
    Shading,
}

impl fmt::Display for CalibrationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalibrationStage::Offset => write!(f, "offset"),
            CalibrationStage::Gain => write!(f, "gain"),
            CalibrationStage::Shading => write!(f, "shading"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("{stage} calibration did not converge after {iterations} iterations (residual {residual:.2})")]
    NotConverged {
        stage: CalibrationStage,
        iterations: usize,
        residual: f64,
    },

    #[error("Reference scan returned {actual} bytes, expected {expected}")]
    ReferenceSize { expected: usize, actual: usize },
}

/// Outcome of one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Calibrated<T> {
    pub value: T,
    pub converged: bool,
    pub iterations: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    /// Integration gated, measures the black level.
    Dark,
    /// Lamp on the white strip.
    White,
}

/// A reference scan of the calibration strip without head motion.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceScan {
    pub kind: ReferenceKind,
    pub channels: usize,
    /// First sensor pixel at CCD resolution.
    pub x: u32,
    pub width: usize,
    pub lines: usize,
    pub gains: [u8; 3],
    pub offsets: [u8; 3],
    /// Shading coefficients (3 planes of CCD width) to apply, if any.
    pub shading: Option<Vec<u8>>,
}

/// Reference scan samples, one plane per channel on each line.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceLines {
    pub channels: usize,
    pub width: usize,
    pub lines: usize,
    pub data: Vec<u8>,
}

impl ReferenceLines {
    pub fn new(channels: usize, width: usize, lines: usize, data: Vec<u8>) -> Result<Self, CalibrationError> {
        let expected = channels * width * lines;
        if data.len() != expected {
            return Err(CalibrationError::ReferenceSize {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            channels,
            width,
            lines,
            data,
        })
    }

    fn plane(&self, line: usize, channel: usize) -> &[u8] {
        let start = (line * self.channels + channel) * self.width;
        &self.data[start..start + self.width]
    }

    /// Mean of one channel over the whole scan.
    pub fn channel_mean(&self, channel: usize) -> f64 {
        let sum: u64 = (0..self.lines)
            .flat_map(|line| self.plane(line, channel).iter())
            .map(|&v| v as u64)
            .sum();
        sum as f64 / (self.lines * self.width).max(1) as f64
    }

    /// Per-column means of one channel.
    pub fn column_means(&self, channel: usize) -> Vec<f64> {
        let mut sums = vec![0u64; self.width];
        for line in 0..self.lines {
            for (sum, &v) in sums.iter_mut().zip(self.plane(line, channel)) {
                *sum += v as u64;
            }
        }
        sums.into_iter()
            .map(|s| s as f64 / self.lines.max(1) as f64)
            .collect()
    }
}

/// Something that can take reference scans.
pub trait ReferenceSource {
    fn acquire(&mut self, scan: &ReferenceScan) -> Result<ReferenceLines, ScanError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetMethod {
    /// Two dark scans at different gains, offset solved analytically.
    TwoPoint,
    /// Walk each code down from the maximum.
    Descending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GainMethod {
    Bisection,
    LinearStep,
}

/// Per-family choice of calibration and descrambling methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FamilyStrategy {
    pub offset: OffsetMethod,
    pub gain: GainMethod,
    pub layout: SensorLayout,
}

impl FamilyStrategy {
    pub fn for_model(model: ScannerModel) -> Self {
        let (offset, gain) = match model.family() {
            AsicFamily::Bridged => (OffsetMethod::TwoPoint, GainMethod::Bisection),
            AsicFamily::Direct => (OffsetMethod::Descending, GainMethod::LinearStep),
        };
        Self {
            offset,
            gain,
            layout: model.layout(),
        }
    }
}

/// Fixed inputs of a calibration run.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationContext {
    pub model: ScannerModel,
    pub strategy: FamilyStrategy,
    pub channels: usize,
    pub reference_lines: usize,
    pub ccd_width: usize,
}

impl CalibrationContext {
    pub fn new(model: ScannerModel, channels: usize) -> Self {
        Self {
            model,
            strategy: FamilyStrategy::for_model(model),
            channels,
            reference_lines: model.reference_lines(),
            ccd_width: model.ccd_width(),
        }
    }

    pub fn family(&self) -> AsicFamily {
        self.model.family()
    }

    /// White balance factor of a measured channel. Gray reads green.
    pub fn white_balance(&self, channel: usize) -> f64 {
        let wb = self.model.white_balance();
        if self.channels == 1 { wb[1] } else { wb[channel] }
    }

    /// Centre half of the sensor, used for offset and gain.
    pub fn window(&self) -> (u32, usize) {
        ((self.ccd_width / 4) as u32, self.ccd_width / 2)
    }

    pub(crate) fn window_scan(&self, kind: ReferenceKind, gains: [u8; 3], offsets: [u8; 3]) -> ReferenceScan {
        let (x, width) = self.window();
        ReferenceScan {
            kind,
            channels: self.channels,
            x,
            width,
            lines: self.reference_lines,
            gains,
            offsets,
            shading: None,
        }
    }

    /// Spread per-measured-channel values over the three hardware slots.
    pub(crate) fn expand<T: Copy>(&self, values: &[T]) -> [T; 3] {
        if self.channels == 1 {
            [values[0]; 3]
        } else {
            [values[0], values[1], values[2]]
        }
    }
}

/// Everything uploaded to the scanner before a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationState {
    pub offsets: [u8; 3],
    pub gains: [u8; 3],
    /// Three planes of `ccd_width` coefficients, 128 = unity.
    pub shading: Vec<u8>,
    pub gamma: GammaTables,
    /// Computed (`true`) or taken from manual settings.
    pub auto: bool,
}

impl CalibrationState {
    /// Flat shading, given analog settings.
    pub fn flat(ccd_width: usize, gains: [u8; 3], offsets: [u8; 3], gamma: GammaTables) -> Self {
        Self {
            offsets,
            gains,
            shading: vec![SHADING_UNITY; 3 * ccd_width],
            gamma,
            auto: false,
        }
    }

    /// Shading coefficients followed by the gamma tables.
    pub fn upload_table(&self) -> Vec<u8> {
        let mut table = self.shading.clone();
        table.extend(self.gamma.to_bytes());
        table
    }
}

/// Run the full calibration sequence, or build the manual state.
///
/// Returns the state and the warnings of stages that did not converge.
#[instrument(level = "info", skip_all, fields(model = %ctx.model, channels = ctx.channels))]
pub fn calibrate<S: ReferenceSource + ?Sized>(
    source: &mut S,
    ctx: &CalibrationContext,
    manual: Option<ManualCalibration>,
    gamma: &GammaTables,
) -> Result<(CalibrationState, Vec<CalibrationError>), ScanError> {
    if let Some(manual) = manual {
        info!(gains = ?manual.gains, offsets = ?manual.offsets, "Manual calibration");
        let state = CalibrationState::flat(ctx.ccd_width, manual.gains, manual.offsets, gamma.clone());
        return Ok((state, Vec::new()));
    }

    let mut warnings = Vec::new();
    let mut note = |stage: CalibrationStage, iterations: usize, residual: f64| {
        let error = CalibrationError::NotConverged {
            stage,
            iterations,
            residual,
        };
        warn!(%error, "Keeping best value");
        warnings.push(error);
    };

    let offsets = offset::calibrate_offsets(source, ctx)?;
    if !offsets.converged {
        note(CalibrationStage::Offset, offsets.iterations, offsets.residual());
    }
    let gains = gain::calibrate_gains(source, ctx, offsets.value.codes)?;
    if !gains.converged {
        note(CalibrationStage::Gain, gains.iterations, gains.residual());
    }
    let shading = shading::calibrate_shading(source, ctx, gains.value.codes, offsets.value.codes)?;
    if !shading.converged {
        note(CalibrationStage::Shading, shading.iterations, shading.value.residual);
    }

    info!(
        offsets = ?offsets.value.codes,
        gains = ?gains.value.codes,
        shading_passes = shading.iterations,
        "Calibration complete"
    );
    let state = CalibrationState {
        offsets: offsets.value.codes,
        gains: gains.value.codes,
        shading: shading.value.table,
        gamma: gamma.clone(),
        auto: true,
    };
    Ok((state, warnings))
}

/// Codes chosen by the offset or gain stage, with the residual error of
/// the worst channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelCodes {
    pub codes: [u8; 3],
    pub residual: f64,
}

impl Calibrated<ChannelCodes> {
    pub fn residual(&self) -> f64 {
        self.value.residual
    }
}
