//! Per-pixel shading correction.
//!
//! Coefficients scale each sensor pixel by `c / 128`. Each pass measures
//! the white strip through the current table and moves every coefficient
//! along its own slope towards the target; a slope is damped whenever the
//! pixel's error changes sign.

use tracing::debug;

use super::{
    Calibrated, CalibrationContext, ReferenceKind, ReferenceLines, ReferenceScan,
    ReferenceSource, SHADING_UNITY,
};
use crate::error::ScanError;

/// White level after shading, before white balance.
pub const SHADING_TARGET: f64 = 240.0;
pub const SHADING_PASSES: usize = 8;
pub const MAX_MEAN_ERROR: f64 = 1.0;
pub const MAX_ERROR_VARIANCE: f64 = 3.0;
/// Slope factor applied on an error sign flip.
pub const SLOPE_DAMPING: f64 = 0.75;

/// Final coefficient table and the worst mean absolute error measured.
#[derive(Debug, Clone, PartialEq)]
pub struct ShadingTable {
    pub table: Vec<u8>,
    pub residual: f64,
}

/// Mean absolute value and variance of a set of errors.
pub fn error_stats(errors: &[f64]) -> (f64, f64) {
    if errors.is_empty() {
        return (0.0, 0.0);
    }
    let n = errors.len() as f64;
    let mean_abs = errors.iter().map(|e| e.abs()).sum::<f64>() / n;
    let mean = errors.iter().sum::<f64>() / n;
    let variance = errors.iter().map(|e| (e - mean).powi(2)).sum::<f64>() / n;
    (mean_abs, variance)
}

#[derive(Debug, Clone)]
struct PixelState {
    coefficient: f64,
    slope: Option<f64>,
    last_error: f64,
}

/// Coefficient search for the measured channels.
#[derive(Debug, Clone)]
pub struct ShadingSolver {
    width: usize,
    pixels: Vec<Vec<PixelState>>,
}

impl ShadingSolver {
    pub fn new(channels: usize, width: usize) -> Self {
        let flat = PixelState {
            coefficient: SHADING_UNITY as f64,
            slope: None,
            last_error: 0.0,
        };
        Self {
            width,
            pixels: vec![vec![flat; width]; channels],
        }
    }

    /// Upload form: three planes, gray copied into each.
    pub fn table(&self) -> Vec<u8> {
        let mut table = Vec::with_capacity(3 * self.width);
        for plane in 0..3 {
            let channel = plane.min(self.pixels.len() - 1);
            table.extend(
                self.pixels[channel]
                    .iter()
                    .map(|p| p.coefficient.round().clamp(0.0, 255.0) as u8),
            );
        }
        table
    }

    /// Move one channel's coefficients given its measured column means.
    pub fn update(&mut self, channel: usize, measured: &[f64], target: f64) {
        for (pixel, &value) in self.pixels[channel].iter_mut().zip(measured) {
            let error = target - value;
            let slope = match pixel.slope {
                None => pixel.coefficient / value.max(1.0),
                Some(slope) if error * pixel.last_error < 0.0 => slope * SLOPE_DAMPING,
                Some(slope) => slope,
            };
            pixel.slope = Some(slope);
            pixel.coefficient = (pixel.coefficient + slope * error).clamp(0.0, 255.0);
            pixel.last_error = error;
        }
    }
}

pub fn calibrate_shading<S: ReferenceSource + ?Sized>(
    source: &mut S,
    ctx: &CalibrationContext,
    gains: [u8; 3],
    offsets: [u8; 3],
) -> Result<Calibrated<ShadingTable>, ScanError> {
    let width = ctx.ccd_width;
    let mut solver = ShadingSolver::new(ctx.channels, width);
    let mut best = ShadingTable {
        table: solver.table(),
        residual: f64::INFINITY,
    };

    for pass in 1..=SHADING_PASSES {
        let scan = ReferenceScan {
            kind: ReferenceKind::White,
            channels: ctx.channels,
            x: 0,
            width,
            lines: ctx.reference_lines,
            gains,
            offsets,
            shading: Some(solver.table()),
        };
        let white: ReferenceLines = source.acquire(&scan)?;

        let mut worst: f64 = 0.0;
        let mut converged = true;
        let mut columns = Vec::with_capacity(ctx.channels);
        for channel in 0..ctx.channels {
            let target = SHADING_TARGET * ctx.white_balance(channel);
            let means = white.column_means(channel);
            let errors: Vec<f64> = means.iter().map(|v| target - v).collect();
            let (mean_abs, variance) = error_stats(&errors);
            debug!(pass, channel, mean_abs, variance, "Shading pass");
            worst = worst.max(mean_abs);
            converged &= mean_abs <= MAX_MEAN_ERROR && variance <= MAX_ERROR_VARIANCE;
            columns.push((means, target));
        }

        if worst < best.residual {
            best = ShadingTable {
                table: scan.shading.unwrap_or_default(),
                residual: worst,
            };
        }
        if converged {
            return Ok(Calibrated {
                value: best,
                converged: true,
                iterations: pass,
            });
        }
        for (channel, (means, target)) in columns.iter().enumerate() {
            solver.update(channel, means, *target);
        }
    }

    Ok(Calibrated {
        value: best,
        converged: false,
        iterations: SHADING_PASSES,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ScannerModel;

    /// White strip seen through pixels of uneven sensitivity.
    struct UnevenStrip {
        passes: usize,
    }

    fn raw_level(channel: usize, pixel: usize) -> f64 {
        200.0 + 10.0 * channel as f64 + ((pixel * 37) % 41) as f64
    }

    impl ReferenceSource for UnevenStrip {
        fn acquire(&mut self, scan: &ReferenceScan) -> Result<ReferenceLines, ScanError> {
            self.passes += 1;
            let table = scan.shading.as_ref().expect("shading table");
            let mut data = Vec::new();
            for _ in 0..scan.lines {
                for c in 0..scan.channels {
                    for i in 0..scan.width {
                        let coefficient = table[c * scan.width + i] as f64 / 128.0;
                        data.push((raw_level(c, i) * coefficient).round().min(255.0) as u8);
                    }
                }
            }
            Ok(ReferenceLines::new(scan.channels, scan.width, scan.lines, data)?)
        }
    }

    #[test]
    fn test_error_stats() {
        let (mean_abs, variance) = error_stats(&[1.0, -1.0, 3.0, -3.0]);
        assert_eq!(mean_abs, 2.0);
        assert_eq!(variance, 5.0);
        assert_eq!(error_stats(&[]), (0.0, 0.0));
    }

    #[test]
    fn test_slope_damped_on_sign_flip() {
        let mut solver = ShadingSolver::new(1, 1);
        solver.update(0, &[200.0], 240.0);
        assert_eq!(solver.table()[0], 154);
        solver.update(0, &[250.0], 240.0);
        // slope 0.64 damped to 0.48
        assert_eq!(solver.table()[0], 149);
    }

    #[test]
    fn test_shading_flattens_uneven_strip() {
        let mut ctx = CalibrationContext::new(ScannerModel::Model1220, 3);
        ctx.ccd_width = 400;
        ctx.reference_lines = 2;
        let mut source = UnevenStrip { passes: 0 };
        let result = calibrate_shading(&mut source, &ctx, [0; 3], [0; 3]).unwrap();
        assert!(result.converged);
        assert!(result.iterations <= 3);
        assert!(result.value.residual <= MAX_MEAN_ERROR);
        assert_eq!(result.value.table.len(), 1200);
        // brighter pixels get smaller coefficients
        let table = &result.value.table;
        assert!(table[0] > table[400 + 40]);
    }
}
