//! Black level offset calibration.

use tracing::debug;

use super::gain::gain_multiplier;
use super::{
    Calibrated, CalibrationContext, ChannelCodes, MAX_OFFSET_CODE, OffsetMethod, ReferenceKind,
    ReferenceSource,
};
use crate::error::ScanError;

/// Gain codes of the two dark scans of the two-point method.
pub const TWO_POINT_GAINS: (u8, u8) = (0, 128);
/// Dark level the descending method settles below.
pub const DARK_THRESHOLD: f64 = 4.0;

pub fn calibrate_offsets<S: ReferenceSource + ?Sized>(
    source: &mut S,
    ctx: &CalibrationContext,
) -> Result<Calibrated<ChannelCodes>, ScanError> {
    match ctx.strategy.offset {
        OffsetMethod::TwoPoint => two_point(source, ctx),
        OffsetMethod::Descending => descending(source, ctx),
    }
}

/// Solve `A = m(g) * (dark - offset)` for the offset that puts true black
/// at zero, from dark scans at two gains.
fn two_point<S: ReferenceSource + ?Sized>(
    source: &mut S,
    ctx: &CalibrationContext,
) -> Result<Calibrated<ChannelCodes>, ScanError> {
    let (g_lo, g_hi) = TWO_POINT_GAINS;
    let low = source.acquire(&ctx.window_scan(ReferenceKind::Dark, [g_lo; 3], [0; 3]))?;
    let high = source.acquire(&ctx.window_scan(ReferenceKind::Dark, [g_hi; 3], [0; 3]))?;
    let m_lo = gain_multiplier(ctx.family(), g_lo);
    let m_hi = gain_multiplier(ctx.family(), g_hi);

    let mut codes = Vec::with_capacity(ctx.channels);
    let mut residual: f64 = 0.0;
    for channel in 0..ctx.channels {
        let a_lo = low.channel_mean(channel);
        let a_hi = high.channel_mean(channel);
        let dark = (a_hi - a_lo) / (m_hi - m_lo);
        let code = dark.round().clamp(0.0, MAX_OFFSET_CODE as f64);
        debug!(channel, a_lo, a_hi, dark, code, "Two-point offset");
        residual = residual.max((dark - code).abs());
        codes.push(code as u8);
    }

    Ok(Calibrated {
        value: ChannelCodes {
            codes: ctx.expand(&codes),
            residual,
        },
        // Anything beyond rounding means the code range was exceeded.
        converged: residual <= 0.5,
        iterations: 2,
    })
}

/// Lower each channel's code from the top of the range while its dark
/// average stays above the threshold.
fn descending<S: ReferenceSource + ?Sized>(
    source: &mut S,
    ctx: &CalibrationContext,
) -> Result<Calibrated<ChannelCodes>, ScanError> {
    let mut codes = vec![MAX_OFFSET_CODE; ctx.channels];
    let mut active = vec![true; ctx.channels];
    let mut means = vec![0.0; ctx.channels];
    let mut iterations = 0;

    while active.iter().any(|&a| a) && iterations < MAX_OFFSET_CODE as usize + 1 {
        iterations += 1;
        let dark = source.acquire(&ctx.window_scan(ReferenceKind::Dark, [0; 3], ctx.expand(&codes)))?;
        for channel in 0..ctx.channels {
            if !active[channel] {
                continue;
            }
            means[channel] = dark.channel_mean(channel);
            if means[channel] <= DARK_THRESHOLD || codes[channel] == 0 {
                active[channel] = false;
            } else {
                codes[channel] -= 1;
            }
        }
        debug!(iteration = iterations, ?codes, ?means, "Descending offset");
    }

    let residual = means
        .iter()
        .map(|&m| (m - DARK_THRESHOLD).max(0.0))
        .fold(0.0, f64::max);
    Ok(Calibrated {
        value: ChannelCodes {
            codes: ctx.expand(&codes),
            residual,
        },
        converged: residual == 0.0,
        iterations,
    })
}
