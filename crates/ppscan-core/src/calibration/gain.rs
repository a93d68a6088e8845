//! Coarse amplifier gain calibration.

use tracing::debug;

use super::{
    Calibrated, CalibrationContext, ChannelCodes, GainMethod, ReferenceKind, ReferenceSource,
};
use crate::error::ScanError;
use crate::model::AsicFamily;

/// Window the white level must land in, before white balance.
pub const GAIN_TARGET: (f64, f64) = (230.0, 245.0);
/// Bisection iterations allowed.
pub const BISECTION_LIMIT: usize = 8;

/// Amplification of a gain code.
pub fn gain_multiplier(family: AsicFamily, code: u8) -> f64 {
    match family {
        AsicFamily::Bridged => 1.0 + code as f64 / 32.0,
        AsicFamily::Direct => 1.0 + code as f64 / 8.0,
    }
}

pub fn max_gain_code(family: AsicFamily) -> u8 {
    match family {
        AsicFamily::Bridged => 255,
        AsicFamily::Direct => 15,
    }
}

/// Distance of a level from the target window, 0 inside it.
pub fn window_distance(level: f64) -> f64 {
    let (low, high) = GAIN_TARGET;
    if level < low {
        low - level
    } else if level > high {
        level - high
    } else {
        0.0
    }
}

/// Search for one channel's gain code.
pub trait GainSearch {
    /// Code to measure next.
    fn next_code(&self) -> u8;
    /// Record the balanced white level measured at `code`.
    fn observe(&mut self, code: u8, level: f64);
    fn is_done(&self) -> bool;
    /// Best code so far and its distance from the window.
    fn best(&self) -> (u8, f64);
}

/// Bracketed bisection over the code range.
#[derive(Debug, Clone)]
pub struct Bisection {
    lo: i32,
    hi: i32,
    best: (u8, f64),
    done: bool,
}

impl Bisection {
    pub fn new(max_code: u8) -> Self {
        Self {
            lo: 0,
            hi: max_code as i32,
            best: (0, f64::INFINITY),
            done: false,
        }
    }
}

impl GainSearch for Bisection {
    fn next_code(&self) -> u8 {
        ((self.lo + self.hi) / 2) as u8
    }

    fn observe(&mut self, code: u8, level: f64) {
        let distance = window_distance(level);
        if distance < self.best.1 {
            self.best = (code, distance);
        }
        if distance == 0.0 {
            self.done = true;
            return;
        }
        if level < GAIN_TARGET.0 {
            self.lo = code as i32 + 1;
        } else {
            self.hi = code as i32 - 1;
        }
        if self.lo > self.hi {
            self.done = true;
        }
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn best(&self) -> (u8, f64) {
        self.best
    }
}

/// Step the code up from zero until the window's lower bound is reached.
#[derive(Debug, Clone)]
pub struct LinearStep {
    code: u8,
    max_code: u8,
    best: (u8, f64),
    done: bool,
}

impl LinearStep {
    pub fn new(max_code: u8) -> Self {
        Self {
            code: 0,
            max_code,
            best: (0, f64::INFINITY),
            done: false,
        }
    }
}

impl GainSearch for LinearStep {
    fn next_code(&self) -> u8 {
        self.code
    }

    fn observe(&mut self, code: u8, level: f64) {
        let distance = window_distance(level);
        if distance < self.best.1 {
            self.best = (code, distance);
        }
        if level >= GAIN_TARGET.0 || code >= self.max_code {
            self.done = true;
        } else {
            self.code = code + 1;
        }
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn best(&self) -> (u8, f64) {
        self.best
    }
}

pub fn calibrate_gains<S: ReferenceSource + ?Sized>(
    source: &mut S,
    ctx: &CalibrationContext,
    offsets: [u8; 3],
) -> Result<Calibrated<ChannelCodes>, ScanError> {
    let max_code = max_gain_code(ctx.family());
    let (mut searches, limit): (Vec<Box<dyn GainSearch>>, usize) = match ctx.strategy.gain {
        GainMethod::Bisection => (
            (0..ctx.channels)
                .map(|_| Box::new(Bisection::new(max_code)) as Box<dyn GainSearch>)
                .collect(),
            BISECTION_LIMIT,
        ),
        GainMethod::LinearStep => (
            (0..ctx.channels)
                .map(|_| Box::new(LinearStep::new(max_code)) as Box<dyn GainSearch>)
                .collect(),
            max_code as usize + 1,
        ),
    };

    let mut iterations = 0;
    while iterations < limit && searches.iter().any(|s| !s.is_done()) {
        iterations += 1;
        let codes: Vec<u8> = searches
            .iter()
            .map(|s| if s.is_done() { s.best().0 } else { s.next_code() })
            .collect();
        let white = source.acquire(&ctx.window_scan(ReferenceKind::White, ctx.expand(&codes), offsets))?;
        for (channel, search) in searches.iter_mut().enumerate() {
            if search.is_done() {
                continue;
            }
            let level = white.channel_mean(channel) / ctx.white_balance(channel);
            debug!(channel, code = codes[channel], level, "Gain step");
            search.observe(codes[channel], level);
        }
    }

    let best: Vec<(u8, f64)> = searches.iter().map(|s| s.best()).collect();
    let codes: Vec<u8> = best.iter().map(|b| b.0).collect();
    let residual = best.iter().map(|b| b.1).fold(0.0, f64::max);
    Ok(Calibrated {
        value: ChannelCodes {
            codes: ctx.expand(&codes),
            residual,
        },
        converged: residual == 0.0,
        iterations,
    })
}
