//! Adaptive thresholding for lineart output.

use std::f64::consts::FRAC_PI_4;

use super::geometry::LineartParams;

const THRESHOLD_MIN: f64 = 50.0;
const THRESHOLD_MAX: f64 = 205.0;

/// Width of the local averaging window, always odd.
pub fn window_width(dpi: u16) -> usize {
    (6 * dpi as usize / 150).max(1) | 1
}

/// Map a local average to the threshold a pixel must reach to be white.
pub fn threshold_lut(params: LineartParams) -> [u8; 256] {
    let gradient = (params.slope as f64 / 127.0 * FRAC_PI_4).tan();
    let mut lut = [0u8; 256];
    for (i, entry) in lut.iter_mut().enumerate() {
        let value = 128.0 + gradient * (i as f64 - 128.0) + params.offset as f64;
        *entry = value.round().clamp(THRESHOLD_MIN, THRESHOLD_MAX) as u8;
    }
    lut
}

/// Converts gray lines to packed 1-bit lines, MSB first, 1 = black.
#[derive(Debug, Clone)]
pub struct Binarizer {
    window: usize,
    lut: [u8; 256],
}

impl Binarizer {
    pub fn new(dpi: u16, params: LineartParams) -> Self {
        Self {
            window: window_width(dpi),
            lut: threshold_lut(params),
        }
    }

    pub fn binarize(&self, line: &[u8]) -> Vec<u8> {
        let width = line.len();
        let half = self.window / 2;
        let mut packed = vec![0u8; width.div_ceil(8)];

        let mut lo = 0;
        let mut hi = 0;
        let mut sum: u32 = 0;
        for x in 0..width {
            let want_lo = x.saturating_sub(half);
            let want_hi = (x + half + 1).min(width);
            while hi < want_hi {
                sum += line[hi] as u32;
                hi += 1;
            }
            while lo < want_lo {
                sum -= line[lo] as u32;
                lo += 1;
            }
            let average = sum / (hi - lo) as u32;
            if line[x] < self.lut[average as usize] {
                packed[x / 8] |= 0x80 >> (x % 8);
            }
        }
        packed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_width_is_odd() {
        assert_eq!(window_width(75), 3);
        assert_eq!(window_width(150), 7);
        assert_eq!(window_width(300), 13);
        assert_eq!(window_width(1), 1);
    }

    #[test]
    fn test_neutral_lut_is_flat() {
        assert!(threshold_lut(LineartParams::default()).iter().all(|&t| t == 128));

        let steep = threshold_lut(LineartParams { slope: 127, offset: 0 });
        assert_eq!(steep[0], 50);
        assert_eq!(steep[100], 100);
        assert_eq!(steep[255], 205);

        let shifted = threshold_lut(LineartParams { slope: 0, offset: 20 });
        assert_eq!(shifted[7], 148);
    }

    #[test]
    fn test_packing_msb_first() {
        let binarizer = Binarizer::new(75, LineartParams::default());
        let line = [0, 255, 0, 255, 255, 255, 255, 255, 0, 200];
        assert_eq!(binarizer.binarize(&line), vec![0b1010_0000, 0b1000_0000]);
    }
}
