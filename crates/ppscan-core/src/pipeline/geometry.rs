//! Scan requests and the raw/output geometry derived from them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ScanError;
use crate::model::{AsicFamily, ScannerModel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorMode {
    Lineart,
    Gray,
    Color,
}

impl ColorMode {
    /// Channels acquired from the sensor.
    pub fn channels(&self) -> usize {
        match self {
            ColorMode::Color => 3,
            ColorMode::Gray | ColorMode::Lineart => 1,
        }
    }
}

impl fmt::Display for ColorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColorMode::Lineart => write!(f, "lineart"),
            ColorMode::Gray => write!(f, "gray"),
            ColorMode::Color => write!(f, "color"),
        }
    }
}

impl FromStr for ColorMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lineart" | "bw" => Ok(ColorMode::Lineart),
            "gray" | "grey" => Ok(ColorMode::Gray),
            "color" | "colour" | "rgb" => Ok(ColorMode::Color),
            other => Err(format!("unknown color mode '{}'", other)),
        }
    }
}

/// Gain and offset codes that replace the computed ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualCalibration {
    pub gains: [u8; 3],
    pub offsets: [u8; 3],
}

/// Threshold transform for lineart: slope and offset in -127..=127.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LineartParams {
    pub slope: i32,
    pub offset: i32,
}

/// Area and format of a scan. Coordinates are in units of 1/CCD-dpi inch
/// from the glass origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanRequest {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub dpi: u16,
    pub mode: ColorMode,
    pub manual: Option<ManualCalibration>,
    pub lineart: LineartParams,
}

impl ScanRequest {
    pub fn new(x: u32, y: u32, width: u32, height: u32, dpi: u16, mode: ColorMode) -> Self {
        Self {
            x,
            y,
            width,
            height,
            dpi,
            mode,
            manual: None,
            lineart: LineartParams::default(),
        }
    }
}

/// Output format handed back by `start_scan`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanParameters {
    pub mode: ColorMode,
    pub dpi: u16,
    /// Motor resolution the scan actually runs at.
    pub native_dpi: u16,
    /// 3 for color, 1 for gray and lineart (lineart packs 8 pixels a byte).
    pub bytes_per_pixel: usize,
    pub bits_per_pixel: usize,
    pub bytes_per_line: usize,
    pub target_width: usize,
    pub target_height: usize,
}

/// Everything the pipeline needs to know about a scan's shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanGeometry {
    pub model: ScannerModel,
    pub mode: ColorMode,
    pub dpi: u16,
    /// Vertical (motor) resolution.
    pub native_y: u16,
    /// Horizontal sensor resolution, capped at the CCD rate.
    pub native_x: u16,
    pub target_width: usize,
    pub target_height: usize,
    /// Pixels per channel in a descrambled raw line.
    pub raw_width: usize,
    /// Raw lines to acquire, preload included.
    pub raw_lines: usize,
    /// Preload lines consumed by the color skew.
    pub skip: usize,
    pub delta: usize,
    /// First sensor pixel at CCD resolution.
    pub sensor_x: u32,
    /// Head offset from the origin to the first raw line, in motor steps.
    pub start_steps: i32,
    /// Motor steps per raw line.
    pub step_ratio: u16,
}

fn ceil_div(a: usize, b: usize) -> usize {
    a.div_ceil(b)
}

impl ScanGeometry {
    pub fn compute(model: ScannerModel, request: &ScanRequest) -> Result<Self, ScanError> {
        let invalid = |msg: String| Err(ScanError::InvalidRequest(msg));

        if request.width == 0 || request.height == 0 {
            return invalid("empty scan area".into());
        }
        let right = u64::from(request.x) + u64::from(request.width);
        let bottom = u64::from(request.y) + u64::from(request.height);
        if right > u64::from(model.width_units()) || bottom > u64::from(model.height_units()) {
            return invalid(format!(
                "area {}x{}+{}+{} exceeds the {}x{} glass",
                request.width,
                request.height,
                request.x,
                request.y,
                model.width_units(),
                model.height_units()
            ));
        }
        let Some(native_y) = model.native_dpi(request.dpi) else {
            return invalid(format!(
                "{} dpi not supported (max {})",
                request.dpi,
                model.max_dpi()
            ));
        };
        let native_x = native_y.min(model.ccd_dpi());
        let dpi = request.dpi as usize;
        let ccd = model.ccd_dpi() as usize;

        let target_width = request.width as usize * dpi / ccd;
        let target_height = request.height as usize * dpi / ccd;
        if target_width == 0 || target_height == 0 {
            return invalid("area too small for the requested resolution".into());
        }

        let raw_width = ceil_div(target_width * native_x as usize, dpi);
        let delta = if request.mode == ColorMode::Color {
            model.color_delta(native_y)
        } else {
            0
        };
        let skip = 2 * delta;
        let raw_lines = ceil_div(target_height * native_y as usize, dpi) + skip;
        if raw_lines > u16::MAX as usize {
            return invalid(format!("{} raw lines exceed the motor block", raw_lines));
        }

        let steps_per_unit = (model.max_dpi() / model.ccd_dpi()) as i32;
        let step_ratio = model.max_dpi() / native_y;
        let mut start_steps = request.y as i32 * steps_per_unit;
        // The bridged head starts early so the preload ends at the origin;
        // the direct head starts at the origin and drops the preload.
        if model.family() == AsicFamily::Bridged {
            start_steps -= (skip as i32) * step_ratio as i32;
        }

        Ok(Self {
            model,
            mode: request.mode,
            dpi: request.dpi,
            native_y,
            native_x,
            target_width,
            target_height,
            raw_width,
            raw_lines,
            skip,
            delta,
            sensor_x: model.left_edge() + request.x,
            start_steps,
            step_ratio,
        })
    }

    pub fn channels(&self) -> usize {
        self.mode.channels()
    }

    pub fn bytes_per_line(&self) -> usize {
        match self.mode {
            ColorMode::Color => self.target_width * 3,
            ColorMode::Gray => self.target_width,
            ColorMode::Lineart => self.target_width.div_ceil(8),
        }
    }

    pub fn parameters(&self) -> ScanParameters {
        ScanParameters {
            mode: self.mode,
            dpi: self.dpi,
            native_dpi: self.native_y,
            bytes_per_pixel: self.channels(),
            bits_per_pixel: match self.mode {
                ColorMode::Color => 24,
                ColorMode::Gray => 8,
                ColorMode::Lineart => 1,
            },
            bytes_per_line: self.bytes_per_line(),
            target_width: self.target_width,
            target_height: self.target_height,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_page_gray_at_150() {
        let request = ScanRequest::new(0, 0, 5100, 7000, 150, ColorMode::Gray);
        let geometry = ScanGeometry::compute(ScannerModel::Model1220, &request).unwrap();
        assert_eq!(geometry.target_width, 1275);
        assert_eq!(geometry.target_height, 1750);
        assert_eq!(geometry.native_y, 150);
        assert_eq!(geometry.raw_width, 1275);
        assert_eq!(geometry.raw_lines, 1750);
        assert_eq!(geometry.skip, 0);
        assert_eq!(geometry.sensor_x, 144);
        assert_eq!(geometry.step_ratio, 8);
    }

    #[test]
    fn test_color_preload_moves_bridged_origin() {
        let request = ScanRequest::new(0, 600, 600, 600, 300, ColorMode::Color);
        let geometry = ScanGeometry::compute(ScannerModel::Model1220, &request).unwrap();
        assert_eq!(geometry.delta, 2);
        assert_eq!(geometry.skip, 4);
        assert_eq!(geometry.raw_lines, 300 + 4);
        assert_eq!(geometry.start_steps, 600 * 2 - 4 * 4);

        let direct = ScanGeometry::compute(
            ScannerModel::Model610,
            &ScanRequest::new(0, 300, 300, 300, 300, ColorMode::Color),
        )
        .unwrap();
        assert_eq!(direct.skip, 16);
        assert_eq!(direct.start_steps, 600);
    }

    #[test]
    fn test_resolution_above_ccd_caps_horizontal() {
        let request = ScanRequest::new(0, 0, 600, 600, 1200, ColorMode::Gray);
        let geometry = ScanGeometry::compute(ScannerModel::Model2000, &request).unwrap();
        assert_eq!(geometry.native_x, 600);
        assert_eq!(geometry.native_y, 1200);
        assert_eq!(geometry.target_width, 1200);
        assert_eq!(geometry.raw_width, 600);
    }

    #[test]
    fn test_non_native_dpi_snaps_up() {
        let request = ScanRequest::new(0, 0, 600, 600, 100, ColorMode::Lineart);
        let geometry = ScanGeometry::compute(ScannerModel::Model1600, &request).unwrap();
        assert_eq!(geometry.native_y, 150);
        assert_eq!(geometry.target_width, 100);
        assert_eq!(geometry.raw_width, 150);
        assert_eq!(geometry.raw_lines, 150);
        assert_eq!(geometry.bytes_per_line(), 13);
        assert_eq!(geometry.parameters().bits_per_pixel, 1);
    }

    #[test]
    fn test_invalid_requests() {
        let model = ScannerModel::Model610;
        for request in [
            ScanRequest::new(0, 0, 0, 100, 150, ColorMode::Gray),
            ScanRequest::new(100, 0, 2500, 100, 150, ColorMode::Gray),
            ScanRequest::new(0, 0, 100, 100, 1200, ColorMode::Gray),
            ScanRequest::new(0, 0, 1, 1, 75, ColorMode::Gray),
            ScanRequest::new(u32::MAX, 0, 100, 100, 150, ColorMode::Gray),
            ScanRequest::new(0, 1, 100, u32::MAX, 150, ColorMode::Gray),
        ] {
            assert!(matches!(
                ScanGeometry::compute(model, &request),
                Err(ScanError::InvalidRequest(_))
            ));
        }
    }
}
