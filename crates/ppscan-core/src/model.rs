//! Supported scanner models and their fixed characteristics.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Resolutions the motor and sensor can run at natively.
pub const NATIVE_DPI: [u16; 5] = [75, 150, 300, 600, 1200];

/// Controller chip family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AsicFamily {
    /// Register-addressed bridge chip (1220P/1600P/2000P).
    Bridged,
    /// Directly driven sensor controller (610P).
    Direct,
}

impl fmt::Display for AsicFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsicFamily::Bridged => write!(f, "bridged"),
            AsicFamily::Direct => write!(f, "direct"),
        }
    }
}

/// Physical arrangement of the sensor output in a raw scanline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorLayout {
    /// Two interleaved read heads, each channel plane shifted by a
    /// sub-pixel offset.
    Duplex,
    /// Three separate heads, one per channel, with a per-head x offset.
    ThreeHead,
    /// One head reading the channels at staggered times.
    Staggered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScannerModel {
    #[serde(rename = "610")]
    Model610,
    #[serde(rename = "1220")]
    Model1220,
    #[serde(rename = "1600")]
    Model1600,
    #[serde(rename = "2000")]
    Model2000,
}

impl ScannerModel {
    pub fn family(&self) -> AsicFamily {
        match self {
            ScannerModel::Model610 => AsicFamily::Direct,
            _ => AsicFamily::Bridged,
        }
    }

    /// Sensor resolution; scan-area units are 1/ccd_dpi inch.
    pub fn ccd_dpi(&self) -> u16 {
        match self {
            ScannerModel::Model610 => 300,
            _ => 600,
        }
    }

    /// Highest (vertical) resolution.
    pub fn max_dpi(&self) -> u16 {
        match self {
            ScannerModel::Model610 => 600,
            _ => 1200,
        }
    }

    /// Scan area width in units.
    pub fn width_units(&self) -> u32 {
        match self {
            ScannerModel::Model610 => 2550,
            _ => 5100,
        }
    }

    /// Scan area height in units.
    pub fn height_units(&self) -> u32 {
        match self {
            ScannerModel::Model610 => 3500,
            _ => 7000,
        }
    }

    /// Sensor pixels before the glass starts.
    pub fn left_edge(&self) -> u32 {
        match self {
            ScannerModel::Model610 => 92,
            _ => 144,
        }
    }

    /// Full sensor width in pixels (shading table width).
    pub fn ccd_width(&self) -> usize {
        (self.left_edge() + self.width_units()) as usize
    }

    /// Divisors applied to the red, green and blue averages before they are
    /// compared against the gain window.
    pub fn white_balance(&self) -> [f64; 3] {
        match self {
            ScannerModel::Model610 => [1.0, 0.96, 0.92],
            ScannerModel::Model1220 => [1.0, 1.0, 0.97],
            ScannerModel::Model1600 => [0.98, 1.0, 0.96],
            ScannerModel::Model2000 => [1.0, 0.98, 0.95],
        }
    }

    pub fn layout(&self) -> SensorLayout {
        match self {
            ScannerModel::Model610 => SensorLayout::ThreeHead,
            ScannerModel::Model2000 => SensorLayout::Duplex,
            ScannerModel::Model1220 | ScannerModel::Model1600 => SensorLayout::Staggered,
        }
    }

    /// Lines averaged by every calibration measurement.
    pub fn reference_lines(&self) -> usize {
        match self.family() {
            AsicFamily::Bridged => 66,
            AsicFamily::Direct => 24,
        }
    }

    /// Color skew in raw lines between consecutive channels at `native_dpi`.
    pub fn color_delta(&self, native_dpi: u16) -> usize {
        match (self.family(), native_dpi) {
            (AsicFamily::Bridged, 1200) => 8,
            (AsicFamily::Bridged, 600) => 4,
            (AsicFamily::Bridged, 300) => 2,
            (AsicFamily::Bridged, 150) => 1,
            (AsicFamily::Bridged, _) => 0,
            (AsicFamily::Direct, 600) => 16,
            (AsicFamily::Direct, 300) => 8,
            (AsicFamily::Direct, 150) => 4,
            (AsicFamily::Direct, _) => 2,
        }
    }

    /// Smallest native resolution at or above `requested`, if the model
    /// supports it.
    pub fn native_dpi(&self, requested: u16) -> Option<u16> {
        if requested == 0 {
            return None;
        }
        NATIVE_DPI
            .iter()
            .copied()
            .filter(|&dpi| dpi <= self.max_dpi())
            .find(|&dpi| dpi >= requested)
    }

    /// Whether the lamp can be switched by the motor block.
    pub fn has_lamp_control(&self) -> bool {
        self.family() == AsicFamily::Bridged
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScannerModel::Model610 => "Astra 610P",
            ScannerModel::Model1220 => "Astra 1220P",
            ScannerModel::Model1600 => "Astra 1600P",
            ScannerModel::Model2000 => "Astra 2000P",
        }
    }
}

impl fmt::Display for ScannerModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ScannerModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .trim()
            .trim_start_matches(|c: char| !c.is_ascii_digit())
            .trim_end_matches(|c: char| !c.is_ascii_digit());
        match digits {
            "610" => Ok(ScannerModel::Model610),
            "1220" => Ok(ScannerModel::Model1220),
            "1600" => Ok(ScannerModel::Model1600),
            "2000" => Ok(ScannerModel::Model2000),
            _ => Err(format!("unknown scanner model '{}'", s)),
        }
    }
}
