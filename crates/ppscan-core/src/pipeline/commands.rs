//! Command blocks sent before a scan: motor, CCD window, exposure.

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::protocol::ProtocolError;
use crate::protocol::constants::{
    CCD_BLOCK_LEN, EXPOSURE_BLOCK_LEN, FILTER_BLOCK_LEN, LAMP_BIT, MOTOR_BLOCK_LEN,
};

/// Accurate positioning (slower stepping).
pub const MOTOR_PRECISE: u8 = 0x01;
/// Acquire lines while moving.
pub const MOTOR_SCAN: u8 = 0x02;
/// Return to the home position.
pub const MOTOR_PARK: u8 = 0x04;
/// Acquire all three channels.
pub const MOTOR_COLOR: u8 = 0x08;
/// Acquire with the integration gated (dark frame).
pub const MOTOR_DARK: u8 = 0x10;
/// Acquire without moving, over the calibration strip.
pub const MOTOR_REFERENCE: u8 = 0x20;

/// Image filter block uploaded by the model check.
pub const DEFAULT_FILTER: [u8; FILTER_BLOCK_LEN] = [0x00, 0x10, 0x20, 0x40, 0x80, 0x40, 0x20, 0x10];

fn check_len(data: &[u8], expected: usize) -> Result<(), ProtocolError> {
    if data.len() < expected {
        return Err(ProtocolError::LengthMismatch {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Motor block (16 bytes).
///
/// Layout: signed step count (LE i32), lines to acquire (LE u16), motor
/// steps per line (LE u16), flags, five reserved bytes, lamp byte, status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MotorCommand {
    /// Relative move before acquisition, in motor steps. Negative moves
    /// towards home.
    pub steps: i32,
    pub lines: u16,
    pub step_ratio: u16,
    pub flags: u8,
    pub lamp: bool,
    /// Scanner status; ignored on upload.
    pub status: u8,
}

impl MotorCommand {
    /// Plain head move.
    pub fn relative(steps: i32, precise: bool, lamp: bool) -> Self {
        Self {
            steps,
            flags: if precise { MOTOR_PRECISE } else { 0 },
            lamp,
            ..Default::default()
        }
    }

    pub fn park(lamp: bool) -> Self {
        Self {
            flags: MOTOR_PARK,
            lamp,
            ..Default::default()
        }
    }

    /// Move `steps`, then acquire `lines` lines `step_ratio` steps apart.
    pub fn scan(steps: i32, lines: u16, step_ratio: u16, color: bool, lamp: bool) -> Self {
        let mut flags = MOTOR_SCAN | MOTOR_PRECISE;
        if color {
            flags |= MOTOR_COLOR;
        }
        Self {
            steps,
            lines,
            step_ratio,
            flags,
            lamp,
            status: 0,
        }
    }

    /// Stationary acquisition over the calibration strip.
    pub fn reference(lines: u16, dark: bool, color: bool, lamp: bool) -> Self {
        let mut flags = MOTOR_SCAN | MOTOR_REFERENCE;
        if dark {
            flags |= MOTOR_DARK;
        }
        if color {
            flags |= MOTOR_COLOR;
        }
        Self {
            lines,
            step_ratio: 0,
            flags,
            lamp,
            ..Default::default()
        }
    }

    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn to_bytes(&self) -> [u8; MOTOR_BLOCK_LEN] {
        let mut buf = [0u8; MOTOR_BLOCK_LEN];
        LittleEndian::write_i32(&mut buf[0..4], self.steps);
        LittleEndian::write_u16(&mut buf[4..6], self.lines);
        LittleEndian::write_u16(&mut buf[6..8], self.step_ratio);
        buf[8] = self.flags;
        if self.lamp {
            buf[14] = LAMP_BIT;
        }
        buf[15] = self.status;
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        check_len(data, MOTOR_BLOCK_LEN)?;
        let mut cursor = Cursor::new(data);
        let steps = cursor.read_i32::<LittleEndian>()?;
        let lines = cursor.read_u16::<LittleEndian>()?;
        let step_ratio = cursor.read_u16::<LittleEndian>()?;
        Ok(Self {
            steps,
            lines,
            step_ratio,
            flags: data[8],
            lamp: data[14] & LAMP_BIT != 0,
            status: data[15],
        })
    }
}

/// CCD window block (36 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CcdWindow {
    /// First sensor pixel, at CCD resolution.
    pub x: u16,
    /// Pixels per plane at `xdpi`.
    pub width: u16,
    pub xdpi: u16,
    pub ydpi: u16,
    pub color: bool,
    pub gains: [u8; 3],
    pub offsets: [u8; 3],
    /// Apply the uploaded shading table.
    pub shading: bool,
}

impl CcdWindow {
    pub fn channels(&self) -> usize {
        if self.color { 3 } else { 1 }
    }

    pub fn to_bytes(&self) -> [u8; CCD_BLOCK_LEN] {
        let mut buf = [0u8; CCD_BLOCK_LEN];
        for (i, value) in [self.x, self.width, self.xdpi, self.ydpi].iter().enumerate() {
            LittleEndian::write_u16(&mut buf[i * 2..i * 2 + 2], *value);
        }
        buf[8] = self.color as u8;
        buf[9..12].copy_from_slice(&self.gains);
        buf[12..15].copy_from_slice(&self.offsets);
        buf[15] = self.shading as u8;
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        check_len(data, CCD_BLOCK_LEN)?;
        let mut cursor = Cursor::new(data);
        let x = cursor.read_u16::<LittleEndian>()?;
        let width = cursor.read_u16::<LittleEndian>()?;
        let xdpi = cursor.read_u16::<LittleEndian>()?;
        let ydpi = cursor.read_u16::<LittleEndian>()?;
        Ok(Self {
            x,
            width,
            xdpi,
            ydpi,
            color: data[8] != 0,
            gains: [data[9], data[10], data[11]],
            offsets: [data[12], data[13], data[14]],
            shading: data[15] != 0,
        })
    }
}

/// Exposure block (8 bytes): per-channel integration time and line period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExposureSettings {
    pub integration: [u16; 3],
    pub line_period: u16,
}

impl ExposureSettings {
    /// Integration grows with the motor speed-down at high resolutions.
    pub fn for_scan(native_dpi: u16, color: bool) -> Self {
        let base = 0x0400u16.saturating_mul((native_dpi / 150).max(1));
        let integration = if color { [base, base, base] } else { [0, base, 0] };
        Self {
            integration,
            line_period: base.saturating_add(0x0100),
        }
    }

    pub fn to_bytes(&self) -> [u8; EXPOSURE_BLOCK_LEN] {
        let mut buf = [0u8; EXPOSURE_BLOCK_LEN];
        for (i, value) in self.integration.iter().enumerate() {
            LittleEndian::write_u16(&mut buf[i * 2..i * 2 + 2], *value);
        }
        LittleEndian::write_u16(&mut buf[6..8], self.line_period);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        check_len(data, EXPOSURE_BLOCK_LEN)?;
        let mut cursor = Cursor::new(data);
        Ok(Self {
            integration: [
                cursor.read_u16::<LittleEndian>()?,
                cursor.read_u16::<LittleEndian>()?,
                cursor.read_u16::<LittleEndian>()?,
            ],
            line_period: cursor.read_u16::<LittleEndian>()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_motor_block_layout() {
        let cmd = MotorCommand::relative(-300, true, true);
        let bytes = cmd.to_bytes();
        assert_eq!(&bytes[0..4], &(-300i32).to_le_bytes());
        assert_eq!(bytes[8], MOTOR_PRECISE);
        assert_eq!(bytes[14], LAMP_BIT);
        assert_eq!(MotorCommand::from_bytes(&bytes).unwrap(), cmd);
    }

    #[test]
    fn test_motor_scan_flags() {
        let cmd = MotorCommand::scan(120, 1750, 8, true, false);
        assert!(cmd.has(MOTOR_SCAN) && cmd.has(MOTOR_COLOR) && cmd.has(MOTOR_PRECISE));
        assert!(!cmd.has(MOTOR_PARK));
        let bytes = cmd.to_bytes();
        assert_eq!(&bytes[4..8], &[0xD6, 0x06, 0x08, 0x00]);

        let dark = MotorCommand::reference(66, true, false, true);
        assert!(dark.has(MOTOR_REFERENCE) && dark.has(MOTOR_DARK));
        assert_eq!(dark.steps, 0);
    }

    #[test]
    fn test_ccd_window_layout() {
        let window = CcdWindow {
            x: 144,
            width: 1275,
            xdpi: 150,
            ydpi: 150,
            color: true,
            gains: [10, 20, 30],
            offsets: [1, 2, 3],
            shading: true,
        };
        let bytes = window.to_bytes();
        assert_eq!(bytes.len(), CCD_BLOCK_LEN);
        assert_eq!(&bytes[0..4], &[144, 0, 0xFB, 0x04]);
        assert_eq!(&bytes[8..16], &[1, 10, 20, 30, 1, 2, 3, 1]);
        assert_eq!(CcdWindow::from_bytes(&bytes).unwrap(), window);
        assert!(CcdWindow::from_bytes(&bytes[..20]).is_err());
    }

    #[test]
    fn test_exposure_for_gray_scan() {
        let exposure = ExposureSettings::for_scan(600, false);
        assert_eq!(exposure.integration, [0, 0x1000, 0]);
        assert_eq!(
            ExposureSettings::from_bytes(&exposure.to_bytes()).unwrap(),
            exposure
        );
    }
}
