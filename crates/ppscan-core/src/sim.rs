//! Simulated scanner behind the link trait.
//!
//! Keeps the uploaded blocks, tracks the head, and synthesises sensor data
//! from a simple analog model so calibration has something to converge on:
//! bridged `m(g) * (level * s + dark - offset)`, direct
//! `m(g) * (level + offset - pedestal)`, then shading and gamma.

use std::collections::{HashMap, VecDeque};

use crate::calibration::gain::gain_multiplier;
use crate::model::{AsicFamily, ScannerModel};
use crate::pipeline::commands::{MOTOR_DARK, MOTOR_PARK, MOTOR_REFERENCE, MOTOR_SCAN};
use crate::pipeline::{CcdWindow, MotorCommand, RawFormat};
use crate::protocol::constants::{CMD_CCD, CMD_DATA, CMD_MOTOR, CMD_SHADING, LAMP_BIT, MOTOR_BIT};
use crate::protocol::{LinkWarning, ProtocolError, ScannerLink, SyncOp};

const HOME_LEVEL: f64 = 5.0;
const STRIP_EDGE: i32 = 160;
const BRIDGED_STRIP: f64 = 60.0;
const DIRECT_STRIP: f64 = 90.0;
const BRIDGED_DARK: [f64; 3] = [12.0, 10.0, 14.0];
const BRIDGED_SENSITIVITY: [f64; 3] = [1.0, 0.95, 0.9];
const DIRECT_PEDESTAL: f64 = 20.0;

struct Acquisition {
    window: CcdWindow,
    format: RawFormat,
    start: i32,
    ratio: i32,
    reference: bool,
    dark: bool,
    next: usize,
    lines: usize,
}

pub struct SimScanner {
    model: ScannerModel,
    blocks: HashMap<u8, Vec<u8>>,
    corrupt: Option<u8>,
    head: i32,
    lamp: bool,
    cold: bool,
    strip_level: f64,
    parks: usize,
    reference_scans: usize,
    operations: usize,
    fail_data: bool,
    /// A motor block was uploaded since the last commit.
    motor_pending: bool,
    commits: usize,
    acquisition: Option<Acquisition>,
    pending: VecDeque<u8>,
}

impl SimScanner {
    pub const BRIGHT_STRIP: f64 = 160.0;

    pub fn new(model: ScannerModel) -> Self {
        let strip_level = match model {
            ScannerModel::Model610 => DIRECT_STRIP,
            ScannerModel::Model1600 => Self::BRIGHT_STRIP,
            _ => BRIDGED_STRIP,
        };
        Self {
            model,
            blocks: HashMap::new(),
            corrupt: None,
            head: 0,
            lamp: false,
            cold: false,
            strip_level,
            parks: 0,
            reference_scans: 0,
            operations: 0,
            fail_data: false,
            motor_pending: false,
            commits: 0,
            acquisition: None,
            pending: VecDeque::new(),
        }
    }

    /// Report an all-zero motor block until the first park.
    pub fn set_cold(&mut self, cold: bool) {
        self.cold = cold;
    }

    pub fn set_strip_level(&mut self, level: f64) {
        self.strip_level = level;
    }

    /// Flip a bit in everything read back from `channel`.
    pub fn corrupt_readback(&mut self, channel: u8) {
        self.corrupt = Some(channel);
    }

    /// Fail every scan data read from now on.
    pub fn fail_data_reads(&mut self) {
        self.fail_data = true;
    }

    pub fn strip_edge(&self) -> i32 {
        STRIP_EDGE
    }

    pub fn head(&self) -> i32 {
        self.head
    }

    pub fn lamp(&self) -> bool {
        self.lamp
    }

    pub fn parks(&self) -> usize {
        self.parks
    }

    pub fn reference_scans(&self) -> usize {
        self.reference_scans
    }

    /// Link calls made so far.
    pub fn operations(&self) -> usize {
        self.operations
    }

    /// Commit syncs seen, with or without a motor block to run.
    pub fn commits(&self) -> usize {
        self.commits
    }

    pub fn block(&self, channel: u8) -> Option<&Vec<u8>> {
        self.blocks.get(&channel)
    }

    fn sensitivity(pixel: usize) -> f64 {
        1.0 + 0.05 * (pixel as f64 * 0.37).sin()
    }

    fn sample(&self, acq: &Acquisition, channel: usize, pixel: usize, position: i32) -> u8 {
        let level = if acq.dark || !self.lamp {
            0.0
        } else if acq.reference || position >= STRIP_EDGE {
            self.strip_level
        } else {
            HOME_LEVEL
        };
        let window = &acq.window;
        let family = self.model.family();
        let m = gain_multiplier(family, window.gains[channel]);
        let offset = window.offsets[channel] as f64;
        let s = Self::sensitivity(pixel);
        let mut value = match family {
            AsicFamily::Bridged => {
                m * (level * BRIDGED_SENSITIVITY[channel] * s + BRIDGED_DARK[channel] - offset)
            }
            AsicFamily::Direct => m * (level * s + offset - DIRECT_PEDESTAL),
        };

        if window.shading {
            if let Some(table) = self.blocks.get(&CMD_SHADING) {
                let ccd = self.model.ccd_width();
                let coefficient = table.get(channel * ccd + pixel).copied().unwrap_or(128);
                value *= coefficient as f64 / 128.0;
                let index = value.round().clamp(0.0, 255.0) as usize;
                if let Some(&mapped) = table.get(3 * ccd + channel * 256 + index) {
                    return mapped;
                }
            }
        }
        value.round().clamp(0.0, 255.0) as u8
    }

    fn generate_line(&mut self) -> bool {
        let Some(acq) = self.acquisition.as_ref() else {
            return false;
        };
        if acq.next >= acq.lines {
            return false;
        }
        let position = if acq.reference {
            acq.start
        } else {
            acq.start + acq.next as i32 * acq.ratio
        };
        let channels = acq.format.channels;
        let step = (self.model.ccd_dpi() / acq.window.xdpi.max(1)) as usize;
        let mut line = vec![0u8; acq.format.line_bytes()];
        for c in 0..channels {
            let channel = if channels == 1 { 1 } else { c };
            for x in 0..acq.format.width {
                let pixel = acq.window.x as usize + x * step;
                line[acq.format.position(c, x)] = self.sample(acq, channel, pixel, position);
            }
        }
        self.pending.extend(line);
        if let Some(acq) = self.acquisition.as_mut() {
            acq.next += 1;
        }
        true
    }

    fn commit(&mut self) -> Result<(), ProtocolError> {
        self.commits += 1;
        if !std::mem::take(&mut self.motor_pending) {
            return Ok(());
        }
        let Some(block) = self.blocks.get(&CMD_MOTOR) else {
            return Ok(());
        };
        let motor = MotorCommand::from_bytes(block)?;
        self.lamp = motor.lamp;
        if motor.has(MOTOR_PARK) {
            self.head = 0;
            self.parks += 1;
            self.cold = false;
            return Ok(());
        }
        if !motor.has(MOTOR_SCAN) {
            self.head = (self.head + motor.steps).max(0);
            return Ok(());
        }

        let window = self
            .blocks
            .get(&CMD_CCD)
            .map(|b| CcdWindow::from_bytes(b))
            .transpose()?
            .unwrap_or_default();
        let reference = motor.has(MOTOR_REFERENCE);
        if reference {
            self.reference_scans += 1;
        } else {
            self.head = (self.head + motor.steps).max(0);
        }
        let start = self.head;
        let ratio = motor.step_ratio as i32;
        if !reference {
            self.head += motor.lines as i32 * ratio;
        }
        self.pending.clear();
        self.acquisition = Some(Acquisition {
            format: RawFormat::new(self.model.layout(), window.channels(), window.width as usize, 0),
            window,
            start,
            ratio,
            reference,
            dark: motor.has(MOTOR_DARK),
            next: 0,
            lines: motor.lines as usize,
        });
        Ok(())
    }
}

impl ScannerLink for SimScanner {
    fn family(&self) -> AsicFamily {
        self.model.family()
    }

    fn cmd_set(&mut self, channel: u8, data: &[u8]) -> Result<(), ProtocolError> {
        self.operations += 1;
        if channel == CMD_MOTOR && data.len() > 14 {
            self.lamp = data[14] & LAMP_BIT != 0;
            self.motor_pending = true;
        }
        self.blocks.insert(channel, data.to_vec());
        Ok(())
    }

    fn cmd_get(&mut self, channel: u8, len: usize) -> Result<Vec<u8>, ProtocolError> {
        self.operations += 1;
        if channel == CMD_MOTOR {
            if self.cold {
                return Ok(vec![0; len]);
            }
            let status = MotorCommand {
                lamp: self.lamp,
                status: MOTOR_BIT,
                ..Default::default()
            };
            return Ok(status.to_bytes()[..len.min(16)].to_vec());
        }
        let mut block = self.blocks.get(&channel).cloned().unwrap_or_default();
        block.resize(len, 0);
        if self.corrupt == Some(channel) && !block.is_empty() {
            block[0] ^= 0x01;
        }
        Ok(block)
    }

    fn cmd_get_buffer(&mut self, channel: u8, len: usize) -> Result<Vec<u8>, ProtocolError> {
        self.operations += 1;
        if channel != CMD_DATA || self.fail_data {
            return Err(ProtocolError::StatusTimeout { polls: 256 });
        }
        while self.pending.len() < len && self.generate_line() {}
        let take = len.min(self.pending.len());
        Ok(self.pending.drain(..take).collect())
    }

    fn cmd_sync(&mut self, op: SyncOp) -> Result<(), ProtocolError> {
        self.operations += 1;
        match op {
            SyncOp::Commit => self.commit(),
            SyncOp::Halt => {
                self.acquisition = None;
                self.pending.clear();
                Ok(())
            }
            SyncOp::Continue => Ok(()),
        }
    }

    fn scanner_status(&mut self) -> Result<u8, ProtocolError> {
        self.operations += 1;
        Ok(MOTOR_BIT)
    }

    fn take_warnings(&mut self) -> Vec<LinkWarning> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::commands::MOTOR_COLOR;

    #[test]
    fn test_sim_tracks_head() {
        let mut sim = SimScanner::new(ScannerModel::Model1220);
        sim.cmd_set(CMD_MOTOR, &MotorCommand::relative(300, true, true).to_bytes()).unwrap();
        sim.cmd_sync(SyncOp::Commit).unwrap();
        assert_eq!(sim.head(), 300);
        assert!(sim.lamp());
        sim.cmd_set(CMD_MOTOR, &MotorCommand::park(true).to_bytes()).unwrap();
        sim.cmd_sync(SyncOp::Commit).unwrap();
        assert_eq!((sim.head(), sim.parks()), (0, 1));
    }

    #[test]
    fn test_sim_reference_scan_size() {
        let mut sim = SimScanner::new(ScannerModel::Model2000);
        let window = CcdWindow {
            x: 10,
            width: 20,
            xdpi: 600,
            ydpi: 600,
            color: true,
            ..Default::default()
        };
        sim.cmd_set(CMD_CCD, &window.to_bytes()).unwrap();
        let motor = MotorCommand::reference(4, false, true, true);
        assert!(motor.has(MOTOR_COLOR));
        sim.cmd_set(CMD_MOTOR, &motor.to_bytes()).unwrap();
        sim.cmd_sync(SyncOp::Commit).unwrap();
        let format = RawFormat::new(ScannerModel::Model2000.layout(), 3, 20, 0);
        let data = sim.cmd_get_buffer(CMD_DATA, 1 << 20).unwrap();
        assert_eq!(data.len(), 4 * format.line_bytes());
        assert_eq!(sim.reference_scans(), 1);
        assert_eq!(sim.head(), 0);
    }
}
