//! Scanner initialisation and homing.

use tracing::{debug, info, instrument, warn};

use super::motor::{ORIGIN_LINES, ORIGIN_OFFSET_STEPS, ORIGIN_WIDTH, SUBMODEL_THRESHOLD};
use super::{Session, SessionState};
use crate::calibration::{CalibrationState, FamilyStrategy};
use crate::error::ScanError;
use crate::events::{ScanEvent, ScanObserver};
use crate::model::{AsicFamily, ScannerModel};
use crate::pipeline::{CcdWindow, ExposureSettings, MotorCommand, RawFormat};
use crate::protocol::constants::{
    CCD_BLOCK_LEN, CMD_CCD, CMD_EXPOSURE, CMD_MOTOR, CMD_SHADING, MOTOR_BLOCK_LEN,
};
use crate::protocol::{ProtocolError, ScannerLink, SyncOp};

/// Row where a gray strip scan turns from dark to bright, averaged over
/// the columns. Each column's edge is the row after its largest forward
/// difference.
pub fn strip_edge(data: &[u8], width: usize, rows: usize) -> f64 {
    if width == 0 || rows < 2 {
        return 0.0;
    }
    let total: usize = (0..width)
        .map(|x| {
            (0..rows - 1)
                .map(|r| data[(r + 1) * width + x] as i32 - data[r * width + x] as i32)
                .enumerate()
                .fold((0, i32::MIN), |best, (r, d)| if d > best.1 { (r, d) } else { best })
                .0
                + 1
        })
        .sum();
    total as f64 / width as f64
}

impl<L: ScannerLink, O: ScanObserver> Session<L, O> {
    /// Reset the link, upload default tables, verify the data path and
    /// home the head.
    #[instrument(level = "info", skip(self), fields(model = %self.model, recover = self.options.recover))]
    pub(super) fn init_scanner(&mut self) -> Result<(), ScanError> {
        self.link.cmd_sync(SyncOp::Halt)?;
        self.link.cmd_sync(SyncOp::Continue)?;

        let motor = self.link.cmd_get(CMD_MOTOR, MOTOR_BLOCK_LEN)?;
        let cold = motor.iter().all(|&b| b == 0);
        if cold {
            info!("Motor status block is empty, re-homing");
        }
        self.lamp = MotorCommand::from_bytes(&motor)?.lamp || self.model.family() == AsicFamily::Direct;

        let defaults = CalibrationState::flat(self.model.ccd_width(), [0; 3], [0; 3], self.gamma.clone());
        self.link.cmd_set(CMD_SHADING, &defaults.upload_table())?;

        let known = self.full_window(false, [0; 3], [0; 3]);
        let written = known.to_bytes();
        self.link.cmd_set(CMD_CCD, &written)?;
        let back = self.link.cmd_get(CMD_CCD, CCD_BLOCK_LEN)?;
        if back != written {
            return Err(ProtocolError::ReadbackMismatch { channel: CMD_CCD }.into());
        }

        if !self.lamp {
            self.set_lamp(true)?;
        }
        if self.options.recover || cold {
            self.park()?;
            self.park_wait()?;
        }
        self.move_to_origin()?;
        self.drain_warnings();
        self.set_state(SessionState::Idle);
        Ok(())
    }

    /// Gray window over the whole sensor at CCD resolution.
    fn full_window(&self, shading: bool, gains: [u8; 3], offsets: [u8; 3]) -> CcdWindow {
        let dpi = self.model.ccd_dpi();
        CcdWindow {
            x: 0,
            width: self.model.ccd_width() as u16,
            xdpi: dpi,
            ydpi: dpi,
            color: false,
            gains,
            offsets,
            shading,
        }
    }

    /// Find the calibration strip edge and move the head to the glass
    /// origin. On a bridged scanner also tells a 1600 from a 1220 by the
    /// strip brightness.
    #[instrument(level = "info", skip(self))]
    pub fn move_to_origin(&mut self) -> Result<(), ScanError> {
        self.require(
            "move_to_origin",
            &[SessionState::Connected, SessionState::Idle, SessionState::Parked],
        )?;
        self.park()?;
        self.park_wait()?;

        let ccd_dpi = self.model.ccd_dpi();
        let ratio = self.model.max_dpi() / ccd_dpi;
        let mut window = self.full_window(false, [0; 3], [0; 3]);
        window.x = ((self.model.ccd_width() - ORIGIN_WIDTH) / 2) as u16;
        window.width = ORIGIN_WIDTH as u16;
        self.link.cmd_set(CMD_CCD, &window.to_bytes())?;
        self.link
            .cmd_set(CMD_EXPOSURE, &ExposureSettings::for_scan(ccd_dpi, false).to_bytes())?;
        self.drive(MotorCommand::scan(0, ORIGIN_LINES as u16, ratio, false, self.lamp))?;
        self.head += (ORIGIN_LINES as i32) * ratio as i32;

        let format = RawFormat::new(self.strategy.layout, 1, ORIGIN_WIDTH, 0);
        let raw = self.read_raw(ORIGIN_LINES, format.line_bytes())?;
        let strip: Vec<u8> = raw
            .chunks_exact(format.line_bytes())
            .flat_map(|line| (0..ORIGIN_WIDTH).map(move |x| line[format.position(0, x)]))
            .collect();

        let edge = strip_edge(&strip, ORIGIN_WIDTH, ORIGIN_LINES);
        let edge_row = (edge.round() as usize).min(ORIGIN_LINES - 1);
        debug!(edge, "Strip edge found");
        if edge_row + 2 >= ORIGIN_LINES {
            warn!(edge, "Strip edge at the end of the homing scan");
        }
        self.detect_submodel(&strip[(edge_row + 2).min(ORIGIN_LINES - 1) * ORIGIN_WIDTH..]);

        self.origin = (edge * ratio as f64).round() as i32 + ORIGIN_OFFSET_STEPS;
        let distance = self.origin - self.head;
        self.move_head(distance, true)?;
        info!(origin = self.origin, "Head at origin");
        Ok(())
    }

    fn detect_submodel(&mut self, bright: &[u8]) {
        let refinable = matches!(self.model, ScannerModel::Model1220 | ScannerModel::Model1600);
        if self.model_forced || !refinable || bright.is_empty() {
            return;
        }
        let level = bright.iter().map(|&v| v as f64).sum::<f64>() / bright.len() as f64;
        let model = if level > SUBMODEL_THRESHOLD {
            ScannerModel::Model1600
        } else {
            ScannerModel::Model1220
        };
        debug!(level, "Strip brightness");
        if model != self.model {
            info!(from = %self.model, to = %model, "Model refined by strip brightness");
            self.model = model;
            self.strategy = FamilyStrategy::for_model(model);
            self.emit(ScanEvent::ModelDetected { model });
        }
    }
}
