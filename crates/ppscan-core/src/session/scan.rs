//! Scan start, block reads and reference scans for calibration.

use std::thread;

use tracing::{debug, info, instrument, warn};

use super::{ActiveScan, Session, SessionState};
use crate::calibration::{
    CalibrationContext, CalibrationState, GammaTables, ReferenceKind, ReferenceLines,
    ReferenceScan, ReferenceSource, calibrate,
};
use crate::error::ScanError;
use crate::events::{ScanEvent, ScanObserver};
use crate::pipeline::{
    CcdWindow, ColorMode, Descrambler, ExposureSettings, MotorCommand, RawFormat, ScanGeometry,
    ScanParameters, ScanPipeline, ScanRequest,
};
use crate::protocol::constants::{CMD_CCD, CMD_DATA, CMD_EXPOSURE, CMD_MOTOR, CMD_SHADING};
use crate::protocol::{ProtocolError, ScannerLink, SyncOp};

impl<L: ScannerLink, O: ScanObserver> Session<L, O> {
    /// Calibrate, program the scanner for `request` and start the motor.
    #[instrument(level = "info", skip(self), fields(model = %self.model))]
    pub fn start_scan(&mut self, request: &ScanRequest) -> Result<ScanParameters, ScanError> {
        self.require("start_scan", &[SessionState::Idle, SessionState::Parked])?;
        if self.park_pending {
            self.park()?;
            self.park_wait()?;
        }
        let geometry = ScanGeometry::compute(self.model, request)?;

        if !self.lamp {
            self.set_lamp(true)?;
            if !self.options.lamp_warmup.is_zero() {
                debug!(warmup = ?self.options.lamp_warmup, "Lamp warm-up");
                thread::sleep(self.options.lamp_warmup);
            }
        }

        self.set_state(SessionState::Calibrating);
        let ctx = CalibrationContext::new(self.model, geometry.channels());
        let gamma = self.gamma.clone();
        let calibrated = calibrate(self, &ctx, request.manual, &gamma);
        let (state, warnings) = match calibrated {
            Ok(result) => result,
            Err(e) => {
                self.set_state(SessionState::Idle);
                return Err(e);
            }
        };
        for warning in warnings {
            self.emit(ScanEvent::CalibrationWarning(warning));
        }
        self.emit(ScanEvent::Calibrated {
            gains: state.gains,
            offsets: state.offsets,
            auto: state.auto,
        });

        if let Err(e) = self.program_scan(&geometry, &state) {
            self.set_state(SessionState::Idle);
            return Err(e);
        }
        self.calibration = Some(state);

        let params = geometry.parameters();
        info!(
            mode = %params.mode,
            dpi = params.dpi,
            native_dpi = params.native_dpi,
            width = params.target_width,
            height = params.target_height,
            "Scan started"
        );
        self.active = Some(ActiveScan {
            pipeline: ScanPipeline::new(geometry, self.options.buffer_size, request.lineart),
            params,
        });
        self.cancel.reset();
        self.drain_warnings();
        self.set_state(SessionState::Scanning);
        Ok(params)
    }

    fn program_scan(&mut self, geometry: &ScanGeometry, state: &CalibrationState) -> Result<(), ScanError> {
        let color = geometry.mode == ColorMode::Color;
        self.link.cmd_set(CMD_SHADING, &state.upload_table())?;
        let window = CcdWindow {
            x: geometry.sensor_x as u16,
            width: geometry.raw_width as u16,
            xdpi: geometry.native_x,
            ydpi: geometry.native_y,
            color,
            gains: state.gains,
            offsets: state.offsets,
            shading: true,
        };
        self.link.cmd_set(CMD_CCD, &window.to_bytes())?;
        self.link.cmd_set(
            CMD_EXPOSURE,
            &ExposureSettings::for_scan(geometry.native_y, color).to_bytes(),
        )?;

        let target = self.origin + geometry.start_steps;
        let motor = MotorCommand::scan(
            target - self.head,
            geometry.raw_lines as u16,
            geometry.step_ratio,
            color,
            self.lamp,
        );
        self.link.cmd_set(CMD_MOTOR, &motor.to_bytes())?;
        self.link.cmd_sync(SyncOp::Commit)?;
        self.head = target + (geometry.raw_lines as i32) * geometry.step_ratio as i32;
        Ok(())
    }

    /// Read up to `max_len` bytes of image data.
    ///
    /// `window_width` (pixels) and `dpi` must match the running scan. An
    /// empty block means the image is complete; `is_last` ends the scan
    /// after this block regardless.
    pub fn read_block(
        &mut self,
        max_len: usize,
        window_width: usize,
        dpi: u16,
        is_last: bool,
    ) -> Result<Vec<u8>, ScanError> {
        if self.cancel.is_cancelled() && self.active.is_some() {
            self.active = None;
            self.park_pending = true;
            self.set_state(SessionState::Idle);
            let reason = "cancelled".to_string();
            self.emit(ScanEvent::Aborted {
                reason: reason.clone(),
            });
            return Err(ScanError::ScanAborted { reason });
        }
        self.require("read_block", &[SessionState::Scanning])?;
        let Some(active) = self.active.as_mut() else {
            return Err(ScanError::InvalidState {
                operation: "read_block",
                state: self.state,
            });
        };
        if window_width != active.params.target_width || dpi != active.params.dpi {
            return Err(ScanError::InvalidRequest(format!(
                "read window {} px at {} dpi does not match the scan ({} px at {} dpi)",
                window_width, dpi, active.params.target_width, active.params.dpi
            )));
        }

        let block = match active.pipeline.read(&mut self.link, max_len) {
            Ok(block) => block,
            Err(e) => return Err(self.abort(e)),
        };
        let rows = active.pipeline.rows_done();
        let total = active.params.target_height;
        let complete = active.pipeline.is_complete();
        self.drain_warnings();
        self.emit(ScanEvent::Progress { rows, total });

        if complete || is_last {
            self.finish_scan(rows)?;
        }
        Ok(block)
    }

    fn finish_scan(&mut self, rows: usize) -> Result<(), ScanError> {
        self.active = None;
        self.emit(ScanEvent::ScanComplete { rows });
        self.park()
    }

    /// End the running scan after a read failure: flag cancellation, try
    /// to park, and report the abort.
    fn abort(&mut self, error: ScanError) -> ScanError {
        let reason = error.to_string();
        warn!(%reason, "Scan read failed");
        self.cancel.cancel();
        self.active = None;
        if let Err(park_error) = self.park() {
            warn!(error = %park_error, "Park after failed read also failed");
            self.park_pending = true;
        }
        self.set_state(SessionState::Idle);
        self.emit(ScanEvent::Error {
            message: reason.clone(),
        });
        self.emit(ScanEvent::Aborted {
            reason: reason.clone(),
        });
        ScanError::ScanAborted { reason }
    }

    /// Read `lines` raw lines of the scan in progress, in whole-line
    /// chunks with a keep-alive between them.
    pub(super) fn read_raw(&mut self, lines: usize, line_bytes: usize) -> Result<Vec<u8>, ScanError> {
        let total = lines * line_bytes;
        let chunk = (self.options.buffer_size / line_bytes).max(1) * line_bytes;
        let mut data = Vec::with_capacity(total);
        while data.len() < total {
            let want = chunk.min(total - data.len());
            let piece = self.link.cmd_get_buffer(CMD_DATA, want)?;
            if piece.len() != want {
                return Err(ProtocolError::LengthMismatch {
                    expected: want,
                    actual: piece.len(),
                }
                .into());
            }
            data.extend_from_slice(&piece);
            if data.len() < total {
                self.link.cmd_sync(SyncOp::Continue)?;
            }
        }
        Ok(data)
    }
}

impl<L: ScannerLink, O: ScanObserver> ReferenceSource for Session<L, O> {
    fn acquire(&mut self, scan: &ReferenceScan) -> Result<ReferenceLines, ScanError> {
        let ccd_dpi = self.model.ccd_dpi();
        let color = scan.channels == 3;
        if let Some(coefficients) = &scan.shading {
            let mut table = coefficients.clone();
            table.extend(GammaTables::identity().to_bytes());
            self.link.cmd_set(CMD_SHADING, &table)?;
        }
        let window = CcdWindow {
            x: scan.x as u16,
            width: scan.width as u16,
            xdpi: ccd_dpi,
            ydpi: ccd_dpi,
            color,
            gains: scan.gains,
            offsets: scan.offsets,
            shading: scan.shading.is_some(),
        };
        self.link.cmd_set(CMD_CCD, &window.to_bytes())?;
        self.link
            .cmd_set(CMD_EXPOSURE, &ExposureSettings::for_scan(ccd_dpi, color).to_bytes())?;
        let dark = scan.kind == ReferenceKind::Dark;
        self.drive(MotorCommand::reference(scan.lines as u16, dark, color, self.lamp))?;

        let format = RawFormat::new(self.strategy.layout, scan.channels, scan.width, 0);
        let raw = self.read_raw(scan.lines, format.line_bytes())?;
        let mut descrambler = Descrambler::new(format);
        let mut planar = Vec::with_capacity(scan.channels * scan.width * scan.lines);
        for line in raw.chunks_exact(format.line_bytes()) {
            let Some(pixels) = descrambler.push_line(line) else {
                continue;
            };
            for channel in 0..scan.channels {
                planar.extend(pixels.iter().skip(channel).step_by(scan.channels));
            }
        }
        self.drain_warnings();
        Ok(ReferenceLines::new(scan.channels, scan.width, scan.lines, planar)?)
    }
}
