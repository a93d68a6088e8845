//! Scanner session - homing, calibration and scanning over one link.
//!
//! A session owns the link for its whole life and tracks where the head
//! is, whether the lamp is on and which scan is running. Front ends follow
//! it through a [`ScanObserver`].

mod init;
mod motor;
mod scan;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{info, instrument};

use crate::calibration::{CalibrationState, FamilyStrategy, GammaTables};
use crate::connection::Connection;
use crate::error::ScanError;
use crate::events::{ScanEvent, ScanObserver, TracingObserver};
use crate::model::ScannerModel;
use crate::pipeline::{ScanParameters, ScanPipeline};
use crate::protocol::{ScannerLink, SyncOp};
use crate::protocol::constants::{ASIC_BIT, MOTOR_BIT};

pub use init::strip_edge;
pub use motor::{ORIGIN_LINES, ORIGIN_OFFSET_STEPS, SUBMODEL_THRESHOLD};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninit,
    Connected,
    Idle,
    Calibrating,
    Scanning,
    Parked,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Uninit => write!(f, "UNINIT"),
            SessionState::Connected => write!(f, "CONNECTED"),
            SessionState::Idle => write!(f, "IDLE"),
            SessionState::Calibrating => write!(f, "CALIBRATING"),
            SessionState::Scanning => write!(f, "SCANNING"),
            SessionState::Parked => write!(f, "PARKED"),
            SessionState::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Coarse scanner status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerStatus {
    Idle,
    Busy,
}

impl ScannerStatus {
    /// Busy while the ASIC works or the motor runs (motor bit clear).
    pub fn from_byte(status: u8) -> Self {
        if status & ASIC_BIT != 0 || status & MOTOR_BIT == 0 {
            ScannerStatus::Busy
        } else {
            ScannerStatus::Idle
        }
    }
}

impl fmt::Display for ScannerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScannerStatus::Idle => write!(f, "idle"),
            ScannerStatus::Busy => write!(f, "busy"),
        }
    }
}

/// Cancellation flag shared with other threads.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    /// Thorough re-homing on open.
    pub recover: bool,
    /// Bytes requested per scan data read.
    pub buffer_size: usize,
    pub lamp_warmup: Duration,
    pub park_poll_interval: Duration,
    /// Status polls before `park_wait` gives up.
    pub park_poll_limit: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            recover: false,
            buffer_size: 0x10000,
            lamp_warmup: Duration::from_millis(500),
            park_poll_interval: Duration::from_millis(50),
            park_poll_limit: 400,
        }
    }
}

struct ActiveScan {
    pipeline: ScanPipeline,
    params: ScanParameters,
}

/// An initialised scanner.
pub struct Session<L: ScannerLink, O: ScanObserver = TracingObserver> {
    link: L,
    model: ScannerModel,
    model_forced: bool,
    strategy: FamilyStrategy,
    options: SessionOptions,
    observer: Arc<O>,
    state: SessionState,
    /// Head position in motor steps from home.
    head: i32,
    /// Glass origin in motor steps from home.
    origin: i32,
    lamp: bool,
    park_pending: bool,
    gamma: GammaTables,
    calibration: Option<CalibrationState>,
    active: Option<ActiveScan>,
    cancel: CancelToken,
}

impl Session<Connection, TracingObserver> {
    /// Identify the model on an attached scanner and initialise it.
    pub fn open(connection: Connection) -> Result<Self, ScanError> {
        Self::open_with_observer(connection, Arc::new(TracingObserver))
    }
}

impl<O: ScanObserver> Session<Connection, O> {
    pub fn open_with_observer(mut connection: Connection, observer: Arc<O>) -> Result<Self, ScanError> {
        observer.on_event(&ScanEvent::Attached {
            port: connection.port_name().to_string(),
            report: connection.report().clone(),
        });
        let forced = connection.forced_model().is_some();
        let model = connection.probe_model()?;
        let options = connection.session_options().clone();
        let mut session = Self::build(connection, model, options, observer);
        session.model_forced = forced;
        session.init_scanner()?;
        Ok(session)
    }
}

impl<L: ScannerLink, O: ScanObserver> Session<L, O> {
    /// Initialise a scanner of a known model behind any link.
    #[instrument(level = "info", skip_all, fields(model = %model))]
    pub fn open_with(
        link: L,
        model: ScannerModel,
        options: SessionOptions,
        observer: Arc<O>,
    ) -> Result<Self, ScanError> {
        let mut session = Self::build(link, model, options, observer);
        session.init_scanner()?;
        Ok(session)
    }

    fn build(link: L, model: ScannerModel, options: SessionOptions, observer: Arc<O>) -> Self {
        observer.on_event(&ScanEvent::ModelDetected { model });
        let mut session = Self {
            link,
            model,
            model_forced: false,
            strategy: FamilyStrategy::for_model(model),
            options,
            observer,
            state: SessionState::Uninit,
            head: 0,
            origin: 0,
            lamp: false,
            park_pending: false,
            gamma: GammaTables::default(),
            calibration: None,
            active: None,
            cancel: CancelToken::default(),
        };
        session.set_state(SessionState::Connected);
        session
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn model(&self) -> ScannerModel {
        self.model
    }

    pub fn strategy(&self) -> FamilyStrategy {
        self.strategy
    }

    pub fn head_position(&self) -> i32 {
        self.head
    }

    pub fn origin(&self) -> i32 {
        self.origin
    }

    pub fn lamp_on(&self) -> bool {
        self.lamp
    }

    /// Calibration used by the current or last scan.
    pub fn calibration(&self) -> Option<&CalibrationState> {
        self.calibration.as_ref()
    }

    /// Output format of the running scan.
    pub fn parameters(&self) -> Option<ScanParameters> {
        self.active.as_ref().map(|a| a.params)
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn into_link(self) -> L {
        self.link
    }

    /// Token that cancels the running scan from anywhere.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Request cancellation. Seen by the next `read_block`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Coarse status. A commit sync goes first so the motor and ASIC bits
    /// are current.
    pub fn status(&mut self) -> Result<ScannerStatus, ScanError> {
        self.require("status", &[])?;
        self.link.cmd_sync(SyncOp::Commit)?;
        let raw = self.link.scanner_status()?;
        Ok(ScannerStatus::from_byte(raw))
    }

    /// Replace one channel's gamma table for following scans.
    pub fn set_gamma(&mut self, channel: usize, table: [u8; 256]) -> Result<(), ScanError> {
        if channel >= 3 {
            return Err(ScanError::InvalidRequest(format!("no gamma channel {}", channel)));
        }
        self.gamma.set(channel, table);
        Ok(())
    }

    pub fn reset_gamma(&mut self) {
        self.gamma.reset();
    }

    /// Park the head, switch the lamp off and release the scanner.
    pub fn close(&mut self) -> Result<(), ScanError> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        if self.active.take().is_some() {
            self.emit(ScanEvent::Aborted {
                reason: "session closed".into(),
            });
        }
        if self.state != SessionState::Parked || self.park_pending {
            self.park()?;
        }
        self.set_lamp(false)?;
        self.set_state(SessionState::Closed);
        info!(model = %self.model, "Session closed");
        Ok(())
    }

    fn set_state(&mut self, to: SessionState) {
        if self.state != to {
            let from = self.state;
            self.state = to;
            self.emit(ScanEvent::StateChanged { from, to });
        }
    }

    fn emit(&self, event: ScanEvent) {
        self.observer.on_event(&event);
    }

    fn drain_warnings(&mut self) {
        for warning in self.link.take_warnings() {
            self.emit(ScanEvent::LinkWarning(warning));
        }
    }

    /// Fail unless the session is in one of `allowed` (any open state when
    /// empty).
    fn require(&self, operation: &'static str, allowed: &[SessionState]) -> Result<(), ScanError> {
        let ok = if allowed.is_empty() {
            !matches!(self.state, SessionState::Closed | SessionState::Uninit)
        } else {
            allowed.contains(&self.state)
        };
        if ok {
            Ok(())
        } else {
            Err(ScanError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{NullObserver, RecordingObserver};
    use crate::pipeline::{ColorMode, ManualCalibration, ScanRequest};
    use crate::protocol::constants::{CMD_CCD, CMD_SHADING};
    use crate::sim::SimScanner;

    pub(crate) fn quick_options() -> SessionOptions {
        SessionOptions {
            buffer_size: 0x8000,
            lamp_warmup: Duration::ZERO,
            park_poll_interval: Duration::ZERO,
            ..Default::default()
        }
    }

    fn open(model: ScannerModel) -> Session<SimScanner, NullObserver> {
        Session::open_with(
            SimScanner::new(model),
            model,
            quick_options(),
            Arc::new(NullObserver),
        )
        .unwrap()
    }

    fn read_all<L: ScannerLink, O: ScanObserver>(session: &mut Session<L, O>) -> Vec<u8> {
        let params = session.parameters().unwrap();
        let mut image = Vec::new();
        loop {
            let block = session
                .read_block(0x4000, params.target_width, params.dpi, false)
                .unwrap();
            if block.is_empty() {
                break;
            }
            image.extend(block);
        }
        image
    }

    #[test]
    fn test_scanner_status_bits() {
        assert_eq!(ScannerStatus::from_byte(MOTOR_BIT), ScannerStatus::Idle);
        assert_eq!(ScannerStatus::from_byte(0), ScannerStatus::Busy);
        assert_eq!(ScannerStatus::from_byte(MOTOR_BIT | ASIC_BIT), ScannerStatus::Busy);
    }

    #[test]
    fn test_status_syncs_before_reading() {
        let mut session = open(ScannerModel::Model1220);
        let head = session.head_position();
        let commits = session.link().commits();
        let ops = session.link().operations();
        assert_eq!(session.status().unwrap(), ScannerStatus::Idle);
        assert_eq!(session.link().commits(), commits + 1);
        assert_eq!(session.link().operations(), ops + 2);
        // nothing new was uploaded, so the head stays put
        assert_eq!(session.link().head(), head);
    }

    #[test]
    fn test_open_homes_to_origin() {
        let session = open(ScannerModel::Model1220);
        assert_eq!(session.state(), SessionState::Idle);
        let sim = session.link();
        assert_eq!(session.origin(), sim.strip_edge() + ORIGIN_OFFSET_STEPS);
        assert_eq!(sim.head(), session.head_position());
        assert_eq!(session.head_position(), session.origin());
    }

    #[test]
    fn test_cold_scanner_is_parked_before_homing() {
        let mut sim = SimScanner::new(ScannerModel::Model610);
        sim.set_cold(true);
        let session = Session::open_with(
            sim,
            ScannerModel::Model610,
            quick_options(),
            Arc::new(NullObserver),
        )
        .unwrap();
        assert!(session.link().parks() >= 2);
        assert_eq!(session.origin(), session.link().strip_edge() + ORIGIN_OFFSET_STEPS);
    }

    #[test]
    fn test_bright_strip_means_1600() {
        let mut sim = SimScanner::new(ScannerModel::Model1220);
        sim.set_strip_level(SimScanner::BRIGHT_STRIP);
        let observer = Arc::new(RecordingObserver::new());
        let session = Session::open_with(
            sim,
            ScannerModel::Model1220,
            quick_options(),
            observer.clone(),
        )
        .unwrap();
        assert_eq!(session.model(), ScannerModel::Model1600);
        assert!(observer.events().iter().any(|e| matches!(
            e,
            ScanEvent::ModelDetected {
                model: ScannerModel::Model1600
            }
        )));
    }

    #[test]
    fn test_init_rejects_bad_readback() {
        let mut sim = SimScanner::new(ScannerModel::Model1220);
        sim.corrupt_readback(CMD_CCD);
        let result = Session::open_with(
            sim,
            ScannerModel::Model1220,
            quick_options(),
            Arc::new(NullObserver),
        );
        assert!(matches!(
            result,
            Err(ScanError::Protocol(crate::protocol::ProtocolError::ReadbackMismatch {
                channel: CMD_CCD
            }))
        ));
    }

    #[test]
    fn test_full_page_gray_scan_at_150() {
        let mut session = open(ScannerModel::Model1220);
        let request = ScanRequest::new(0, 0, 5100, 7000, 150, ColorMode::Gray);
        let params = session.start_scan(&request).unwrap();
        assert_eq!(params.target_width, 1275);
        assert_eq!(params.target_height, 1750);
        assert_eq!(params.bytes_per_pixel, 1);
        assert_eq!(session.state(), SessionState::Scanning);

        let image = read_all(&mut session);
        assert_eq!(image.len(), 1275 * 1750);
        assert_eq!(session.state(), SessionState::Parked);
        assert_eq!(session.link().head(), 0);
    }

    #[test]
    fn test_color_scan_is_calibrated_and_flat() {
        let mut session = open(ScannerModel::Model2000);
        let identity = GammaTables::identity();
        for channel in 0..3 {
            session.set_gamma(channel, *identity.channel(channel)).unwrap();
        }
        let request = ScanRequest::new(600, 600, 600, 300, 300, ColorMode::Color);
        let params = session.start_scan(&request).unwrap();
        assert_eq!((params.target_width, params.target_height), (300, 150));

        let calibration = session.calibration().unwrap();
        assert!(calibration.auto);
        let image = read_all(&mut session);
        assert_eq!(image.len(), 300 * 150 * 3);

        let wb = ScannerModel::Model2000.white_balance();
        for (c, balance) in wb.iter().enumerate() {
            let target = 240.0 * balance;
            let worst = image
                .iter()
                .skip(c)
                .step_by(3)
                .map(|&v| (v as f64 - target).abs())
                .fold(0.0, f64::max);
            assert!(worst <= 4.0, "channel {} off by {}", c, worst);
        }
    }

    #[test]
    fn test_manual_calibration_skips_reference_scans() {
        let mut session = open(ScannerModel::Model1220);
        let references = session.link().reference_scans();
        let mut request = ScanRequest::new(0, 0, 600, 600, 75, ColorMode::Lineart);
        request.manual = Some(ManualCalibration {
            gains: [90; 3],
            offsets: [12; 3],
        });
        let params = session.start_scan(&request).unwrap();
        assert_eq!(session.link().reference_scans(), references);
        assert_eq!(params.bytes_per_line, 10);
        assert!(!session.calibration().unwrap().auto);
        // the flat table still goes out
        assert!(session.link().block(CMD_SHADING).is_some());
        let image = read_all(&mut session);
        assert_eq!(image.len(), 10 * 75);
    }

    #[test]
    fn test_cancel_stops_io() {
        let mut session = open(ScannerModel::Model1220);
        let request = ScanRequest::new(0, 0, 600, 600, 300, ColorMode::Gray);
        let params = session.start_scan(&request).unwrap();
        let first = session.read_block(1000, params.target_width, 300, false).unwrap();
        assert_eq!(first.len(), 1000);

        session.cancel_token().cancel();
        let ops = session.link().operations();
        let result = session.read_block(1000, params.target_width, 300, false);
        assert!(matches!(result, Err(ScanError::ScanAborted { .. })));
        assert_eq!(session.link().operations(), ops);
        assert_eq!(session.state(), SessionState::Idle);

        // the deferred park happens before the next scan
        let parks = session.link().parks();
        let small = ScanRequest::new(0, 0, 600, 600, 75, ColorMode::Gray);
        session.start_scan(&small).unwrap();
        assert_eq!(session.link().parks(), parks + 1);
        assert_eq!(read_all(&mut session).len(), 75 * 75);
    }

    #[test]
    fn test_read_failure_aborts_and_parks() {
        let mut session = open(ScannerModel::Model610);
        let request = ScanRequest::new(0, 0, 600, 600, 150, ColorMode::Color);
        let params = session.start_scan(&request).unwrap();
        session.link_mut().fail_data_reads();
        let result = session.read_block(100, params.target_width, 150, false);
        assert!(matches!(result, Err(ScanError::ScanAborted { .. })));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.link().head(), 0);
        assert!(session.cancel_token().is_cancelled());
    }

    #[test]
    fn test_read_block_checks_window() {
        let mut session = open(ScannerModel::Model610);
        let request = ScanRequest::new(0, 0, 300, 300, 150, ColorMode::Gray);
        session.start_scan(&request).unwrap();
        assert!(matches!(
            session.read_block(100, 10, 150, false),
            Err(ScanError::InvalidRequest(_))
        ));
        assert!(matches!(
            session.read_block(100, 150, 300, false),
            Err(ScanError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_last_block_finishes_scan() {
        let mut session = open(ScannerModel::Model1600);
        let request = ScanRequest::new(0, 0, 600, 600, 150, ColorMode::Gray);
        let params = session.start_scan(&request).unwrap();
        let block = session
            .read_block(usize::MAX, params.target_width, 150, true)
            .unwrap();
        assert_eq!(block.len(), 150 * 150);
        assert_eq!(session.state(), SessionState::Parked);
        assert!(matches!(
            session.read_block(10, params.target_width, 150, false),
            Err(ScanError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_start_scan_requires_idle() {
        let mut session = open(ScannerModel::Model1220);
        let request = ScanRequest::new(0, 0, 600, 600, 150, ColorMode::Gray);
        session.start_scan(&request).unwrap();
        assert!(matches!(
            session.start_scan(&request),
            Err(ScanError::InvalidState {
                operation: "start_scan",
                state: SessionState::Scanning
            })
        ));
    }

    #[test]
    fn test_lamp_control() {
        let mut session = open(ScannerModel::Model1220);
        session.set_lamp(false).unwrap();
        assert!(!session.link().lamp());
        session.set_lamp(true).unwrap();
        assert!(session.link().lamp());

        let mut direct = open(ScannerModel::Model610);
        let ops = direct.link().operations();
        direct.set_lamp(false).unwrap();
        assert_eq!(direct.link().operations(), ops);
    }

    #[test]
    fn test_close_parks_and_blocks_further_use() {
        let mut session = open(ScannerModel::Model1220);
        session.move_head(400, true).unwrap();
        assert_eq!(session.link().head(), session.head_position());
        session.close().unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.link().head(), 0);
        assert!(!session.link().lamp());
        assert!(matches!(session.status(), Err(ScanError::InvalidState { .. })));
    }
}
