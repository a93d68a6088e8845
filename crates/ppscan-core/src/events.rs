//! Event system for front-end decoupling.
//!
//! Lets the CLI (or any other front end) follow a session without the core
//! knowing how progress is displayed.

use crate::calibration::CalibrationError;
use crate::model::ScannerModel;
use crate::probe::ProbeReport;
use crate::protocol::LinkWarning;
use crate::session::SessionState;

/// Events emitted by a scanner session.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    /// Probe finished on a port.
    Attached { port: String, report: ProbeReport },
    /// Model identified (or refined during homing).
    ModelDetected { model: ScannerModel },
    /// Session state changed.
    StateChanged { from: SessionState, to: SessionState },
    /// Output rows delivered so far.
    Progress { rows: usize, total: usize },
    /// Status byte the link had to guess at.
    LinkWarning(LinkWarning),
    /// A calibration stage kept its best value without converging.
    CalibrationWarning(CalibrationError),
    /// Analog settings used for the next scan.
    Calibrated {
        gains: [u8; 3],
        offsets: [u8; 3],
        auto: bool,
    },
    /// Error occurred.
    Error { message: String },
    /// All image data delivered.
    ScanComplete { rows: usize },
    /// Scan ended early.
    Aborted { reason: String },
}

/// Observer trait for receiving scan events.
///
/// Implement this trait in your front end to receive updates.
pub trait ScanObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &ScanEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl ScanObserver for NullObserver {
    fn on_event(&self, _event: &ScanEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl ScanObserver for TracingObserver {
    fn on_event(&self, event: &ScanEvent) {
        match event {
            ScanEvent::Attached { port, report } => {
                tracing::info!(
                    port = %port,
                    family = %report.family,
                    mode = %report.mode,
                    "Scanner attached"
                );
            }
            ScanEvent::ModelDetected { model } => {
                tracing::info!(model = %model, "Model detected");
            }
            ScanEvent::StateChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "State changed");
            }
            ScanEvent::Progress { rows, total } => {
                let pct = if *total > 0 { rows * 100 / total } else { 0 };
                tracing::debug!(rows, total, progress = %format!("{}%", pct), "Progress");
            }
            ScanEvent::LinkWarning(warning) => {
                tracing::warn!(%warning, "Link warning");
            }
            ScanEvent::CalibrationWarning(error) => {
                tracing::warn!(%error, "Calibration warning");
            }
            ScanEvent::Calibrated {
                gains,
                offsets,
                auto,
            } => {
                tracing::info!(?gains, ?offsets, auto, "Calibrated");
            }
            ScanEvent::Error { message } => {
                tracing::error!("Error: {}", message);
            }
            ScanEvent::ScanComplete { rows } => {
                tracing::info!(rows, "Scan complete");
            }
            ScanEvent::Aborted { reason } => {
                tracing::warn!(reason = %reason, "Scan aborted");
            }
        }
    }
}

/// Observer that keeps every event, for tests and front ends that poll.
#[derive(Default)]
pub struct RecordingObserver {
    events: std::sync::Mutex<Vec<ScanEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ScanEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl ScanObserver for RecordingObserver {
    fn on_event(&self, event: &ScanEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
