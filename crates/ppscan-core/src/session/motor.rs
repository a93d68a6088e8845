//! Head movement and lamp control.

use std::thread;

use tracing::{debug, info};

use super::{ScannerStatus, Session, SessionState};
use crate::error::ScanError;
use crate::events::{ScanEvent, ScanObserver};
use crate::model::AsicFamily;
use crate::pipeline::MotorCommand;
use crate::protocol::constants::{CMD_MOTOR, MOTOR_BLOCK_LEN};
use crate::protocol::{ProtocolError, ScannerLink, SyncOp};
use crate::transport::{Attempt, retry_with_limit};

/// Lines of the homing strip scan.
pub const ORIGIN_LINES: usize = 128;
/// Pixels of the homing strip scan, centred on the sensor.
pub const ORIGIN_WIDTH: usize = 64;
/// Motor steps from the strip edge to the glass origin.
pub const ORIGIN_OFFSET_STEPS: i32 = 180;
/// Strip level above which a bridged non-2000 scanner is a 1600.
pub const SUBMODEL_THRESHOLD: f64 = 140.0;

impl<L: ScannerLink, O: ScanObserver> Session<L, O> {
    /// Upload a motor block and run it.
    pub(super) fn drive(&mut self, command: MotorCommand) -> Result<(), ScanError> {
        self.link.cmd_set(CMD_MOTOR, &command.to_bytes())?;
        self.link.cmd_sync(SyncOp::Commit)?;
        Ok(())
    }

    /// Move the head by a signed step count; negative moves towards home.
    pub fn move_head(&mut self, steps: i32, precise: bool) -> Result<(), ScanError> {
        self.require("move_head", &[SessionState::Connected, SessionState::Idle, SessionState::Parked])?;
        debug!(steps, precise, from = self.head, "Moving head");
        self.drive(MotorCommand::relative(steps, precise, self.lamp))?;
        self.head = (self.head + steps).max(0);
        if self.state == SessionState::Parked && self.head != 0 {
            self.set_state(SessionState::Idle);
        }
        Ok(())
    }

    /// Send the head home without waiting for it to arrive.
    pub fn park(&mut self) -> Result<(), ScanError> {
        self.require("park", &[])?;
        if self.active.take().is_some() {
            self.emit(ScanEvent::Aborted {
                reason: "parked during scan".into(),
            });
        }
        info!(from = self.head, "Parking head");
        self.drive(MotorCommand::park(self.lamp))?;
        self.head = 0;
        self.park_pending = false;
        self.set_state(SessionState::Parked);
        Ok(())
    }

    /// Poll the motor status until the head is home.
    pub fn park_wait(&mut self) -> Result<(), ScanError> {
        self.require("park_wait", &[])?;
        let limit = self.options.park_poll_limit;
        let interval = self.options.park_poll_interval;
        let link = &mut self.link;
        let parked = retry_with_limit(limit, |attempt| {
            if attempt > 0 && !interval.is_zero() {
                thread::sleep(interval);
            }
            let status = link.scanner_status()?;
            Ok::<_, ProtocolError>(match ScannerStatus::from_byte(status) {
                ScannerStatus::Idle => Attempt::Done(()),
                ScannerStatus::Busy => Attempt::Retry,
            })
        })?;
        match parked {
            Some(()) => Ok(()),
            None => Err(ProtocolError::StatusTimeout { polls: limit }.into()),
        }
    }

    /// Switch the lamp. The 610 has no lamp control and ignores this.
    pub fn set_lamp(&mut self, on: bool) -> Result<(), ScanError> {
        self.require("set_lamp", &[])?;
        if self.model.family() == AsicFamily::Direct {
            self.lamp = on;
            return Ok(());
        }
        let block = self.link.cmd_get(CMD_MOTOR, MOTOR_BLOCK_LEN)?;
        let mut command = MotorCommand::from_bytes(&block)?;
        command.lamp = on;
        self.link.cmd_set(CMD_MOTOR, &command.to_bytes())?;
        self.lamp = on;
        debug!(on, "Lamp switched");
        Ok(())
    }
}
