//! Exclusive handle on an attached scanner.

use tracing::{debug, info, instrument};

use crate::config::DriverConfig;
use crate::error::ScanError;
use crate::model::{AsicFamily, ScannerModel};
use crate::pipeline::DEFAULT_FILTER;
use crate::port::{ParallelPort, PortLock, PortSpec};
use crate::probe::{ProbeReport, probe};
use crate::protocol::constants::{CMD_FILTER, FILTER_BLOCK_LEN};
use crate::protocol::{Link, LinkWarning, ProtocolError, ScannerLink, SyncOp};
use crate::session::SessionOptions;
use crate::transport::TransportMode;
use crate::transport::signals::{CMD_DISCONNECT, handshake_sequence};

/// A probed scanner on a claimed port.
///
/// The port stays claimed until the connection is dropped, which also
/// sends the disconnect handshake.
pub struct Connection {
    link: Link<Box<dyn ParallelPort>>,
    report: ProbeReport,
    forced_model: Option<ScannerModel>,
    options: SessionOptions,
    lock: PortLock,
}

impl Connection {
    /// Attach with default settings.
    pub fn attach(spec: &PortSpec) -> Result<Self, ScanError> {
        Self::attach_with(&DriverConfig {
            port: spec.clone(),
            ..Default::default()
        })
    }

    /// Claim, open and probe the configured port.
    pub fn attach_with(config: &DriverConfig) -> Result<Self, ScanError> {
        let lock = PortLock::acquire(&config.port.to_string())?;
        let port = config.port.open()?;
        Self::attach_locked(lock, port, config)
    }

    /// Probe an already opened port.
    pub fn attach_port(port: Box<dyn ParallelPort>, config: &DriverConfig) -> Result<Self, ScanError> {
        let lock = PortLock::acquire(port.name())?;
        Self::attach_locked(lock, port, config)
    }

    #[instrument(level = "info", skip_all, fields(port = %lock.name()))]
    fn attach_locked(
        lock: PortLock,
        port: Box<dyn ParallelPort>,
        config: &DriverConfig,
    ) -> Result<Self, ScanError> {
        let (transport, report) = probe(port, &config.probe_options())?;
        info!(family = %report.family, mode = %report.mode, "Scanner attached");
        Ok(Self {
            link: Link::new(transport, report.family),
            report,
            forced_model: config.model,
            options: SessionOptions::from(config),
            lock,
        })
    }

    /// Identify the model. A model forced by configuration wins; the 610
    /// is the only direct chip; the 2000 modifies an uploaded filter block
    /// on readback where the 1220 and 1600 return it unchanged.
    pub fn probe_model(&mut self) -> Result<ScannerModel, ScanError> {
        if let Some(model) = self.forced_model {
            debug!(model = %model, "Model forced by configuration");
            return Ok(model);
        }
        if self.report.family == AsicFamily::Direct {
            return Ok(ScannerModel::Model610);
        }
        self.link.cmd_set(CMD_FILTER, &DEFAULT_FILTER)?;
        let back = self.link.cmd_get(CMD_FILTER, FILTER_BLOCK_LEN)?;
        let model = if back == DEFAULT_FILTER {
            ScannerModel::Model1220
        } else {
            ScannerModel::Model2000
        };
        info!(model = %model, "Model identified");
        Ok(model)
    }

    pub fn report(&self) -> &ProbeReport {
        &self.report
    }

    pub fn family(&self) -> AsicFamily {
        self.report.family
    }

    pub fn mode(&self) -> TransportMode {
        self.report.mode
    }

    pub fn port_name(&self) -> &str {
        self.lock.name()
    }

    pub fn forced_model(&self) -> Option<ScannerModel> {
        self.forced_model
    }

    pub fn session_options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn link_mut(&mut self) -> &mut Link<Box<dyn ParallelPort>> {
        &mut self.link
    }
}

impl ScannerLink for Connection {
    fn family(&self) -> AsicFamily {
        self.link.family()
    }

    fn cmd_set(&mut self, channel: u8, data: &[u8]) -> Result<(), ProtocolError> {
        self.link.cmd_set(channel, data)
    }

    fn cmd_get(&mut self, channel: u8, len: usize) -> Result<Vec<u8>, ProtocolError> {
        self.link.cmd_get(channel, len)
    }

    fn cmd_get_buffer(&mut self, channel: u8, len: usize) -> Result<Vec<u8>, ProtocolError> {
        self.link.cmd_get_buffer(channel, len)
    }

    fn cmd_sync(&mut self, op: SyncOp) -> Result<(), ProtocolError> {
        self.link.cmd_sync(op)
    }

    fn scanner_status(&mut self) -> Result<u8, ProtocolError> {
        self.link.scanner_status()
    }

    fn take_warnings(&mut self) -> Vec<LinkWarning> {
        self.link.take_warnings()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.report.family != AsicFamily::Bridged {
            return;
        }
        let goodbye = handshake_sequence(CMD_DISCONNECT);
        if let Err(e) = self.link.transport_mut().send_handshake(&goodbye) {
            debug!(error = %e, "Disconnect handshake failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{MockChip, MockPort, PortError};

    fn quick_config() -> DriverConfig {
        DriverConfig {
            ring_count: 1,
            ring_delay_ms: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_attach_detects_bridged_1220() {
        let mock = MockPort::new().named("conn-1220");
        let mut connection = Connection::attach_port(Box::new(mock.clone()), &quick_config()).unwrap();
        assert_eq!(connection.family(), AsicFamily::Bridged);
        assert_eq!(connection.mode(), TransportMode::Epp32);
        assert_eq!(connection.probe_model().unwrap(), ScannerModel::Model1220);
        assert!(mock.is_connected());
        drop(connection);
        assert!(!mock.is_connected());
    }

    #[test]
    fn test_modified_filter_means_2000() {
        let mock = MockPort::new().named("conn-2000");
        let mut connection = Connection::attach_port(Box::new(mock.clone()), &quick_config()).unwrap();
        mock.queue_block_read(&[0x00, 0x08, 0x10, 0x20, 0x40, 0x20, 0x10, 0x08]);
        assert_eq!(connection.probe_model().unwrap(), ScannerModel::Model2000);
    }

    #[test]
    fn test_direct_chip_is_610() {
        let mock = MockPort::direct().named("conn-610");
        let mut connection = Connection::attach_port(Box::new(mock), &quick_config()).unwrap();
        assert_eq!(connection.probe_model().unwrap(), ScannerModel::Model610);
    }

    #[test]
    fn test_forced_model_skips_detection() {
        let mock = MockPort::new().named("conn-forced");
        let config = DriverConfig {
            model: Some(ScannerModel::Model1600),
            ..quick_config()
        };
        let mut connection = Connection::attach_port(Box::new(mock.clone()), &config).unwrap();
        mock.clear_writes();
        assert_eq!(connection.probe_model().unwrap(), ScannerModel::Model1600);
        assert!(mock.block_writes().is_empty());
    }

    #[test]
    fn test_second_attach_is_rejected() {
        let first = Connection::attach_port(Box::new(MockPort::new().named("conn-busy")), &quick_config()).unwrap();
        let second = Connection::attach_port(Box::new(MockPort::new().named("conn-busy")), &quick_config());
        assert!(matches!(second, Err(ScanError::Port(PortError::Busy { .. }))));
        drop(first);
        assert!(Connection::attach_port(Box::new(MockPort::new().named("conn-busy")), &quick_config()).is_ok());
    }

    #[test]
    fn test_absent_scanner() {
        let mock = MockPort::with_chip(MockChip::Absent).named("conn-absent");
        let result = Connection::attach_port(Box::new(mock), &quick_config());
        assert!(matches!(result, Err(ScanError::ModelDetection { .. })));
        // the claim is released on failure
        assert!(PortLock::acquire("conn-absent").is_ok());
    }
}
