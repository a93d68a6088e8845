//! Scanner and transfer mode detection.
//!
//! Runs once per attach: ring test, connect handshake with a version check,
//! fallback to the direct chip's sync handshake, then the transfer mode
//! ladder.

use std::thread;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::error::ScanError;
use crate::model::AsicFamily;
use crate::port::ParallelPort;
use crate::protocol::constants::{ASIC_VERSION, LINK_READY, REG_VERSION, SYNC_MAGIC};
use crate::transport::signals::{
    CMD_CONNECT, CMD_DISCONNECT, CMD_RING, RING_ACK, STATUS_MASK, handshake_sequence,
};
use crate::transport::{Transport, TransportError, TransportMode};

/// Size of the round-trip test pattern.
pub const ROUND_TRIP_LEN: usize = 1024;
/// Consecutive bit-exact round trips required to accept a mode.
pub const ROUND_TRIP_REPEATS: usize = 10;

/// Probe settings.
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    /// Ring handshakes sent before giving up on an acknowledge.
    pub ring_count: u32,
    /// Delay between ring handshakes.
    pub ring_delay: Duration,
    /// Modes the ladder may select.
    pub allowed_modes: Vec<TransportMode>,
    /// Validate only this mode instead of running the ladder.
    pub force_mode: Option<TransportMode>,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            ring_count: 3,
            ring_delay: Duration::from_millis(10),
            allowed_modes: TransportMode::LADDER.to_vec(),
            force_mode: None,
        }
    }
}

/// What the probe found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub family: AsicFamily,
    pub mode: TransportMode,
    /// Whether any ring handshake was acknowledged.
    pub ring_acknowledged: bool,
    /// Modes that passed the round-trip test, in ladder order.
    pub modes_passed: Vec<TransportMode>,
}

/// Ascending values on even indices, descending on odd ones.
pub fn round_trip_pattern(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| {
            let half = (i / 2) as u8;
            if i % 2 == 0 { half } else { 0xFF - half }
        })
        .collect()
}

/// Run the full probe on `port`.
#[instrument(level = "info", skip_all, fields(port = %port.name()))]
pub fn probe<P: ParallelPort>(
    port: P,
    options: &ProbeOptions,
) -> Result<(Transport<P>, ProbeReport), ScanError> {
    let mut transport = Transport::new(port, TransportMode::Ps2);

    let ring_acknowledged = ring_test(&mut transport, options.ring_count, options.ring_delay)?;
    let family = detect_family(&mut transport)?;
    info!(family = %family, "Scanner family detected");

    let (mode, modes_passed) = select_mode(&mut transport, options)?;
    transport.set_mode(mode);
    info!(mode = %mode, "Transfer mode selected");

    Ok((
        transport,
        ProbeReport {
            family,
            mode,
            ring_acknowledged,
            modes_passed,
        },
    ))
}

/// Presence ring. Only informative: a missing acknowledge is logged.
pub fn ring_test<P: ParallelPort>(
    transport: &mut Transport<P>,
    count: u32,
    delay: Duration,
) -> Result<bool, ScanError> {
    for attempt in 1..=count {
        transport.send_handshake(&handshake_sequence(CMD_RING))?;
        let status = transport.raw_status()? & STATUS_MASK;
        if status == RING_ACK {
            debug!(attempt, "Ring acknowledged");
            return Ok(true);
        }
        debug!(attempt, status = format!("0x{:02X}", status), "No ring acknowledge");
        if attempt < count && !delay.is_zero() {
            thread::sleep(delay);
        }
    }
    if count > 0 {
        warn!(count, "Ring test got no acknowledge, continuing");
    }
    Ok(false)
}

/// Connect handshake plus version check, falling back to the direct sync.
pub fn detect_family<P: ParallelPort>(
    transport: &mut Transport<P>,
) -> Result<AsicFamily, ScanError> {
    transport.send_handshake(&handshake_sequence(CMD_CONNECT))?;
    let version = transport.read_register(REG_VERSION)?;
    if version == ASIC_VERSION {
        return Ok(AsicFamily::Bridged);
    }
    debug!(
        version = format!("0x{:02X}", version),
        "Version register mismatch, trying direct sync"
    );
    transport.send_handshake(&handshake_sequence(CMD_DISCONNECT))?;

    transport.send_handshake(&SYNC_MAGIC)?;
    let status = transport.raw_status()? & STATUS_MASK;
    if status == LINK_READY {
        return Ok(AsicFamily::Direct);
    }
    Err(ScanError::ModelDetection {
        reason: format!(
            "no answer to connect (version 0x{:02X}) or sync (status 0x{:02X})",
            version, status
        ),
    })
}

/// Round-trip `pattern` through the block buffer `repeats` times.
pub fn round_trip<P: ParallelPort>(
    transport: &mut Transport<P>,
    pattern: &[u8],
    repeats: usize,
) -> Result<bool, TransportError> {
    for rep in 0..repeats {
        transport.write_block(pattern)?;
        let back = transport.read_block(pattern.len())?;
        if back != pattern {
            let first_bad = back.iter().zip(pattern).position(|(a, b)| a != b);
            debug!(mode = %transport.mode(), rep, ?first_bad, "Round trip mismatch");
            return Ok(false);
        }
    }
    Ok(true)
}

fn mode_supported<P: ParallelPort>(transport: &Transport<P>, mode: TransportMode) -> bool {
    let caps = transport.port().capabilities();
    match mode {
        TransportMode::Ps2 => true,
        TransportMode::Byte => caps.bidirectional,
        TransportMode::Epp8 | TransportMode::Epp32 => caps.epp,
        TransportMode::Ecp => caps.ecp,
    }
}

fn validate_mode<P: ParallelPort>(transport: &mut Transport<P>, mode: TransportMode) -> bool {
    transport.set_mode(mode);
    let pattern = round_trip_pattern(ROUND_TRIP_LEN);
    match round_trip(transport, &pattern, ROUND_TRIP_REPEATS) {
        Ok(passed) => passed,
        Err(e) => {
            debug!(mode = %mode, error = %e, "Round trip failed");
            false
        }
    }
}

/// Walk the mode ladder.
///
/// Rungs that fail before any mode has passed are skipped. Once a mode has
/// passed, the first failing rung ends the ladder and the last passing mode
/// is kept.
pub fn select_mode<P: ParallelPort>(
    transport: &mut Transport<P>,
    options: &ProbeOptions,
) -> Result<(TransportMode, Vec<TransportMode>), ScanError> {
    if let Some(mode) = options.force_mode {
        if mode_supported(transport, mode) && validate_mode(transport, mode) {
            return Ok((mode, vec![mode]));
        }
        return Err(ScanError::ModelDetection {
            reason: format!("forced transfer mode {} failed the round-trip test", mode),
        });
    }

    let mut passed = Vec::new();
    for mode in TransportMode::LADDER {
        if !options.allowed_modes.contains(&mode) {
            debug!(mode = %mode, "Mode disabled by configuration");
            continue;
        }
        if !mode_supported(transport, mode) {
            debug!(mode = %mode, "Mode not supported by the port");
            continue;
        }
        if validate_mode(transport, mode) {
            debug!(mode = %mode, "Mode passed");
            passed.push(mode);
        } else if !passed.is_empty() {
            info!(mode = %mode, "Mode failed, keeping the previous one");
            break;
        }
    }

    match passed.last() {
        Some(&mode) => Ok((mode, passed)),
        None => Err(ScanError::ModelDetection {
            reason: "no transfer mode passed the round-trip test".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{MockChip, MockPort, PortCapabilities};

    fn quick() -> ProbeOptions {
        ProbeOptions {
            ring_count: 1,
            ring_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    fn with_ecp(mock: MockPort) -> MockPort {
        mock.with_capabilities(PortCapabilities {
            bidirectional: true,
            epp: true,
            ecp: true,
        })
    }

    #[test]
    fn test_pattern_interleaves() {
        let pattern = round_trip_pattern(ROUND_TRIP_LEN);
        assert_eq!(&pattern[..6], &[0x00, 0xFF, 0x01, 0xFE, 0x02, 0xFD]);
        assert_eq!(pattern[1023], 0xFF - 511u16 as u8);
    }

    #[test]
    fn test_probe_bridged_prefers_ecp_when_everything_passes() {
        let mock = with_ecp(MockPort::new());
        let (transport, report) = probe(mock.clone(), &quick()).unwrap();
        assert_eq!(report.family, AsicFamily::Bridged);
        assert!(report.ring_acknowledged);
        assert_eq!(report.mode, TransportMode::Ecp);
        assert_eq!(report.modes_passed, TransportMode::LADDER.to_vec());
        assert_eq!(transport.mode(), TransportMode::Ecp);
    }

    #[test]
    fn test_probe_epp32_failure_selects_epp8_and_skips_ecp() {
        let mock = with_ecp(MockPort::new());
        mock.corrupt_epp32();
        let (_, report) = probe(mock.clone(), &quick()).unwrap();
        assert_eq!(report.mode, TransportMode::Epp8);
        assert_eq!(
            report.modes_passed,
            vec![TransportMode::Ps2, TransportMode::Epp8]
        );
        assert_eq!(mock.ecr_writes(), 0);
    }

    #[test]
    fn test_probe_without_ecp_stops_at_epp32() {
        let (_, report) = probe(MockPort::new(), &quick()).unwrap();
        assert_eq!(report.mode, TransportMode::Epp32);
    }

    #[test]
    fn test_probe_direct_family() {
        let mock = MockPort::direct();
        let (_, report) = probe(mock, &quick()).unwrap();
        assert_eq!(report.family, AsicFamily::Direct);
        assert_eq!(report.mode, TransportMode::Epp32);
    }

    #[test]
    fn test_probe_absent_scanner() {
        let mock = MockPort::with_chip(MockChip::Absent);
        assert!(matches!(
            probe(mock, &quick()),
            Err(ScanError::ModelDetection { .. })
        ));
    }

    #[test]
    fn test_probe_respects_allowed_modes() {
        let options = ProbeOptions {
            allowed_modes: vec![TransportMode::Ps2, TransportMode::Epp8],
            ..quick()
        };
        let (_, report) = probe(with_ecp(MockPort::new()), &options).unwrap();
        assert_eq!(report.mode, TransportMode::Epp8);
    }

    #[test]
    fn test_probe_forced_mode() {
        let options = ProbeOptions {
            force_mode: Some(TransportMode::Byte),
            ..quick()
        };
        let (_, report) = probe(MockPort::new(), &options).unwrap();
        assert_eq!(report.mode, TransportMode::Byte);

        let options = ProbeOptions {
            force_mode: Some(TransportMode::Ecp),
            ..quick()
        };
        assert!(probe(MockPort::new(), &options).is_err());
    }

    #[test]
    fn test_probe_port_fault_propagates() {
        let mock = MockPort::new();
        mock.fail_after(3);
        assert!(matches!(
            probe(mock, &quick()),
            Err(ScanError::Transport(TransportError::Port(_)))
        ));
    }
}
