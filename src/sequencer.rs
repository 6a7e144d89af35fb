//! Multi-frame operations built from single-parameter writes.

use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::bus::{CanBus, Frame};
use crate::error::{CommandError, TransportError};
use crate::protocol::{self, IDX_LIMIT_SPD, IDX_LOC_REF, IDX_RUNMODE, RUNMODE_CSP};
use crate::scanner::{ScanResult, Scanner};
use crate::session::{DeviceAddress, SessionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencerTiming {
    /// Pause after the mode/limit writes and after enabling.
    pub settle: Duration,
    /// Pause after SET_ID before rescanning, while the device takes its new address.
    pub reassign_settle: Duration,
}

impl Default for SequencerTiming {
    fn default() -> Self {
        SequencerTiming {
            settle: Duration::from_millis(5),
            reassign_settle: Duration::from_millis(50),
        }
    }
}

/// Outcome of a CSP move. Sends are best effort: one failure does not stop the rest.
#[derive(Debug)]
pub struct MoveReport {
    pub degrees: f32,
    pub radians: f32,
    pub limit: f32,
    pub failed_sends: Vec<(&'static str, TransportError)>,
}

impl MoveReport {
    pub fn all_sent(&self) -> bool {
        self.failed_sends.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct Sequencer {
    timing: SequencerTiming,
    scanner: Scanner,
}

impl Sequencer {
    pub fn new(timing: SequencerTiming, scanner: Scanner) -> Self {
        Sequencer { timing, scanner }
    }

    pub fn scan<B: CanBus + ?Sized>(&self, bus: &mut B, session: &mut SessionState) -> ScanResult {
        self.scanner.scan(bus, session)
    }

    /// Writes the CSP velocity ceiling and keeps it for later moves once sent.
    /// Negative values are clamped to zero.
    pub fn set_velocity_limit<B: CanBus + ?Sized>(
        &self,
        bus: &mut B,
        session: &mut SessionState,
        value: f32,
    ) -> Result<f32, CommandError> {
        if !value.is_finite() {
            return Err(CommandError::InvalidNumber(value.to_string()));
        }
        let target = session.require_address()?;
        let value = value.max(0.0);
        bus.send(&protocol::write_one_f32(target, IDX_LIMIT_SPD, value))?;
        session.velocity_limit = value;
        info!("CSP velocity limit for {} set to {:.3} rad/s", target, value);
        Ok(value)
    }

    /// Switches the device to CSP, applies the limit, enables it and writes the
    /// position reference. All four frames are always attempted.
    pub fn move_to_angle<B: CanBus + ?Sized>(
        &self,
        bus: &mut B,
        session: &SessionState,
        degrees: f32,
    ) -> Result<MoveReport, CommandError> {
        if !degrees.is_finite() {
            return Err(CommandError::InvalidNumber(degrees.to_string()));
        }
        let target = session.require_address()?;
        let radians = degrees.to_radians();
        let limit = session.velocity_limit;
        let mut report = MoveReport {
            degrees,
            radians,
            limit,
            failed_sends: Vec::new(),
        };

        let mut step = |label: &'static str, frame: Frame| {
            debug!("{}: {}", target, label);
            if let Err(e) = bus.send(&frame) {
                warn!("{} to {} failed: {}", label, target, e);
                report.failed_sends.push((label, e));
            }
        };

        step("runmode=CSP", protocol::write_one_u8(target, IDX_RUNMODE, RUNMODE_CSP));
        step("limit_spd", protocol::write_one_f32(target, IDX_LIMIT_SPD, limit));
        thread::sleep(self.timing.settle);
        step("enable", protocol::run_enable(target));
        thread::sleep(self.timing.settle);
        step("loc_ref", protocol::write_one_f32(target, IDX_LOC_REF, radians));

        Ok(report)
    }

    /// Renumbers the current device, then rescans so the session follows it.
    pub fn set_device_address<B: CanBus + ?Sized>(
        &self,
        bus: &mut B,
        session: &mut SessionState,
        new_address: i64,
    ) -> Result<ScanResult, CommandError> {
        let new_address = DeviceAddress::try_from(new_address)?;
        let current = session.require_address()?;

        bus.send(&protocol::set_id(current, new_address))?;
        info!("SET_ID {} -> {} sent, rescanning", current, new_address);
        thread::sleep(self.timing.reassign_settle);

        let result = self.scanner.scan(bus, session);
        if result.last_seen.is_some_and(|found| found != new_address) {
            warn!(
                "Expected the device to answer as {}, got {}",
                new_address,
                crate::session::display_address(result.last_seen)
            );
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::MockBus;
    use crate::protocol::{decode_identifier, get_id_reply, COMM_GET_ID, COMM_RUN_ENABLE, COMM_SET_ID, COMM_WRITE_ONE};
    use crate::scanner::ScanConfig;

    fn fast_sequencer() -> Sequencer {
        Sequencer::new(
            SequencerTiming {
                settle: Duration::ZERO,
                reassign_settle: Duration::ZERO,
            },
            Scanner::new(ScanConfig {
                window: Duration::from_millis(20),
                poll_tick: Duration::from_millis(1),
                probe_spacing: Duration::ZERO,
            }),
        )
    }

    fn addr(raw: u8) -> DeviceAddress {
        DeviceAddress::new(raw).unwrap()
    }

    fn index(frame: &Frame) -> u16 {
        u16::from_le_bytes([frame.data[0], frame.data[1]])
    }

    fn value_f32(frame: &Frame) -> f32 {
        f32::from_le_bytes([frame.data[4], frame.data[5], frame.data[6], frame.data[7]])
    }

    #[test]
    fn move_to_angle_sends_four_frames_in_order() {
        let mut bus = MockBus::default();
        let session = SessionState::new(Some(addr(0x12)), 10.0);
        let report = fast_sequencer().move_to_angle(&mut bus, &session, 90.0).unwrap();

        assert!(report.all_sent());
        assert!((report.radians - 1.570796).abs() < 1e-5);
        assert_eq!(report.limit, 10.0);
        assert_eq!(bus.sent.len(), 4);
        for frame in &bus.sent {
            assert_eq!(decode_identifier(frame.id).2, 0x12);
        }

        let runmode = &bus.sent[0];
        assert_eq!(decode_identifier(runmode.id).0, COMM_WRITE_ONE);
        assert_eq!(index(runmode), IDX_RUNMODE);
        assert_eq!(runmode.data[4..], [5, 0, 0, 0]);

        let limit = &bus.sent[1];
        assert_eq!(decode_identifier(limit.id).0, COMM_WRITE_ONE);
        assert_eq!(index(limit), IDX_LIMIT_SPD);
        assert_eq!(value_f32(limit), 10.0);

        let enable = &bus.sent[2];
        assert_eq!(decode_identifier(enable.id), (COMM_RUN_ENABLE, 0xFD00, 0x12));

        let loc_ref = &bus.sent[3];
        assert_eq!(decode_identifier(loc_ref.id).0, COMM_WRITE_ONE);
        assert_eq!(index(loc_ref), IDX_LOC_REF);
        assert!((value_f32(loc_ref) - 1.570796).abs() < 1e-5);
    }

    #[test]
    fn move_to_angle_keeps_going_after_a_failed_send() {
        let mut bus = MockBus::default();
        bus.fail_sends.insert(1);
        let session = SessionState::new(Some(addr(0x12)), 3.0);
        let report = fast_sequencer().move_to_angle(&mut bus, &session, -45.0).unwrap();

        assert!(!report.all_sent());
        assert_eq!(report.failed_sends.len(), 1);
        assert_eq!(report.failed_sends[0].0, "limit_spd");
        assert_eq!(bus.sent.len(), 3);
        assert_eq!(index(&bus.sent[2]), IDX_LOC_REF);
    }

    #[test]
    fn move_to_angle_needs_an_address() {
        let mut bus = MockBus::default();
        let session = SessionState::new(None, 10.0);
        let result = fast_sequencer().move_to_angle(&mut bus, &session, 10.0);

        assert!(matches!(result, Err(CommandError::NoCurrentAddress)));
        assert!(bus.sent.is_empty());
    }

    #[test]
    fn velocity_limit_is_kept_on_success() {
        let mut bus = MockBus::default();
        let mut session = SessionState::new(Some(addr(0x7F)), 10.0);
        let applied = fast_sequencer()
            .set_velocity_limit(&mut bus, &mut session, 4.5)
            .unwrap();

        assert_eq!(applied, 4.5);
        assert_eq!(session.velocity_limit, 4.5);
        assert_eq!(bus.sent.len(), 1);
        assert_eq!(index(&bus.sent[0]), IDX_LIMIT_SPD);
        assert_eq!(value_f32(&bus.sent[0]), 4.5);
    }

    #[test]
    fn negative_velocity_limit_is_clamped() {
        let mut bus = MockBus::default();
        let mut session = SessionState::default();
        let applied = fast_sequencer()
            .set_velocity_limit(&mut bus, &mut session, -2.0)
            .unwrap();

        assert_eq!(applied, 0.0);
        assert_eq!(session.velocity_limit, 0.0);
        assert_eq!(value_f32(&bus.sent[0]), 0.0);
    }

    #[test]
    fn velocity_limit_is_not_kept_when_send_fails() {
        let mut bus = MockBus::default();
        bus.fail_sends.insert(0);
        let mut session = SessionState::default();
        let result = fast_sequencer().set_velocity_limit(&mut bus, &mut session, 7.0);

        assert!(matches!(result, Err(CommandError::Transport(TransportError::Send(_)))));
        assert_eq!(session.velocity_limit, 10.0);
    }

    #[test]
    fn set_address_without_scan_is_rejected() {
        let mut bus = MockBus::default();
        let mut session = SessionState::new(None, 10.0);
        let result = fast_sequencer().set_device_address(&mut bus, &mut session, 5);

        assert!(matches!(result, Err(CommandError::NoCurrentAddress)));
        assert!(bus.sent.is_empty());
    }

    #[test]
    fn set_address_without_rescan_reply_keeps_old_address() {
        let mut bus = MockBus::default();
        let mut session = SessionState::new(Some(addr(0x7F)), 10.0);
        let result = fast_sequencer()
            .set_device_address(&mut bus, &mut session, 0x15)
            .unwrap();

        assert_eq!(decode_identifier(bus.sent[0].id).0, COMM_SET_ID);
        assert!(!result.found());
        assert_eq!(result.replies, 0);
        assert_eq!(session.current_address, Some(addr(0x7F)));
    }

    #[test]
    fn set_address_follows_whoever_answers_the_rescan() {
        let mut bus = MockBus::default();
        bus.replies_after_set_id.push(get_id_reply(0x30));
        let mut session = SessionState::new(Some(addr(0x7F)), 10.0);
        let result = fast_sequencer()
            .set_device_address(&mut bus, &mut session, 0x15)
            .unwrap();

        assert_eq!(result.last_seen, Some(addr(0x30)));
        assert_eq!(session.current_address, Some(addr(0x30)));
    }

    #[test]
    fn set_address_out_of_range_is_rejected() {
        let mut bus = MockBus::default();
        let mut session = SessionState::default();
        let result = fast_sequencer().set_device_address(&mut bus, &mut session, 200);

        assert!(matches!(result, Err(CommandError::AddressOutOfRange(200))));
        assert!(bus.sent.is_empty());
        assert_eq!(session, SessionState::default());
    }

    #[test]
    fn set_address_sends_set_id_then_rescans() {
        let mut bus = MockBus::default();
        bus.replies_after_set_id.push(get_id_reply(0x15));
        let mut session = SessionState::new(Some(addr(0x7F)), 10.0);
        let result = fast_sequencer()
            .set_device_address(&mut bus, &mut session, 0x15)
            .unwrap();

        assert_eq!(decode_identifier(bus.sent[0].id), (COMM_SET_ID, 0x15FD, 0x7F));
        assert_eq!(bus.sent.len(), 1 + 128);
        assert!(bus.sent[1..]
            .iter()
            .all(|frame| decode_identifier(frame.id).0 == COMM_GET_ID));
        assert_eq!(result.last_seen, Some(addr(0x15)));
        assert_eq!(session.current_address, Some(addr(0x15)));
    }

    #[test]
    fn failed_set_id_skips_the_rescan() {
        let mut bus = MockBus::default();
        bus.fail_sends.insert(0);
        let mut session = SessionState::new(Some(addr(0x01)), 10.0);
        let result = fast_sequencer().set_device_address(&mut bus, &mut session, 0x02);

        assert!(matches!(result, Err(CommandError::Transport(_))));
        assert!(bus.sent.is_empty());
        assert_eq!(session.current_address, Some(addr(0x01)));
    }
}
