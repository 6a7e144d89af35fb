//! Bus discovery: probe every device address with GET_ID, then listen.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::bus::CanBus;
use crate::protocol::{self, DEFAULT_SCAN_WINDOW, POLL_TICK, PROBE_SPACING};
use crate::session::{DeviceAddress, SessionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanConfig {
    /// How long to collect replies after the last probe.
    pub window: Duration,
    /// Per-call receive timeout while collecting.
    pub poll_tick: Duration,
    /// Gap between probes so the adapter queue does not overflow.
    pub probe_spacing: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig {
            window: DEFAULT_SCAN_WINDOW,
            poll_tick: POLL_TICK,
            probe_spacing: PROBE_SPACING,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    /// Address from the last qualifying reply; later replies overwrite earlier ones.
    pub last_seen: Option<DeviceAddress>,
    pub replies: usize,
    pub probes_failed: usize,
    pub window: Duration,
}

impl ScanResult {
    pub fn found(&self) -> bool {
        self.last_seen.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Scanner {
    config: ScanConfig,
    interrupt: Option<Arc<AtomicBool>>,
}

impl Scanner {
    pub fn new(config: ScanConfig) -> Self {
        Scanner {
            config,
            interrupt: None,
        }
    }

    /// Ends the receive window early once `flag` is set.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    fn interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Probes all addresses and listens for one window.
    ///
    /// On at least one reply the session's current address becomes the last
    /// responder; with no reply the session is left as it was.
    pub fn scan<B: CanBus + ?Sized>(&self, bus: &mut B, session: &mut SessionState) -> ScanResult {
        let mut result = ScanResult {
            window: self.config.window,
            ..Default::default()
        };

        info!("Sending GET_ID to all addresses...");
        for target in DeviceAddress::all() {
            if let Err(e) = bus.send(&protocol::get_id_probe(target)) {
                debug!("GET_ID probe to {} failed: {}", target, e);
                result.probes_failed += 1;
            }
            spin_sleep::sleep(self.config.probe_spacing);
        }
        if result.probes_failed > 0 {
            warn!(
                "{} of {} GET_ID probes failed to send",
                result.probes_failed,
                DeviceAddress::MAX as usize + 1
            );
        }

        let started = Instant::now();
        while started.elapsed() < self.config.window {
            if self.interrupted() {
                warn!("Scan interrupted");
                break;
            }
            let Some(frame) = bus.receive(self.config.poll_tick) else {
                continue;
            };
            if let Some(address) = protocol::parse_get_id_reply(&frame) {
                info!("[FOUND] CAN_ID={}", address);
                result.last_seen = Some(address);
                result.replies += 1;
            }
        }

        match result.last_seen {
            Some(address) => {
                if result.replies > 1 {
                    warn!(
                        "{} replies in one window, keeping the last responder {}",
                        result.replies, address
                    );
                }
                session.current_address = Some(address);
            }
            None => info!("No response"),
        }
        result
    }
}
