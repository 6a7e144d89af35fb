//! CAN transport: a frame type, the bus trait the protocol layer talks to, and
//! the SLCAN / SocketCAN backends behind it.

use std::fmt;
use std::io;
use std::time::{Duration, Instant};

use serial::prelude::*;
use tracing::{info, trace, warn};

use crate::error::TransportError;
use crate::protocol::BITRATE;

/// A classic CAN frame, fixed 8-byte buffer with `len` valid bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub id: u32,
    pub data: [u8; 8],
    pub len: u8,
    pub extended: bool,
}

impl Frame {
    pub fn extended(id: u32, data: [u8; 8]) -> Self {
        Frame {
            id,
            data,
            len: 8,
            extended: true,
        }
    }

    pub fn from_parts(id: u32, data: &[u8], extended: bool) -> Self {
        let mut fixed = [0u8; 8];
        let len = data.len().min(8);
        fixed[..len].copy_from_slice(&data[..len]);
        Frame {
            id,
            data: fixed,
            len: len as u8,
            extended,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..usize::from(self.len).min(8)]
    }
}

pub trait CanBus {
    fn send(&mut self, frame: &Frame) -> Result<(), TransportError>;
    /// Waits at most `timeout` for the next data frame.
    fn receive(&mut self, timeout: Duration) -> Option<Frame>;
}

impl<B: CanBus + ?Sized> CanBus for Box<B> {
    fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        (**self).send(frame)
    }

    fn receive(&mut self, timeout: Duration) -> Option<Frame> {
        (**self).receive(timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    /// Serial-line CAN adapter (`/dev/ttyACM0`, `COM3`, ...).
    SlCan,
    /// Native kernel CAN interface (`can0`, `vcan0`, ...).
    SocketCan,
}

impl BusKind {
    pub fn from_channel(channel: &str) -> Self {
        if channel.contains("tty") || channel.contains("COM") {
            BusKind::SlCan
        } else {
            BusKind::SocketCan
        }
    }
}

impl std::fmt::Display for BusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusKind::SlCan => write!(f, "slcan"),
            BusKind::SocketCan => write!(f, "socketcan"),
        }
    }
}

/// Opens the backend the channel name points at, at 1 Mbit/s.
pub fn open(channel: &str) -> Result<Box<dyn CanBus>, TransportError> {
    match BusKind::from_channel(channel) {
        BusKind::SlCan => Ok(Box::new(SlCan::open(channel)?)),
        BusKind::SocketCan => open_socketcan(channel),
    }
}

#[cfg(target_os = "linux")]
fn open_socketcan(channel: &str) -> Result<Box<dyn CanBus>, TransportError> {
    Ok(Box::new(socketcan_backend::SocketCan::open(channel)?))
}

#[cfg(not(target_os = "linux"))]
fn open_socketcan(channel: &str) -> Result<Box<dyn CanBus>, TransportError> {
    Err(TransportError::Init {
        channel: channel.to_string(),
        reason: "SocketCAN is only available on Linux".to_string(),
        guidance: slcan_guidance(),
    })
}

fn slcan_guidance() -> String {
    match serialport::available_ports() {
        Ok(ports) if !ports.is_empty() => {
            let names: Vec<_> = ports.into_iter().map(|p| p.port_name).collect();
            format!("serial ports found: {}", names.join(", "))
        }
        Ok(_) => "no serial ports found, is the SLCAN adapter plugged in?".to_string(),
        Err(e) => format!("could not enumerate serial ports: {e}"),
    }
}

/// Tells poll timeouts apart from receive faults, and reports each run of
/// faults once instead of on every poll.
#[derive(Debug, Default)]
struct ReceiveFaults {
    active: bool,
}

impl ReceiveFaults {
    fn is_poll_timeout(kind: io::ErrorKind) -> bool {
        matches!(kind, io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
    }

    /// Returns whether this fault was logged.
    fn fault(&mut self, channel: &str, error: &dyn fmt::Display) -> bool {
        if self.active {
            return false;
        }
        self.active = true;
        warn!("CAN receive error on '{}': {}", channel, error);
        true
    }

    fn clear(&mut self, channel: &str) {
        if std::mem::take(&mut self.active) {
            info!("CAN receive on '{}' recovered", channel);
        }
    }
}

/// Serial read timeout. `SlCan::receive` repeats reads of this length until
/// the caller's timeout runs out.
const SLCAN_READ_SLICE: Duration = Duration::from_millis(1);

fn slcan_frame(id: slcan::Id, dlc: usize, data: &[u8; 8]) -> Frame {
    let payload = &data[..dlc.min(8)];
    match id {
        slcan::Id::Standard(id) => Frame::from_parts(u32::from(id.as_raw()), payload, false),
        slcan::Id::Extended(id) => Frame::from_parts(id.as_raw(), payload, true),
    }
}

/// Serial-line CAN adapter.
pub struct SlCan {
    socket: slcan::CanSocket<serial::SystemPort>,
    channel: String,
    faults: ReceiveFaults,
}

impl SlCan {
    pub fn open(path: &str) -> Result<Self, TransportError> {
        let init_error = |reason: String| TransportError::Init {
            channel: path.to_string(),
            reason,
            guidance: slcan_guidance(),
        };
        let mut port = serial::open(path).map_err(|e| init_error(e.to_string()))?;
        port.set_timeout(SLCAN_READ_SLICE)
            .map_err(|e| init_error(e.to_string()))?;
        let mut can_socket = slcan::CanSocket::new(port);
        can_socket
            .open(slcan::BitRate::Setup1Mbit)
            .map_err(|e| init_error(format!("failed to open SLCAN channel: {e:?}")))?;
        trace!("SLCAN channel '{}' open at {} bit/s", path, BITRATE);
        Ok(SlCan {
            socket: can_socket,
            channel: path.to_string(),
            faults: ReceiveFaults::default(),
        })
    }
}

impl Drop for SlCan {
    fn drop(&mut self) {
        if let Err(e) = self.socket.close() {
            warn!("Failed to close the SLCAN channel: {:?}", e);
        }
    }
}

impl CanBus for SlCan {
    fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        if !frame.extended {
            return Err(TransportError::InvalidId(frame.id));
        }
        let id = slcan::ExtendedId::new(frame.id).ok_or(TransportError::InvalidId(frame.id))?;
        self.socket
            .write(slcan::Id::Extended(id), frame.payload())
            .map_err(|e| TransportError::Send(format!("{e:?}")))?;
        trace!("Sent CAN frame: ID=0x{:08X}, data={:02X?}", frame.id, frame.payload());
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.socket.read() {
                Ok(frame) => {
                    self.faults.clear(&self.channel);
                    let received = slcan_frame(frame.id, usize::from(frame.dlc), &frame.data);
                    trace!("Received CAN frame: ID=0x{:08X}, len={}", received.id, received.len);
                    return Some(received);
                }
                Err(slcan::ReadError::Io(e)) if ReceiveFaults::is_poll_timeout(e.kind()) => {}
                Err(e) => {
                    self.faults.fault(&self.channel, &format!("{e:?}"));
                    return None;
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
        }
    }
}

#[cfg(target_os = "linux")]
mod socketcan_backend {
    use std::time::Duration;

    use socketcan::{
        CanError as SocketCanError, CanErrorFrame, CanFrame, CanSocket, EmbeddedFrame,
        ExtendedId, Frame as _, Socket,
    };
    use tracing::{trace, warn};

    use super::{CanBus, Frame, ReceiveFaults};
    use crate::error::TransportError;
    use crate::protocol::{BITRATE, POLL_TICK};

    /// Kernel CAN interface. The bit rate is configured with `ip link`, not here.
    pub struct SocketCan {
        socket: CanSocket,
        interface: String,
        read_timeout: Duration,
        faults: ReceiveFaults,
    }

    impl SocketCan {
        pub fn open(interface: &str) -> Result<Self, TransportError> {
            let init_error = |reason: String| TransportError::Init {
                channel: interface.to_string(),
                reason,
                guidance: format!(
                    "sudo ip link set {interface} type can bitrate {BITRATE}\nsudo ip link set {interface} up"
                ),
            };
            let socket = CanSocket::open(interface).map_err(|e| init_error(e.to_string()))?;
            socket
                .set_read_timeout(POLL_TICK)
                .map_err(|e| init_error(e.to_string()))?;
            trace!("SocketCAN interface '{}' open", interface);
            Ok(SocketCan {
                socket,
                interface: interface.to_string(),
                read_timeout: POLL_TICK,
                faults: ReceiveFaults::default(),
            })
        }
    }

    impl CanBus for SocketCan {
        fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
            if !frame.extended {
                return Err(TransportError::InvalidId(frame.id));
            }
            let can_frame = ExtendedId::new(frame.id)
                .and_then(|id| CanFrame::new(id, frame.payload()))
                .ok_or(TransportError::InvalidId(frame.id))?;
            self.socket
                .write_frame(&can_frame)
                .map_err(|e| TransportError::Send(e.to_string()))?;
            trace!("Sent CAN frame: ID=0x{:08X}, data={:02X?}", frame.id, frame.payload());
            Ok(())
        }

        fn receive(&mut self, timeout: Duration) -> Option<Frame> {
            if timeout != self.read_timeout {
                match self.socket.set_read_timeout(timeout) {
                    Ok(()) => self.read_timeout = timeout,
                    Err(e) => warn!("Failed to set receive timeout: {}", e),
                }
            }
            let can_frame = match self.socket.read_frame() {
                Ok(frame) => {
                    self.faults.clear(&self.interface);
                    frame
                }
                Err(e) if ReceiveFaults::is_poll_timeout(e.kind()) => return None,
                Err(e) => {
                    self.faults.fault(&self.interface, &e);
                    return None;
                }
            };
            if can_frame.is_error_frame() {
                match CanErrorFrame::try_from(can_frame) {
                    Ok(error_frame) => {
                        warn!("CAN error frame received: {}", SocketCanError::from(error_frame))
                    }
                    Err(_) => warn!("CAN error frame received but could not be parsed"),
                }
                return None;
            }
            let received = Frame::from_parts(can_frame.raw_id(), can_frame.data(), can_frame.is_extended());
            trace!("Received CAN frame: ID=0x{:08X}, len={}", received.id, received.len);
            Some(received)
        }
    }
}
