//! RobStride / CyberGear extended-identifier framing.
//!
//! Every message rides in a 29-bit extended identifier laid out as
//! `[28:24] mode | [23:8] data16 | [7:0] id8`, with an 8-byte payload whose
//! layout depends on the mode.

use std::time::Duration;

use crate::bus::Frame;
use crate::session::DeviceAddress;

pub const COMM_GET_ID: u8 = 0x00;
pub const COMM_RUN_ENABLE: u8 = 0x03;
pub const COMM_SET_ID: u8 = 0x07;
pub const COMM_WRITE_ONE: u8 = 0x12;

/// Host address the tool claims as bus master.
pub const MASTER_ID: u8 = 0xFD;
/// `id8` of every GET_ID reply.
pub const RESP_MARKER: u8 = 0xFE;

/// 0: operation control, 1: PP, 2: speed, 3: current, 5: CSP.
pub const IDX_RUNMODE: u16 = 0x7005;
/// Position reference [rad], f32.
pub const IDX_LOC_REF: u16 = 0x7016;
/// CSP velocity ceiling [rad/s], f32.
pub const IDX_LIMIT_SPD: u16 = 0x7017;

pub const RUNMODE_CSP: u8 = 5;

pub const BITRATE: u32 = 1_000_000;

pub const PROBE_SPACING: Duration = Duration::from_micros(700);
pub const POLL_TICK: Duration = Duration::from_millis(10);
pub const DEFAULT_SCAN_WINDOW: Duration = Duration::from_millis(800);

const MODE_MASK: u8 = 0x1F;

/// Packs the three identifier fields. Out-of-range mode bits are dropped, not rejected.
pub fn encode_identifier(mode: u8, data16: u16, id8: u8) -> u32 {
    (u32::from(mode & MODE_MASK) << 24) | (u32::from(data16) << 8) | u32::from(id8)
}

pub fn decode_identifier(id: u32) -> (u8, u16, u8) {
    let mode = ((id >> 24) & u32::from(MODE_MASK)) as u8;
    let data16 = ((id >> 8) & 0xFFFF) as u16;
    let id8 = (id & 0xFF) as u8;
    (mode, data16, id8)
}

fn master_data16() -> u16 {
    u16::from(MASTER_ID) << 8
}

pub fn get_id_probe(target: DeviceAddress) -> Frame {
    Frame::extended(
        encode_identifier(COMM_GET_ID, master_data16(), target.get()),
        [0; 8],
    )
}

pub fn set_id(current: DeviceAddress, new_address: DeviceAddress) -> Frame {
    let data16 = (u16::from(new_address.get()) << 8) | u16::from(MASTER_ID);
    Frame::extended(encode_identifier(COMM_SET_ID, data16, current.get()), [0; 8])
}

pub fn run_enable(target: DeviceAddress) -> Frame {
    Frame::extended(
        encode_identifier(COMM_RUN_ENABLE, master_data16(), target.get()),
        [0; 8],
    )
}

/// Single-parameter write: `[index_lo, index_hi, 0, 0, value[0..4]]`.
pub fn write_one(target: DeviceAddress, index: u16, value: [u8; 4]) -> Frame {
    let index = index.to_le_bytes();
    Frame::extended(
        encode_identifier(COMM_WRITE_ONE, master_data16(), target.get()),
        [index[0], index[1], 0, 0, value[0], value[1], value[2], value[3]],
    )
}

pub fn write_one_f32(target: DeviceAddress, index: u16, value: f32) -> Frame {
    write_one(target, index, value.to_le_bytes())
}

pub fn write_one_u8(target: DeviceAddress, index: u16, value: u8) -> Frame {
    write_one(target, index, [value, 0, 0, 0])
}

/// Returns the discovered address if `frame` is a GET_ID reply.
pub fn parse_get_id_reply(frame: &Frame) -> Option<DeviceAddress> {
    if !frame.extended || frame.len != 8 {
        return None;
    }
    let (mode, data16, id8) = decode_identifier(frame.id);
    if mode != COMM_GET_ID || id8 != RESP_MARKER {
        return None;
    }
    let raw = (data16 & 0xFF) as u8;
    let address = DeviceAddress::new(raw);
    if address.is_none() {
        tracing::debug!("GET_ID reply carries out-of-range address 0x{:02X}, ignored", raw);
    }
    address
}

/// Builds the frame a device would send back for a GET_ID probe.
#[cfg(test)]
pub fn get_id_reply(address: u8) -> Frame {
    Frame::extended(
        encode_identifier(COMM_GET_ID, u16::from(address), RESP_MARKER),
        [0; 8],
    )
}
