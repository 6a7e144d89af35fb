use std::fmt;

use crate::error::CommandError;

/// Printed in place of an address when none is selected.
pub const NONE_SENTINEL: u8 = 0xFF;

pub const DEFAULT_ADDRESS: u8 = 0x7F;
pub const DEFAULT_VELOCITY_LIMIT: f32 = 10.0;

/// 7-bit device bus address, 0..=127.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceAddress(u8);

impl DeviceAddress {
    pub const MAX: u8 = 0x7F;

    pub fn new(raw: u8) -> Option<Self> {
        (raw <= Self::MAX).then_some(DeviceAddress(raw))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Every address a device can answer on.
    pub fn all() -> impl Iterator<Item = DeviceAddress> {
        (0..=Self::MAX).map(DeviceAddress)
    }
}

impl TryFrom<i64> for DeviceAddress {
    type Error = CommandError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u8::try_from(value)
            .ok()
            .and_then(DeviceAddress::new)
            .ok_or(CommandError::AddressOutOfRange(value))
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

/// Formats an optional address, using the sentinel when nothing is selected.
pub fn display_address(address: Option<DeviceAddress>) -> String {
    match address {
        Some(address) => address.to_string(),
        None => format!("0x{NONE_SENTINEL:02X}"),
    }
}

/// Operator session: which device commands go to, and the CSP velocity ceiling.
///
/// Only the scanner (on a successful scan) and the sequencer (on a successful
/// limit write) change it.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub current_address: Option<DeviceAddress>,
    /// rad/s, never negative.
    pub velocity_limit: f32,
}

impl SessionState {
    pub fn new(current_address: Option<DeviceAddress>, velocity_limit: f32) -> Self {
        SessionState {
            current_address,
            velocity_limit: velocity_limit.max(0.0),
        }
    }

    pub fn require_address(&self) -> Result<DeviceAddress, CommandError> {
        self.current_address.ok_or(CommandError::NoCurrentAddress)
    }
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::new(DeviceAddress::new(DEFAULT_ADDRESS), DEFAULT_VELOCITY_LIMIT)
    }
}
