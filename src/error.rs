use std::time::Duration;
use thiserror::Error;

/// Failures of the CAN transport itself.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The bus could not be brought up. Fatal: the tool exits with `guidance`.
    #[error("failed to open CAN channel '{channel}': {reason}")]
    Init {
        channel: String,
        reason: String,
        guidance: String,
    },
    #[error("CAN send error: {0}")]
    Send(String),
    #[error("invalid extended identifier 0x{0:X}")]
    InvalidId(u32),
}

impl TransportError {
    pub fn guidance(&self) -> Option<&str> {
        match self {
            TransportError::Init { guidance, .. } if !guidance.is_empty() => Some(guidance),
            _ => None,
        }
    }
}

/// Non-fatal errors reported to the operator; the command loop keeps going.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("address {0} out of range [0, 127]")]
    AddressOutOfRange(i64),
    #[error("no current device address, run a scan (G) first")]
    NoCurrentAddress,
    #[error("invalid number: '{0}'")]
    InvalidNumber(String),
    #[error("usage: {0}")]
    MissingArgument(&'static str),
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("no response within {0:?}")]
    NoResponse(Duration),
    #[error("console output failed: {0}")]
    Io(#[from] std::io::Error),
}
