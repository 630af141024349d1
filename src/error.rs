//! Contains the main error type for the library.
use thiserror::Error;

use crate::can::CanInterface;

/// The main error type for the library. Each module has it's own error type that is contained by this error.
#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("Malformed Frame")]
    MalformedFrame,
    #[error("Interface {0} is not attached")]
    InterfaceUnavailable(CanInterface),
    #[error("Interface {0} does not accept CAN-FD frames")]
    FdNotSupported(CanInterface),
    #[error("Transmit buffer full on {0}")]
    BufferFull(CanInterface),
    #[error("Replay already running")]
    ReplayRunning,
    #[error("Invalid value {value} for setting {key}")]
    InvalidSetting { key: &'static str, value: u32 },
    #[error("Settings store: {0}")]
    Settings(String),
    #[error("Failed to start {0} thread")]
    ThreadSpawn(&'static str),
    #[error(transparent)]
    Setpoint(#[from] crate::charger::error::SetpointError),
    #[error(transparent)]
    Parse(#[from] crate::replay::error::ParseError),
    #[error(transparent)]
    Timing(#[from] crate::can::timing::TimingError),
}
