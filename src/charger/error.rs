//! Error types for charger setpoint validation.

use thiserror::Error;

/// A requested setpoint was refused. The previous setpoints are left untouched.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SetpointError {
    #[error("{0} is not a valid number")]
    NotANumber(f32),
    #[error("Voltage {value} V outside [{min}, {max}] V")]
    VoltageOutOfRange { value: f32, min: f32, max: f32 },
    #[error("Current {value} A outside [0, {max}] A")]
    CurrentOutOfRange { value: f32, max: f32 },
    #[error("End of charge current {value} A outside [0, {max}] A")]
    EndCurrentOutOfRange { value: f32, max: f32 },
    #[error("{voltage} V x {current} A exceeds the {max} W power limit")]
    PowerLimitExceeded { voltage: f32, current: f32, max: f32 },
}
