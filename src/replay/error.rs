//! Error types for trace parsing.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Missing Timestamp")]
    MissingTimestamp,
    #[error("Invalid Timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("Missing Interface")]
    MissingInterface,
    #[error("Missing Length")]
    MissingLength,
    #[error("Invalid Identifier: {0}")]
    InvalidId(String),
    #[error("Invalid Length: {0}")]
    InvalidLength(String),
    #[error("Length {0} Exceeds Maximum Payload")]
    LengthTooLarge(usize),
    #[error("Invalid Data Byte: {0}")]
    InvalidByte(String),
}
