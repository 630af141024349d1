//! Parser for captured CAN traces.
//!
//! One frame per line:
//! ```text
//! (1699000000.123456) can0 1DB [8] 00 14 03 20 05 00 02 7A
//! ```
//! The timestamp is in seconds, the id is hexadecimal, the length in brackets is
//! the decimal payload length, and the payload is space separated hex octets.

use crate::can::{Frame, Identifier};
use crate::replay::error::ParseError;

/// Largest id still replayed as a standard frame. Traces do not record the
/// extended flag, so anything above this is sent with an extended id.
pub const EXTENDED_ID_THRESHOLD: u32 = 0x7f0;

const MAX_EXTENDED_ID: u32 = 0x1fff_ffff;
const MAX_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct TraceRecord {
    /// Capture time in seconds
    pub timestamp: f64,
    /// Interface name as captured, informational only
    pub interface: String,
    pub id: u32,
    /// Payload, always exactly as long as the length field
    pub data: Vec<u8>,
}

/// Whether a traced id is replayed as an extended frame.
pub fn extended_from_id(id: u32) -> bool {
    id > EXTENDED_ID_THRESHOLD
}

impl TraceRecord {
    pub fn identifier(&self) -> Identifier {
        if extended_from_id(self.id) {
            Identifier::Extended(self.id)
        } else {
            Identifier::Standard(self.id)
        }
    }

    /// Build the frame to replay. Fails when the payload does not fit the frame type.
    pub fn to_frame(&self, fd: bool) -> crate::Result<Frame> {
        Frame::with_fd(self.identifier(), &self.data, fd)
    }
}

/// Parse one trace line.
///
/// Payload octets beyond the length field are ignored; missing ones are zero.
pub fn parse_line(line: &str) -> Result<TraceRecord, ParseError> {
    let line = line.trim();

    let (timestamp, rest) = line
        .strip_prefix('(')
        .and_then(|rest| rest.split_once(')'))
        .ok_or(ParseError::MissingTimestamp)?;
    let timestamp: f64 = timestamp
        .trim()
        .parse()
        .ok()
        .filter(|t: &f64| t.is_finite())
        .ok_or_else(|| ParseError::InvalidTimestamp(timestamp.to_string()))?;

    let mut tokens = rest.split_whitespace();
    let interface = tokens.next().ok_or(ParseError::MissingInterface)?;

    let id_token = tokens.next().ok_or_else(|| ParseError::InvalidId(String::new()))?;
    let digits = id_token.trim_start_matches("0x").trim_start_matches("0X");
    let id = u32::from_str_radix(digits, 16)
        .ok()
        .filter(|id| *id <= MAX_EXTENDED_ID)
        .ok_or_else(|| ParseError::InvalidId(id_token.to_string()))?;

    let length_token = tokens
        .next()
        .and_then(|t| t.strip_prefix('['))
        .ok_or(ParseError::MissingLength)?;
    let length = length_token
        .strip_suffix(']')
        .and_then(|t| t.parse::<usize>().ok())
        .ok_or_else(|| ParseError::InvalidLength(length_token.to_string()))?;
    if length > MAX_LEN {
        return Err(ParseError::LengthTooLarge(length));
    }

    let mut data = vec![0u8; length];
    for (byte, token) in data.iter_mut().zip(tokens) {
        *byte = u8::from_str_radix(token, 16).map_err(|_| ParseError::InvalidByte(token.to_string()))?;
    }

    Ok(TraceRecord {
        timestamp,
        interface: interface.to_string(),
        id,
        data,
    })
}

/// Parse every non-empty line of `trace`, yielding 1-based line numbers.
pub fn parse_trace(trace: &str) -> impl Iterator<Item = (usize, Result<TraceRecord, ParseError>)> + '_ {
    trace
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| (index + 1, parse_line(line)))
}
