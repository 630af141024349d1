//! Fault and status events.
//!
//! Failures that the emulator deliberately skips over (an undecodable frame, a
//! malformed trace line, a rejected bus write) are still made observable here.
//! The log keeps one entry per [`EventCode`]; repeated reports bump the
//! occurrence counter and refresh the data word instead of growing the log, so
//! reporting from the 1 ms loop stays cheap and bounded.

use std::sync::Mutex;
use std::time::Instant;

use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter};
use tracing::{debug, error, info, warn};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Display, EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EventCode {
    /// A frame with a known id could not be decoded. Data: the CAN id.
    CanDecodeFailure,
    /// A driver refused a frame. Data: the CAN id.
    CanWriteFailure,
    /// A driver failed while polling. Data: the interface index.
    CanReadFailure,
    /// A trace line did not match the trace grammar. Data: the line number.
    ReplayParseError,
    /// A parsed trace line could not be turned into a frame for the target. Data: the line number.
    ReplayFrameRejected,
    /// A setpoint change was refused. Data: the requested value, in 1/10 units.
    SetpointRejected,
    /// A control cycle overran its period. Data: overrun in milliseconds.
    ControlLoopOverrun,
    /// A supervised context missed its watchdog horizon. Data: milliseconds since its last reset.
    WatchdogTimeout,
    /// A receiver or transmitter panicked while locked and is skipped from now on. Data: its registration index.
    HandlerPoisoned,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Display)]
pub enum EventLevel {
    Info,
    Warning,
    Error,
}

impl EventCode {
    pub fn level(&self) -> EventLevel {
        match self {
            EventCode::CanDecodeFailure | EventCode::ReplayParseError => EventLevel::Info,
            EventCode::CanWriteFailure
            | EventCode::CanReadFailure
            | EventCode::ReplayFrameRejected
            | EventCode::SetpointRejected
            | EventCode::ControlLoopOverrun => EventLevel::Warning,
            EventCode::WatchdogTimeout | EventCode::HandlerPoisoned => EventLevel::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub code: EventCode,
    /// Code specific data from the latest occurrence.
    pub data: u32,
    pub occurrences: u32,
    pub first_seen: Instant,
    pub last_seen: Instant,
}

#[derive(Debug, Default)]
pub struct EventLog {
    entries: Mutex<Vec<Event>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an occurrence of `code`. Never blocks for longer than the entry update.
    pub fn report(&self, code: EventCode, data: u32) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        let now = Instant::now();

        match entries.iter_mut().find(|e| e.code == code) {
            Some(event) => {
                event.data = data;
                event.occurrences = event.occurrences.saturating_add(1);
                event.last_seen = now;
                debug!("event {} repeated ({}x), data {}", code, event.occurrences, data);
            }
            None => {
                entries.push(Event {
                    code,
                    data,
                    occurrences: 1,
                    first_seen: now,
                    last_seen: now,
                });
                match code.level() {
                    EventLevel::Info => info!("event {}, data {}", code, data),
                    EventLevel::Warning => warn!("event {}, data {}", code, data),
                    EventLevel::Error => error!("event {}, data {}", code, data),
                }
            }
        }
    }

    pub fn get(&self, code: EventCode) -> Option<Event> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.iter().find(|e| e.code == code).cloned())
    }

    /// Number of times `code` has been reported since it was last cleared.
    pub fn occurrences(&self, code: EventCode) -> u32 {
        self.get(code).map(|e| e.occurrences).unwrap_or(0)
    }

    pub fn clear(&self, code: EventCode) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.retain(|e| e.code != code);
        }
    }

    /// All active events, ordered by code.
    pub fn snapshot(&self) -> Vec<Event> {
        let Ok(entries) = self.entries.lock() else {
            return vec![];
        };
        EventCode::iter()
            .filter_map(|code| entries.iter().find(|e| e.code == code).cloned())
            .collect()
    }

    /// Highest level among the active events, if any.
    pub fn worst_level(&self) -> Option<EventLevel> {
        self.snapshot().iter().map(|e| e.code.level()).max()
    }
}
