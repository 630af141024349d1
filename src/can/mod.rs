//! Generic CAN types and traits

pub mod bus;
pub mod interface;
pub mod timing;
pub mod virtual_can;

use std::fmt;

pub use bus::{Bus, BusBuilder};
pub use interface::{CanInterface, InterfaceConfig};
pub use virtual_can::{VirtualCan, VirtualCanHandle};

/// Maximum payload of a classic CAN frame.
pub const CAN_MAX_LEN: usize = 8;
/// Maximum payload of a CAN-FD frame.
pub const CANFD_MAX_LEN: usize = 64;

/// Identifier for a CAN frame
#[derive(Copy, Clone, PartialOrd, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Identifier {
    Standard(u32),
    Extended(u32),
}

impl Identifier {
    pub fn is_standard(&self) -> bool {
        match self {
            Identifier::Standard(_) => true,
            Identifier::Extended(_) => false,
        }
    }
    pub fn is_extended(&self) -> bool {
        !self.is_standard()
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Extended(id) => write!(f, "0x{:08x}", id),
            Identifier::Standard(id) => write!(f, "0x{:03x}", id),
        }
    }
}

impl From<u32> for Identifier {
    fn from(id: u32) -> Identifier {
        if id <= 0x7ff {
            Identifier::Standard(id)
        } else {
            Identifier::Extended(id)
        }
    }
}

impl From<Identifier> for u32 {
    fn from(val: Identifier) -> u32 {
        match val {
            Identifier::Standard(id) => id,
            Identifier::Extended(id) => id,
        }
    }
}

/// A CAN or CAN-FD frame. Immutable once constructed; the payload lives inline so
/// building and passing frames around never allocates.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Frame {
    id: Identifier,
    fd: bool,
    len: u8,
    data: [u8; CANFD_MAX_LEN],
}

impl Frame {
    /// Build a frame, choosing CAN-FD only when the payload does not fit a classic frame.
    pub fn new(id: Identifier, data: &[u8]) -> Result<Frame, crate::error::Error> {
        Self::with_fd(id, data, data.len() > CAN_MAX_LEN)
    }

    /// Build a CAN-FD frame regardless of payload length.
    pub fn new_fd(id: Identifier, data: &[u8]) -> Result<Frame, crate::error::Error> {
        Self::with_fd(id, data, true)
    }

    /// Build a frame with an explicit FD flag.
    pub fn with_fd(id: Identifier, data: &[u8], fd: bool) -> Result<Frame, crate::error::Error> {
        let max_len = if fd { CANFD_MAX_LEN } else { CAN_MAX_LEN };
        if data.len() > max_len {
            return Err(crate::error::Error::MalformedFrame);
        }

        match id {
            Identifier::Standard(id) if id > 0x7ff => return Err(crate::error::Error::MalformedFrame),
            Identifier::Extended(id) if id > 0x1fffffff => return Err(crate::error::Error::MalformedFrame),
            _ => {}
        };

        let mut buf = [0u8; CANFD_MAX_LEN];
        buf[..data.len()].copy_from_slice(data);

        Ok(Frame {
            id,
            fd,
            len: data.len() as u8,
            data: buf,
        })
    }

    /// Arbitration ID
    pub fn id(&self) -> Identifier {
        self.id
    }

    /// Raw numeric arbitration ID, without the extended flag.
    pub fn raw_id(&self) -> u32 {
        self.id.into()
    }

    pub fn is_extended(&self) -> bool {
        self.id.is_extended()
    }

    /// CAN-FD Frame
    pub fn is_fd(&self) -> bool {
        self.fd
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Frame Data
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id)
            .field("data", &hex::encode(self.data()))
            .field("fd", &self.fd)
            .finish()
    }
}

/// Non-blocking driver for a single CAN channel. Both operations must return
/// immediately: a write that cannot be queued fails instead of waiting.
pub trait CanDriver: Send {
    fn write(&mut self, frame: &Frame) -> Result<(), crate::error::Error>;
    fn poll(&mut self) -> Result<Option<Frame>, crate::error::Error>;
}

impl<D: CanDriver + ?Sized> CanDriver for Box<D> {
    fn write(&mut self, frame: &Frame) -> Result<(), crate::error::Error> {
        (**self).write(frame)
    }

    fn poll(&mut self) -> Result<Option<Frame>, crate::error::Error> {
        (**self).poll()
    }
}
