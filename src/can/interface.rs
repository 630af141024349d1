//! The CAN channels the emulator can be wired to.

use strum_macros::{Display, EnumIter, FromRepr};

use crate::can::timing::{BusTiming, TimingError};

/// One physical CAN channel. The native controllers are clocked internally, the
/// add-on controllers hang off SPI and carry their own crystal.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumIter, FromRepr)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum CanInterface {
    #[strum(serialize = "Native CAN")]
    NativeCan = 0,
    #[strum(serialize = "Native CAN-FD")]
    NativeCanFd = 1,
    #[strum(serialize = "Add-on CAN")]
    AddonCan = 2,
    #[strum(serialize = "Add-on CAN-FD")]
    AddonCanFd = 3,
}

pub const INTERFACE_COUNT: usize = 4;

impl CanInterface {
    /// Whether the controller itself can speak CAN-FD.
    pub fn is_fd_capable(&self) -> bool {
        matches!(self, CanInterface::NativeCanFd | CanInterface::AddonCanFd)
    }

    pub fn is_addon(&self) -> bool {
        matches!(self, CanInterface::AddonCan | CanInterface::AddonCanFd)
    }

    pub(crate) fn index(&self) -> usize {
        *self as usize
    }
}

/// Per-channel configuration, fixed at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceConfig {
    pub interface: CanInterface,
    /// Crystal frequency of an add-on controller in MHz. Ignored for native channels.
    pub crystal_mhz: Option<u32>,
    /// Run an FD-capable controller as a classic CAN channel.
    pub fd_as_classic: bool,
}

impl InterfaceConfig {
    pub fn native(interface: CanInterface) -> Self {
        Self {
            interface,
            crystal_mhz: None,
            fd_as_classic: false,
        }
    }

    pub fn addon(interface: CanInterface, crystal_mhz: u32) -> Self {
        Self {
            interface,
            crystal_mhz: Some(crystal_mhz),
            fd_as_classic: false,
        }
    }

    pub fn fd_as_classic(mut self, fd_as_classic: bool) -> Self {
        self.fd_as_classic = fd_as_classic;
        self
    }

    /// Whether frames on this channel are sent as CAN-FD.
    pub fn is_fd(&self) -> bool {
        self.interface.is_fd_capable() && !self.fd_as_classic
    }

    /// Bit timing for add-on controllers, derived from their crystal. Native
    /// controllers are configured by the HAL and return `None`.
    pub fn timing(&self) -> Result<Option<BusTiming>, TimingError> {
        match (self.interface.is_addon(), self.crystal_mhz) {
            (true, Some(mhz)) => BusTiming::for_addon(self.interface, mhz, self.is_fd()).map(Some),
            (true, None) => Err(TimingError::InvalidClock),
            (false, _) => Ok(None),
        }
    }
}
