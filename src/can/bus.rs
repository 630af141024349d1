//! The set of CAN channels attached at startup, and the read/write primitives
//! everything else goes through.

use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::can::interface::INTERFACE_COUNT;
use crate::can::timing::BusTiming;
use crate::can::{CanDriver, CanInterface, Frame, InterfaceConfig};
use crate::error::Error;
use crate::events::{EventCode, EventLog};
use crate::Result;

const DEBUG: bool = false;

struct Channel {
    config: InterfaceConfig,
    timing: Option<BusTiming>,
    driver: Mutex<Box<dyn CanDriver>>,
}

/// Collects channels during startup. Once built, the channel set never changes.
pub struct BusBuilder {
    channels: [Option<Channel>; INTERFACE_COUNT],
    events: Arc<EventLog>,
}

impl BusBuilder {
    pub fn new(events: Arc<EventLog>) -> Self {
        Self {
            channels: std::array::from_fn(|_| None),
            events,
        }
    }

    /// Attach a driver to the channel described by `config`. Add-on controllers
    /// get their bit timing solved from the configured crystal here.
    pub fn attach<D: CanDriver + 'static>(mut self, config: InterfaceConfig, driver: D) -> Result<Self> {
        let timing = config.timing()?;
        match &timing {
            Some(timing) => info!(
                "{} attached, {} bit/s (brp {}, tseg1 {}, tseg2 {}), fd: {}",
                config.interface,
                timing.nominal.bitrate,
                timing.nominal.brp,
                timing.nominal.tseg1,
                timing.nominal.tseg2,
                config.is_fd()
            ),
            None => info!("{} attached, fd: {}", config.interface, config.is_fd()),
        }

        let index = config.interface.index();
        self.channels[index] = Some(Channel {
            config,
            timing,
            driver: Mutex::new(Box::new(driver)),
        });
        Ok(self)
    }

    pub fn build(self) -> Bus {
        Bus {
            channels: self.channels,
            events: self.events,
        }
    }
}

/// All attached CAN channels. Shared between the control loop and the replay worker.
pub struct Bus {
    channels: [Option<Channel>; INTERFACE_COUNT],
    events: Arc<EventLog>,
}

impl Bus {
    fn channel(&self, interface: CanInterface) -> Result<&Channel> {
        self.channels[interface.index()]
            .as_ref()
            .ok_or(Error::InterfaceUnavailable(interface))
    }

    /// Hand a frame to the driver of `interface`. Fails immediately when the frame
    /// cannot be sent as is; failures are also reported to the event log.
    pub fn write_frame(&self, frame: &Frame, interface: CanInterface) -> Result<()> {
        let result = self.try_write(frame, interface);
        if result.is_err() {
            self.events.report(EventCode::CanWriteFailure, frame.raw_id());
        }
        result
    }

    fn try_write(&self, frame: &Frame, interface: CanInterface) -> Result<()> {
        let channel = self.channel(interface)?;
        if frame.is_fd() && !channel.config.is_fd() {
            return Err(Error::FdNotSupported(interface));
        }

        if DEBUG {
            debug!("TX [{}] {:?}", interface, frame);
        }

        let mut driver = channel
            .driver
            .lock()
            .map_err(|_| Error::InterfaceUnavailable(interface))?;
        driver.write(frame)
    }

    /// Fetch the next pending frame from `interface`, if any. Never blocks.
    pub fn poll_frame(&self, interface: CanInterface) -> Option<Frame> {
        let channel = self.channel(interface).ok()?;
        let polled = match channel.driver.lock() {
            Ok(mut driver) => driver.poll(),
            Err(_) => Err(Error::InterfaceUnavailable(interface)),
        };

        match polled {
            Ok(Some(frame)) => {
                if DEBUG {
                    debug!("RX [{}] {:?}", interface, frame);
                }
                Some(frame)
            }
            Ok(None) => None,
            Err(_) => {
                self.events.report(EventCode::CanReadFailure, interface as u32);
                None
            }
        }
    }

    /// Whether frames sent on `interface` should be CAN-FD.
    pub fn is_fd(&self, interface: CanInterface) -> bool {
        self.channel(interface).map(|c| c.config.is_fd()).unwrap_or(false)
    }

    pub fn is_attached(&self, interface: CanInterface) -> bool {
        self.channels[interface.index()].is_some()
    }

    /// Attached channels in enumeration order.
    pub fn attached(&self) -> impl Iterator<Item = CanInterface> + '_ {
        self.channels.iter().flatten().map(|c| c.config.interface)
    }

    pub fn timing(&self, interface: CanInterface) -> Option<BusTiming> {
        self.channel(interface).ok().and_then(|c| c.timing)
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::{Identifier, VirtualCan};

    fn bus_with(configs: Vec<InterfaceConfig>) -> (Bus, Vec<crate::can::VirtualCanHandle>) {
        let mut builder = BusBuilder::new(Arc::new(EventLog::new()));
        let mut handles = vec![];
        for config in configs {
            let (driver, handle) = VirtualCan::new(config.interface);
            builder = builder.attach(config, driver).unwrap();
            handles.push(handle);
        }
        (builder.build(), handles)
    }

    #[test]
    fn write_to_missing_interface() {
        let (bus, _) = bus_with(vec![InterfaceConfig::native(CanInterface::NativeCan)]);
        let frame = Frame::new(Identifier::Standard(0x30e), &[0]).unwrap();

        assert_eq!(
            bus.write_frame(&frame, CanInterface::AddonCan),
            Err(Error::InterfaceUnavailable(CanInterface::AddonCan))
        );
        assert_eq!(bus.events().occurrences(EventCode::CanWriteFailure), 1);
    }

    #[test]
    fn fd_frame_rejected_on_classic_channel() {
        let (bus, handles) = bus_with(vec![
            InterfaceConfig::native(CanInterface::NativeCan),
            InterfaceConfig::native(CanInterface::NativeCanFd).fd_as_classic(true),
        ]);
        let frame = Frame::new(Identifier::Standard(0x12f), &[0u8; 64]).unwrap();

        assert_eq!(
            bus.write_frame(&frame, CanInterface::NativeCan),
            Err(Error::FdNotSupported(CanInterface::NativeCan))
        );
        assert_eq!(
            bus.write_frame(&frame, CanInterface::NativeCanFd),
            Err(Error::FdNotSupported(CanInterface::NativeCanFd))
        );
        assert!(handles.iter().all(|h| h.transmitted_count() == 0));
    }

    #[test]
    fn poll_and_write_route_by_interface() {
        let (bus, handles) = bus_with(vec![
            InterfaceConfig::native(CanInterface::NativeCan),
            InterfaceConfig::addon(CanInterface::AddonCan, 16),
        ]);
        let frame = Frame::new(Identifier::Standard(0x679), &[1]).unwrap();

        handles[1].inject(frame);
        assert_eq!(bus.poll_frame(CanInterface::NativeCan), None);
        assert_eq!(bus.poll_frame(CanInterface::AddonCan), Some(frame));

        bus.write_frame(&frame, CanInterface::NativeCan).unwrap();
        assert_eq!(handles[0].take_transmitted(), vec![frame]);
        assert!(handles[1].take_transmitted().is_empty());

        let attached: Vec<CanInterface> = bus.attached().collect();
        assert_eq!(attached, vec![CanInterface::NativeCan, CanInterface::AddonCan]);
        assert!(bus.timing(CanInterface::AddonCan).is_some());
        assert!(bus.timing(CanInterface::NativeCan).is_none());
    }

    #[test]
    fn addon_without_solvable_crystal_fails_attach() {
        let (driver, _) = VirtualCan::new(CanInterface::AddonCan);
        let result = BusBuilder::new(Arc::new(EventLog::new()))
            .attach(InterfaceConfig::addon(CanInterface::AddonCan, 0), driver);
        assert!(matches!(result, Err(Error::Timing(_))));
    }
}
