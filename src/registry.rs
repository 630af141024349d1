//! Transmitter and receiver registries.
//!
//! Everything that sends frames on its own schedule registers as a
//! [`Transmitter`], everything that consumes inbound frames registers as a
//! [`Receiver`] on one interface. Registration only exists on the
//! [`RegistryBuilder`]; the frozen [`Registry`] that the control loop owns has no
//! way to add entries, so nothing can register once the loop is running.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::can::{Bus, CanInterface, Frame};
use crate::events::{EventCode, EventLog};

/// Something that emits its due frames when ticked.
pub trait Transmitter: Send {
    /// Send whatever is due at `now_ms` (monotonic milliseconds). Must not block.
    fn transmit(&mut self, now_ms: u64, bus: &Bus);
}

/// Something that consumes inbound frames from one interface.
pub trait Receiver: Send {
    /// Handle one frame. Must not block; unknown frames are ignored.
    fn receive(&mut self, frame: &Frame, interface: CanInterface);
}

pub type SharedTransmitter = Arc<Mutex<dyn Transmitter>>;
pub type SharedReceiver = Arc<Mutex<dyn Receiver>>;

#[derive(Default)]
pub struct RegistryBuilder {
    transmitters: Vec<SharedTransmitter>,
    receivers: HashMap<CanInterface, Vec<SharedReceiver>>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_transmitter(&mut self, transmitter: SharedTransmitter) {
        self.transmitters.push(transmitter);
        debug!("transmitter registered, total: {}", self.transmitters.len());
    }

    pub fn register_receiver(&mut self, receiver: SharedReceiver, interface: CanInterface) {
        let receivers = self.receivers.entry(interface).or_default();
        receivers.push(receiver);
        debug!("receiver registered on {}, total: {}", interface, receivers.len());
    }

    /// Freeze the registrations.
    pub fn build(self) -> Registry {
        Registry {
            transmitters: self.transmitters.into_iter().map(Slot::new).collect(),
            receivers: self
                .receivers
                .into_iter()
                .map(|(interface, receivers)| (interface, receivers.into_iter().map(Slot::new).collect()))
                .collect(),
        }
    }
}

/// A registered handler. A handler whose mutex got poisoned is skipped.
struct Slot<T: ?Sized> {
    handler: Arc<Mutex<T>>,
    poisoned: AtomicBool,
}

impl<T: ?Sized> Slot<T> {
    fn new(handler: Arc<Mutex<T>>) -> Self {
        Self {
            handler,
            poisoned: AtomicBool::new(false),
        }
    }

    /// Lock the handler. The first failed lock is reported as [`EventCode::HandlerPoisoned`].
    fn lock(&self, index: usize, events: &EventLog) -> Option<MutexGuard<'_, T>> {
        match self.handler.lock() {
            Ok(guard) => Some(guard),
            Err(_) => {
                if !self.poisoned.swap(true, Ordering::Relaxed) {
                    events.report(EventCode::HandlerPoisoned, index as u32);
                }
                None
            }
        }
    }
}

/// Frozen registrations, owned by the control loop.
pub struct Registry {
    transmitters: Vec<Slot<dyn Transmitter>>,
    receivers: HashMap<CanInterface, Vec<Slot<dyn Receiver>>>,
}

impl Registry {
    /// Hand `frame` to every receiver subscribed to `interface`.
    pub fn dispatch(&self, interface: CanInterface, frame: &Frame, events: &EventLog) {
        let Some(receivers) = self.receivers.get(&interface) else {
            return;
        };
        for (index, receiver) in receivers.iter().enumerate() {
            if let Some(mut receiver) = receiver.lock(index, events) {
                receiver.receive(frame, interface);
            }
        }
    }

    /// Tick every transmitter, in registration order.
    pub fn tick(&self, now_ms: u64, bus: &Bus) {
        for (index, transmitter) in self.transmitters.iter().enumerate() {
            if let Some(mut transmitter) = transmitter.lock(index, bus.events()) {
                transmitter.transmit(now_ms, bus);
            }
        }
    }

    pub fn transmitter_count(&self) -> usize {
        self.transmitters.len()
    }

    pub fn receiver_count(&self, interface: CanInterface) -> usize {
        self.receivers.get(&interface).map(Vec::len).unwrap_or(0)
    }

    /// Interfaces with at least one receiver.
    pub fn subscribed_interfaces(&self) -> impl Iterator<Item = CanInterface> + '_ {
        self.receivers
            .iter()
            .filter(|(_, r)| !r.is_empty())
            .map(|(interface, _)| *interface)
    }
}

/// Tracks when a periodic message was last sent.
///
/// The first check is always due; afterwards a check is due once `interval_ms`
/// has elapsed since the last due check, so a message is never sent twice within
/// one interval however often it is polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    interval_ms: u64,
    last_ms: Option<u64>,
}

impl Cadence {
    pub const fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            last_ms: None,
        }
    }

    /// Returns true and stamps `now_ms` when the message is due.
    pub fn due(&mut self, now_ms: u64) -> bool {
        let due = match self.last_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= self.interval_ms,
        };
        if due {
            self.last_ms = Some(now_ms);
        }
        due
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::{BusBuilder, Identifier, InterfaceConfig, VirtualCan};
    use crate::events::EventLog;

    struct Counter {
        seen: Vec<u32>,
    }

    impl Receiver for Counter {
        fn receive(&mut self, frame: &Frame, _interface: CanInterface) {
            self.seen.push(frame.raw_id());
        }
    }

    struct Periodic {
        cadence: Cadence,
        sent_at: Vec<u64>,
    }

    impl Transmitter for Periodic {
        fn transmit(&mut self, now_ms: u64, _bus: &Bus) {
            if self.cadence.due(now_ms) {
                self.sent_at.push(now_ms);
            }
        }
    }

    fn empty_bus() -> Bus {
        let (driver, _) = VirtualCan::new(CanInterface::NativeCan);
        BusBuilder::new(Arc::new(EventLog::new()))
            .attach(InterfaceConfig::native(CanInterface::NativeCan), driver)
            .unwrap()
            .build()
    }

    #[test]
    fn fan_out_to_all_receivers() {
        let receivers: Vec<Arc<Mutex<Counter>>> = (0..5)
            .map(|_| Arc::new(Mutex::new(Counter { seen: vec![] })))
            .collect();

        let mut builder = RegistryBuilder::new();
        for receiver in receivers.iter().rev() {
            builder.register_receiver(receiver.clone(), CanInterface::NativeCan);
        }
        let other = Arc::new(Mutex::new(Counter { seen: vec![] }));
        builder.register_receiver(other.clone(), CanInterface::AddonCan);
        let registry = builder.build();

        let frame = Frame::new(Identifier::Standard(0x390), &[0; 8]).unwrap();
        registry.dispatch(CanInterface::NativeCan, &frame, &EventLog::new());

        for receiver in &receivers {
            assert_eq!(receiver.lock().unwrap().seen, vec![0x390]);
        }
        assert!(other.lock().unwrap().seen.is_empty());
        assert_eq!(registry.receiver_count(CanInterface::NativeCan), 5);
    }

    #[test]
    fn dispatch_without_receivers_is_noop() {
        let registry = RegistryBuilder::new().build();
        let frame = Frame::new(Identifier::Standard(0x1), &[]).unwrap();
        registry.dispatch(CanInterface::NativeCanFd, &frame, &EventLog::new());
        assert_eq!(registry.subscribed_interfaces().count(), 0);
    }

    #[test]
    fn cadence_never_sends_twice_per_window() {
        for interval in [1u64, 2, 3, 7, 10, 30, 100] {
            let mut cadence = Cadence::new(interval);
            let sent: Vec<u64> = (0..1000).filter(|&now| cadence.due(now)).collect();

            // Exactly one send per aligned window...
            assert_eq!(sent.len() as u64, 1000_u64.div_ceil(interval), "interval {}", interval);
            // ...and never two within any sliding window of the same length.
            assert!(sent.windows(2).all(|w| w[1] - w[0] >= interval));
        }
    }

    #[test]
    fn tick_runs_in_registration_order() {
        let bus = empty_bus();
        let a = Arc::new(Mutex::new(Periodic {
            cadence: Cadence::new(10),
            sent_at: vec![],
        }));
        let b = Arc::new(Mutex::new(Periodic {
            cadence: Cadence::new(25),
            sent_at: vec![],
        }));

        let mut builder = RegistryBuilder::new();
        builder.register_transmitter(a.clone());
        builder.register_transmitter(b.clone());
        let registry = builder.build();
        assert_eq!(registry.transmitter_count(), 2);

        for now in 0..50 {
            registry.tick(now, &bus);
        }
        assert_eq!(a.lock().unwrap().sent_at, vec![0, 10, 20, 30, 40]);
        assert_eq!(b.lock().unwrap().sent_at, vec![0, 25]);
    }

    struct Panicking;

    impl Transmitter for Panicking {
        fn transmit(&mut self, _now_ms: u64, _bus: &Bus) {
            panic!("transmitter failure");
        }
    }

    #[test]
    fn poisoned_handlers_are_reported_once_and_skipped() {
        let bus = empty_bus();
        let panicking = Arc::new(Mutex::new(Panicking));
        let periodic = Arc::new(Mutex::new(Periodic {
            cadence: Cadence::new(1),
            sent_at: vec![],
        }));

        let mut builder = RegistryBuilder::new();
        builder.register_transmitter(panicking.clone());
        builder.register_transmitter(periodic.clone());
        let registry = builder.build();

        // Poison the first transmitter's lock.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| registry.tick(0, &bus)));
        assert!(result.is_err());
        assert!(panicking.is_poisoned());

        for now in 1..100 {
            registry.tick(now, &bus);
        }
        let event = bus.events().get(EventCode::HandlerPoisoned).unwrap();
        assert_eq!(event.occurrences, 1);
        assert_eq!(event.data, 0);
        assert_eq!(periodic.lock().unwrap().sent_at.len(), 99);
    }
}
