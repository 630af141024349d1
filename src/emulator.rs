//! Startup sequence and the running emulator.
//!
//! [`EmulatorBuilder::build`] wires everything together in the order the
//! control loop depends on: event log, bus, setpoints, charger, frozen registry,
//! watchdog and replay engine. [`Emulator::start`] then starts the execution
//! contexts; nothing can be registered any more at that point.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::can::{Bus, BusBuilder, CanDriver, CanInterface};
use crate::charger::{setup_charger, ChargerHandle, SetpointStore};
use crate::config::{Config, SettingsStore};
use crate::connectivity::{ConnectivityHandle, ConnectivityLoop, ConnectivityService};
use crate::error::Error;
use crate::events::EventLog;
use crate::registry::{Registry, RegistryBuilder, SharedReceiver, SharedTransmitter};
use crate::replay::Replayer;
use crate::scheduler::{ControlLoop, ControlLoopHandle, LogStatusIndicator, StatusIndicator};
use crate::watchdog::{Supervisor, TimeoutPolicy, Watchdog, DEFAULT_TIMEOUT};
use crate::Result;

pub struct EmulatorBuilder {
    config: Config,
    drivers: Vec<(CanInterface, Box<dyn CanDriver>)>,
    transmitters: Vec<SharedTransmitter>,
    receivers: Vec<(SharedReceiver, CanInterface)>,
    services: Vec<Box<dyn ConnectivityService>>,
    status: Box<dyn StatusIndicator>,
    watchdog_timeout: Duration,
    watchdog_policy: TimeoutPolicy,
}

impl EmulatorBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            drivers: vec![],
            transmitters: vec![],
            receivers: vec![],
            services: vec![],
            status: Box::new(LogStatusIndicator::default()),
            watchdog_timeout: DEFAULT_TIMEOUT,
            watchdog_policy: TimeoutPolicy::Abort,
        }
    }

    /// Start from the configuration held in `store`.
    pub fn from_store(store: &dyn SettingsStore) -> Result<Self> {
        Ok(Self::new(Config::load(store)?))
    }

    /// Driver for one interface. A later driver for the same interface replaces the earlier one.
    pub fn driver<D: CanDriver + 'static>(mut self, interface: CanInterface, driver: D) -> Self {
        self.drivers.retain(|(i, _)| *i != interface);
        self.drivers.push((interface, Box::new(driver)));
        self
    }

    /// Additional transmitter ticked after the charger.
    pub fn transmitter(mut self, transmitter: SharedTransmitter) -> Self {
        self.transmitters.push(transmitter);
        self
    }

    /// Additional receiver, e.g. a bus logger.
    pub fn receiver(mut self, receiver: SharedReceiver, interface: CanInterface) -> Self {
        self.receivers.push((receiver, interface));
        self
    }

    pub fn service(mut self, service: Box<dyn ConnectivityService>) -> Self {
        self.services.push(service);
        self
    }

    pub fn status_indicator(mut self, status: Box<dyn StatusIndicator>) -> Self {
        self.status = status;
        self
    }

    pub fn watchdog(mut self, timeout: Duration, policy: TimeoutPolicy) -> Self {
        self.watchdog_timeout = timeout;
        self.watchdog_policy = policy;
        self
    }

    /// Run the startup sequence. Replay workers are spawned on `runtime`.
    pub fn build(self, runtime: Handle) -> Result<Emulator> {
        let config = self.config;
        let events = Arc::new(EventLog::new());

        let mut bus = BusBuilder::new(events.clone());
        for (interface, driver) in self.drivers {
            bus = bus.attach(config.interface_config(interface), driver)?;
        }
        let bus = Arc::new(bus.build());
        for interface in config.used_interfaces() {
            if !bus.is_attached(interface) {
                warn!("{} is configured but has no driver", interface);
            }
        }

        let limits = config
            .charger_type
            .limits()
            .with_user_max_current(config.max_charge_current);
        let setpoints = SetpointStore::new(limits, events.clone());

        let mut registry = RegistryBuilder::new();
        let charger = setup_charger(
            config.charger_type,
            config.charger_interface,
            &setpoints,
            &events,
            &mut registry,
        );
        for transmitter in self.transmitters {
            registry.register_transmitter(transmitter);
        }
        for (receiver, interface) in self.receivers {
            registry.register_receiver(receiver, interface);
        }
        let registry = registry.build();

        let watchdog = Watchdog::new(self.watchdog_timeout, self.watchdog_policy, events.clone());

        let replayer = Arc::new(Replayer::new(bus.clone(), runtime));
        replayer.set_interface(config.replay_interface);

        let mut connectivity = ConnectivityLoop::default();
        for service in self.services {
            connectivity.add_service(service);
        }

        info!(
            "emulator set up: charger {}, {} transmitters",
            config.charger_type.name(),
            registry.transmitter_count()
        );

        Ok(Emulator {
            config,
            events,
            bus,
            setpoints,
            charger,
            registry,
            watchdog,
            replayer,
            connectivity,
            status: self.status,
        })
    }
}

/// A fully set up, not yet running emulator.
pub struct Emulator {
    config: Config,
    events: Arc<EventLog>,
    bus: Arc<Bus>,
    setpoints: SetpointStore,
    charger: Option<ChargerHandle>,
    registry: Registry,
    watchdog: Arc<Watchdog>,
    replayer: Arc<Replayer>,
    connectivity: ConnectivityLoop,
    status: Box<dyn StatusIndicator>,
}

impl Emulator {
    pub fn builder(config: Config) -> EmulatorBuilder {
        EmulatorBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn setpoints(&self) -> &SetpointStore {
        &self.setpoints
    }

    pub fn charger(&self) -> Option<ChargerHandle> {
        self.charger.clone()
    }

    pub fn replayer(&self) -> Arc<Replayer> {
        self.replayer.clone()
    }

    pub fn events(&self) -> Arc<EventLog> {
        self.events.clone()
    }

    pub fn bus(&self) -> Arc<Bus> {
        self.bus.clone()
    }

    /// Start the watchdog supervisor, the control loop and the connectivity loop.
    pub fn start(self) -> Result<RunningEmulator> {
        let supervisor = self
            .watchdog
            .spawn_supervisor()
            .map_err(|_| Error::ThreadSpawn("watchdog"))?;

        let control = ControlLoop::new(self.bus.clone(), self.registry)
            .with_watchdog(self.watchdog.subscribe("control"))
            .with_status_indicator(self.status)
            .spawn()
            .map_err(|_| Error::ThreadSpawn("control"))?;

        let connectivity = self
            .connectivity
            .with_watchdog(self.watchdog.subscribe("connectivity"))
            .spawn()
            .map_err(|_| Error::ThreadSpawn("connectivity"))?;

        info!("emulator running");
        Ok(RunningEmulator {
            control,
            _connectivity: connectivity,
            _supervisor: supervisor,
            config: self.config,
            events: self.events,
            bus: self.bus,
            setpoints: self.setpoints,
            charger: self.charger,
            replayer: self.replayer,
        })
    }
}

/// The running emulator. Dropping it stops every execution context.
pub struct RunningEmulator {
    // Field order is the shutdown order.
    control: ControlLoopHandle,
    _connectivity: ConnectivityHandle,
    _supervisor: Supervisor,
    config: Config,
    events: Arc<EventLog>,
    bus: Arc<Bus>,
    setpoints: SetpointStore,
    charger: Option<ChargerHandle>,
    replayer: Arc<Replayer>,
}

impl RunningEmulator {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn setpoints(&self) -> &SetpointStore {
        &self.setpoints
    }

    pub fn charger(&self) -> Option<ChargerHandle> {
        self.charger.clone()
    }

    pub fn replayer(&self) -> Arc<Replayer> {
        self.replayer.clone()
    }

    pub fn events(&self) -> Arc<EventLog> {
        self.events.clone()
    }

    pub fn bus(&self) -> Arc<Bus> {
        self.bus.clone()
    }

    /// Completed control loop cycles.
    pub fn control_cycles(&self) -> u64 {
        self.control.cycles()
    }

    /// Stop all execution contexts and any running replay.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for RunningEmulator {
    fn drop(&mut self) {
        self.replayer.stop();
        info!("emulator stopping");
    }
}
