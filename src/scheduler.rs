//! The 1 ms control loop.
//!
//! Each cycle drains the receive side of every attached interface into the
//! receivers, runs housekeeping every 10 ms, ticks the transmitters, and finally
//! feeds the watchdog. The thread paces itself on absolute deadlines, so the time
//! spent in a cycle does not accumulate as drift.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::can::{Bus, CanInterface};
use crate::events::{EventCode, EventLevel, EventLog};
use crate::registry::{Cadence, Registry};
use crate::watchdog::WatchdogHandle;

/// Control loop period.
pub const CYCLE: Duration = Duration::from_millis(1);
/// Housekeeping (status indication) period.
pub const HOUSEKEEPING_INTERVAL_MS: u64 = 10;
/// Upper bound on frames drained from one interface in a single cycle.
pub const MAX_FRAMES_PER_CYCLE: usize = 64;
/// A cycle this late gives up on catching up and re-anchors its deadline.
const RESYNC_THRESHOLD: Duration = Duration::from_millis(20);

/// Low rate status output, e.g. a status LED.
pub trait StatusIndicator: Send {
    fn update(&mut self, events: &EventLog);
}

/// [`StatusIndicator`] that logs whenever the worst active event level changes.
#[derive(Debug, Default)]
pub struct LogStatusIndicator {
    last: Option<Option<EventLevel>>,
}

impl StatusIndicator for LogStatusIndicator {
    fn update(&mut self, events: &EventLog) {
        let level = events.worst_level();
        if self.last != Some(level) {
            match level {
                Some(level) => info!("status: {}", level),
                None => info!("status: ok"),
            }
            self.last = Some(level);
        }
    }
}

pub struct ControlLoop {
    bus: Arc<Bus>,
    registry: Registry,
    interfaces: Vec<CanInterface>,
    watchdog: Option<WatchdogHandle>,
    status: Option<Box<dyn StatusIndicator>>,
    housekeeping: Cadence,
}

impl ControlLoop {
    pub fn new(bus: Arc<Bus>, registry: Registry) -> Self {
        let interfaces = bus.attached().collect();
        Self {
            bus,
            registry,
            interfaces,
            watchdog: None,
            status: None,
            housekeeping: Cadence::new(HOUSEKEEPING_INTERVAL_MS),
        }
    }

    pub fn with_watchdog(mut self, watchdog: WatchdogHandle) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    pub fn with_status_indicator(mut self, status: Box<dyn StatusIndicator>) -> Self {
        self.status = Some(status);
        self
    }

    /// Run one cycle at monotonic time `now_ms`.
    pub fn run_cycle(&mut self, now_ms: u64) {
        for &interface in &self.interfaces {
            for _ in 0..MAX_FRAMES_PER_CYCLE {
                let Some(frame) = self.bus.poll_frame(interface) else {
                    break;
                };
                self.registry.dispatch(interface, &frame, self.bus.events());
            }
        }

        if self.housekeeping.due(now_ms) {
            if let Some(status) = self.status.as_mut() {
                status.update(self.bus.events());
            }
        }

        self.registry.tick(now_ms, &self.bus);

        if let Some(watchdog) = &self.watchdog {
            watchdog.feed();
        }
    }

    /// Run the loop on its own thread until the returned handle is stopped or dropped.
    pub fn spawn(mut self) -> std::io::Result<ControlLoopHandle> {
        let (shutdown_sender, mut shutdown_receiver) = oneshot::channel::<()>();
        let cycles = Arc::new(AtomicU64::new(0));
        let counter = cycles.clone();

        let handle = std::thread::Builder::new()
            .name("control".to_string())
            .spawn(move || {
                info!(
                    "control loop started, {} transmitters, interfaces {:?}",
                    self.registry.transmitter_count(),
                    self.interfaces
                );

                let start = Instant::now();
                let mut deadline = start;
                while shutdown_receiver.try_recv().is_err() {
                    let now_ms = start.elapsed().as_millis() as u64;
                    self.run_cycle(now_ms);
                    counter.fetch_add(1, Ordering::Relaxed);

                    deadline += CYCLE;
                    let now = Instant::now();
                    if now < deadline {
                        std::thread::sleep(deadline - now);
                    } else if now - deadline > RESYNC_THRESHOLD {
                        let behind = now - deadline;
                        warn!("control loop {} ms behind, resyncing", behind.as_millis());
                        self.bus
                            .events()
                            .report(EventCode::ControlLoopOverrun, behind.as_millis() as u32);
                        deadline = now;
                    }
                }
                info!("control loop stopped");
            })?;

        Ok(ControlLoopHandle {
            handle: Some(handle),
            shutdown: Some(shutdown_sender),
            cycles,
        })
    }
}

/// Running control loop thread.
pub struct ControlLoopHandle {
    handle: Option<std::thread::JoinHandle<()>>,
    shutdown: Option<oneshot::Sender<()>>,
    cycles: Arc<AtomicU64>,
}

impl ControlLoopHandle {
    /// Number of completed cycles.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Stop the loop and wait for the current cycle to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ControlLoopHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::can::{BusBuilder, Frame, Identifier, InterfaceConfig, VirtualCan, VirtualCanHandle};
    use crate::registry::{Receiver, RegistryBuilder, Transmitter};
    use crate::watchdog::{TimeoutPolicy, Watchdog};

    #[derive(Default)]
    struct Recorder {
        received: Vec<u32>,
        ticks: Vec<u64>,
    }

    impl Receiver for Recorder {
        fn receive(&mut self, frame: &Frame, _interface: CanInterface) {
            self.received.push(frame.raw_id());
        }
    }

    impl Transmitter for Recorder {
        fn transmit(&mut self, now_ms: u64, _bus: &Bus) {
            self.ticks.push(now_ms);
        }
    }

    struct CountingStatus(Arc<AtomicU64>);

    impl StatusIndicator for CountingStatus {
        fn update(&mut self, _events: &EventLog) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn setup() -> (ControlLoop, Arc<Mutex<Recorder>>, VirtualCanHandle) {
        let (driver, handle) = VirtualCan::new(CanInterface::NativeCan);
        let bus = BusBuilder::new(Arc::new(EventLog::new()))
            .attach(InterfaceConfig::native(CanInterface::NativeCan), driver)
            .unwrap()
            .build();

        let recorder = Arc::new(Mutex::new(Recorder::default()));
        let mut builder = RegistryBuilder::new();
        builder.register_receiver(recorder.clone(), CanInterface::NativeCan);
        builder.register_transmitter(recorder.clone());

        (ControlLoop::new(Arc::new(bus), builder.build()), recorder, handle)
    }

    #[test]
    fn cycle_drains_then_ticks() {
        let (mut control, recorder, handle) = setup();
        for id in [0x100, 0x101, 0x102] {
            handle.inject(Frame::new(Identifier::Standard(id), &[]).unwrap());
        }

        control.run_cycle(7);
        let recorder = recorder.lock().unwrap();
        assert_eq!(recorder.received, vec![0x100, 0x101, 0x102]);
        assert_eq!(recorder.ticks, vec![7]);
        assert_eq!(handle.pending_rx(), 0);
    }

    #[test]
    fn receive_drain_is_capped() {
        let (mut control, recorder, handle) = setup();
        let frame = Frame::new(Identifier::Standard(0x390), &[0; 8]).unwrap();
        for _ in 0..MAX_FRAMES_PER_CYCLE + 10 {
            handle.inject(frame);
        }

        control.run_cycle(0);
        assert_eq!(recorder.lock().unwrap().received.len(), MAX_FRAMES_PER_CYCLE);
        assert_eq!(handle.pending_rx(), 10);

        control.run_cycle(1);
        assert_eq!(handle.pending_rx(), 0);
    }

    #[test]
    fn housekeeping_every_ten_cycles() {
        let (control, _, _) = setup();
        let updates = Arc::new(AtomicU64::new(0));
        let mut control = control.with_status_indicator(Box::new(CountingStatus(updates.clone())));

        for now in 0..100 {
            control.run_cycle(now);
        }
        assert_eq!(updates.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn cycle_feeds_watchdog() {
        let (control, _, _) = setup();
        let watchdog = Watchdog::new(Duration::from_millis(50), TimeoutPolicy::Report, Arc::new(EventLog::new()));
        let mut control = control.with_watchdog(watchdog.subscribe("control"));

        std::thread::sleep(Duration::from_millis(60));
        control.run_cycle(0);
        assert!(watchdog.check(Instant::now()).is_empty());
    }

    #[test]
    fn thread_runs_until_stopped() {
        let (control, recorder, _) = setup();
        let handle = control.spawn().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        handle.stop();

        let ticks = recorder.lock().unwrap().ticks.clone();
        assert!(ticks.len() > 10);
        assert!(ticks.windows(2).all(|w| w[0] <= w[1]));
    }

    struct BusyTransmitter(Duration);

    impl Transmitter for BusyTransmitter {
        fn transmit(&mut self, _now_ms: u64, _bus: &Bus) {
            let start = Instant::now();
            while start.elapsed() < self.0 {
                std::hint::spin_loop();
            }
        }
    }

    #[test]
    fn cycle_work_does_not_accumulate_drift() {
        let (driver, _handle) = VirtualCan::new(CanInterface::NativeCan);
        let bus = BusBuilder::new(Arc::new(EventLog::new()))
            .attach(InterfaceConfig::native(CanInterface::NativeCan), driver)
            .unwrap()
            .build();
        let mut builder = RegistryBuilder::new();
        builder.register_transmitter(Arc::new(Mutex::new(BusyTransmitter(Duration::from_micros(600)))));

        let started = Instant::now();
        let handle = ControlLoop::new(Arc::new(bus), builder.build()).spawn().unwrap();
        std::thread::sleep(Duration::from_millis(1000));
        let cycles = handle.cycles();
        let elapsed_ms = started.elapsed().as_millis() as u64;
        handle.stop();

        // Sleeping a full period after 0.6 ms of work would give about 620 cycles.
        assert!(cycles * 100 >= elapsed_ms * 90, "{} cycles in {} ms", cycles, elapsed_ms);
        assert!(cycles <= elapsed_ms + 2, "{} cycles in {} ms", cycles, elapsed_ms);
    }
}
