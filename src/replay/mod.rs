//! Replay of captured CAN traces onto one of the attached interfaces.
//!
//! A trace is uploaded as text (possibly in chunks) and replayed by a worker task
//! that reproduces the spacing between the captured timestamps. Only one replay
//! can run at a time. The worker writes straight to the bus, so replaying onto
//! the interface a charger is using will interleave both streams of traffic.
//!
//! ```rust
//! use std::sync::Arc;
//! use charger_emulator::can::{BusBuilder, CanInterface, InterfaceConfig, VirtualCan};
//! use charger_emulator::events::EventLog;
//! use charger_emulator::replay::Replayer;
//!
//! async fn replay_example() {
//!     let (driver, _handle) = VirtualCan::new(CanInterface::NativeCan);
//!     let bus = BusBuilder::new(Arc::new(EventLog::new()))
//!         .attach(InterfaceConfig::native(CanInterface::NativeCan), driver)
//!         .unwrap()
//!         .build();
//!
//!     let replayer = Replayer::new(Arc::new(bus), tokio::runtime::Handle::current());
//!     replayer.import_log("(0.0) can0 30E [1] 03\n(0.03) can0 30E [1] 03\n");
//!     replayer.start(false, CanInterface::NativeCan).unwrap();
//!     replayer.wait().await;
//! }
//! ```

pub mod error;
pub mod parser;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::can::{Bus, CanInterface};
use crate::error::Error;
use crate::events::EventCode;
use crate::replay::parser::{parse_trace, TraceRecord};
use crate::Result;

pub use error::ParseError;
pub use parser::{extended_from_id, parse_line};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Clears the running flag when the worker ends, however it ends.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Replayer {
    bus: Arc<Bus>,
    runtime: Handle,
    trace: Mutex<String>,
    interface: Mutex<CanInterface>,
    running: Arc<AtomicBool>,
    cancel: Mutex<Option<watch::Sender<bool>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Replayer {
    /// Workers are spawned on `runtime`.
    pub fn new(bus: Arc<Bus>, runtime: Handle) -> Self {
        Self {
            bus,
            runtime,
            trace: Mutex::new(String::new()),
            interface: Mutex::new(CanInterface::NativeCan),
            running: Arc::new(AtomicBool::new(false)),
            cancel: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Replace the stored trace.
    pub fn import_log(&self, trace: &str) {
        let mut stored = lock(&self.trace);
        stored.clear();
        stored.push_str(trace);
        info!("replay: imported {} bytes", stored.len());
    }

    /// Append an upload chunk to the stored trace.
    pub fn append_log(&self, chunk: &str) {
        lock(&self.trace).push_str(chunk);
    }

    pub fn clear_log(&self) {
        let mut stored = lock(&self.trace);
        stored.clear();
        stored.shrink_to_fit();
    }

    pub fn log_len(&self) -> usize {
        lock(&self.trace).len()
    }

    /// Select the interface used by the next replay.
    pub fn set_interface(&self, interface: CanInterface) {
        *lock(&self.interface) = interface;
    }

    pub fn interface(&self) -> CanInterface {
        *lock(&self.interface)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start replaying the stored trace onto `target`. Returns immediately; fails
    /// with [`Error::ReplayRunning`] while a previous replay is still running.
    pub fn start(&self, looping: bool, target: CanInterface) -> Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::ReplayRunning);
        }
        let guard = RunningGuard(self.running.clone());

        self.set_interface(target);
        let trace = lock(&self.trace).clone();
        let (cancel_sender, cancel_receiver) = watch::channel(false);
        *lock(&self.cancel) = Some(cancel_sender);

        info!("replay: started on {}, loop: {}", target, looping);
        let bus = self.bus.clone();
        let worker = self.runtime.spawn(async move {
            let _guard = guard;
            play(&bus, trace, looping, target, cancel_receiver).await;
            info!("replay: finished");
        });
        *lock(&self.worker) = Some(worker);

        Ok(())
    }

    /// Ask the running replay to stop. It stops before sending its next frame.
    pub fn stop(&self) {
        if let Some(cancel) = lock(&self.cancel).as_ref() {
            let _ = cancel.send(true);
        }
        if self.is_running() {
            info!("replay: stop requested");
        }
    }

    /// Wait for the current replay worker, if any, to end.
    pub async fn wait(&self) {
        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

impl Drop for Replayer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow()
}

async fn play(bus: &Bus, trace: String, looping: bool, target: CanInterface, mut cancel: watch::Receiver<bool>) {
    let events = bus.events();
    let fd = bus.is_fd(target);

    let records: Vec<(usize, TraceRecord)> = parse_trace(&trace)
        .filter_map(|(line, record)| match record {
            Ok(record) => Some((line, record)),
            Err(e) => {
                debug!("replay: line {} skipped: {}", line, e);
                events.report(EventCode::ReplayParseError, line as u32);
                None
            }
        })
        .collect();
    drop(trace);

    if records.is_empty() {
        return;
    }

    loop {
        let mut previous: Option<f64> = None;
        for (line, record) in &records {
            if let Some(previous) = previous {
                let delay_ms = ((record.timestamp - previous) * 1000.0).round().max(0.0);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(delay_ms as u64)) => {}
                    _ = cancel.changed() => {}
                }
            }
            previous = Some(record.timestamp);

            // A dropped sender means the replayer itself is gone.
            if is_cancelled(&cancel) || cancel.has_changed().is_err() {
                return;
            }

            match record.to_frame(fd) {
                // Write failures are reported by the bus.
                Ok(frame) => {
                    let _ = bus.write_frame(&frame, target);
                }
                Err(_) => events.report(EventCode::ReplayFrameRejected, *line as u32),
            }
        }

        if !looping {
            return;
        }
        // A trace without gaps would otherwise never give the runtime back.
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::{BusBuilder, InterfaceConfig, VirtualCan, VirtualCanHandle};
    use crate::events::EventLog;

    fn replayer(configs: Vec<InterfaceConfig>) -> (Replayer, Vec<VirtualCanHandle>) {
        let mut builder = BusBuilder::new(Arc::new(EventLog::new()));
        let mut handles = vec![];
        for config in configs {
            let (driver, handle) = VirtualCan::new(config.interface);
            builder = builder.attach(config, driver).unwrap();
            handles.push(handle);
        }
        (Replayer::new(Arc::new(builder.build()), Handle::current()), handles)
    }

    fn native() -> (Replayer, VirtualCanHandle) {
        let (replayer, mut handles) = replayer(vec![InterfaceConfig::native(CanInterface::NativeCan)]);
        (replayer, handles.remove(0))
    }

    #[tokio::test(start_paused = true)]
    async fn reproduces_inter_frame_spacing() {
        let (replayer, handle) = native();
        replayer.import_log("(10.0) can0 100 [1] 01\n(10.5) can0 101 [1] 02\n(11.2) can0 102 [1] 03\n");

        let start = tokio::time::Instant::now();
        replayer.start(false, CanInterface::NativeCan).unwrap();
        assert!(replayer.is_running());
        replayer.wait().await;
        assert!(!replayer.is_running());

        let sent = handle.take_transmitted_timed();
        let ids: Vec<u32> = sent.iter().map(|(_, f)| f.raw_id()).collect();
        assert_eq!(ids, vec![0x100, 0x101, 0x102]);
        assert_eq!(sent[0].0 - start, Duration::ZERO);
        assert_eq!(sent[1].0 - sent[0].0, Duration::from_millis(500));
        assert_eq!(sent[2].0 - sent[1].0, Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_line_is_skipped() {
        let (replayer, handle) = native();
        replayer.import_log("(0.0) can0 100 [1] 01\n(0.5 can0 101 [1] 02\n");
        replayer.start(false, CanInterface::NativeCan).unwrap();
        replayer.wait().await;

        assert_eq!(handle.take_transmitted().len(), 1);
        let events = replayer.bus.events();
        assert_eq!(events.get(EventCode::ReplayParseError).unwrap().data, 2);
        assert!(!replayer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_rejected() {
        let (replayer, _handle) = native();
        replayer.import_log("(0.0) can0 100 [0]\n(5.0) can0 100 [0]\n");

        replayer.start(false, CanInterface::NativeCan).unwrap();
        assert_eq!(replayer.start(true, CanInterface::NativeCan), Err(Error::ReplayRunning));
        assert!(replayer.is_running());

        replayer.stop();
        replayer.wait().await;
        assert!(!replayer.is_running());
        assert!(replayer.start(false, CanInterface::NativeCan).is_ok());
        replayer.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_long_delay() {
        let (replayer, handle) = native();
        replayer.import_log("(0.0) can0 100 [0]\n(3600.0) can0 101 [0]\n");

        let start = tokio::time::Instant::now();
        replayer.start(false, CanInterface::NativeCan).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        replayer.stop();
        replayer.wait().await;

        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(handle.take_transmitted().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn looping_restarts_until_stopped() {
        let (replayer, handle) = native();
        replayer.import_log("(0.0) can0 100 [0]\n(0.1) can0 101 [0]\n");

        replayer.start(true, CanInterface::NativeCan).unwrap();
        tokio::time::sleep(Duration::from_millis(450)).await;
        assert!(replayer.is_running());
        replayer.stop();
        replayer.wait().await;

        let ids: Vec<u32> = handle.take_transmitted().iter().map(|f| f.raw_id()).collect();
        assert!(ids.len() >= 4);
        assert_eq!(&ids[..4], &[0x100, 0x101, 0x100, 0x101]);
    }

    #[tokio::test(start_paused = true)]
    async fn frame_type_follows_target() {
        let (replayer, handles) = replayer(vec![
            InterfaceConfig::native(CanInterface::NativeCan),
            InterfaceConfig::native(CanInterface::NativeCanFd),
        ]);
        let trace = format!(
            "(0.0) can0 123 [12] {}\n(0.0) can0 18DAF110 [2] 02 3E\n",
            ["aa"; 12].join(" ")
        );
        replayer.import_log(&trace);

        replayer.start(false, CanInterface::NativeCan).unwrap();
        replayer.wait().await;
        let sent = handles[0].take_transmitted();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].is_extended());
        assert_eq!(replayer.bus.events().occurrences(EventCode::ReplayFrameRejected), 1);

        replayer.start(false, CanInterface::NativeCanFd).unwrap();
        replayer.wait().await;
        let sent = handles[1].take_transmitted();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|f| f.is_fd()));
        assert_eq!(replayer.interface(), CanInterface::NativeCanFd);
    }

    #[tokio::test]
    async fn empty_trace_finishes_immediately() {
        let (replayer, handle) = native();
        replayer.start(true, CanInterface::NativeCan).unwrap();
        replayer.wait().await;
        assert!(!replayer.is_running());
        assert_eq!(handle.transmitted_count(), 0);
    }

    #[tokio::test]
    async fn log_upload_in_chunks() {
        let (replayer, _) = native();
        replayer.import_log("old");
        replayer.import_log("(0.0) can0 ");
        replayer.append_log("100 [0]\n");
        assert_eq!(replayer.log_len(), "(0.0) can0 100 [0]\n".len());
        replayer.clear_log();
        assert_eq!(replayer.log_len(), 0);
    }
}
