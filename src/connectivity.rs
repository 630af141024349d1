//! Lower priority peer of the control loop for network facing work.
//!
//! Services registered here may block briefly; they run on their own thread and
//! are supervised by their own watchdog subscription, so a slow service never
//! delays the control loop.

use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::watchdog::WatchdogHandle;

pub const DEFAULT_PERIOD: Duration = Duration::from_millis(10);

/// Something polled periodically from the connectivity context.
pub trait ConnectivityService: Send {
    fn name(&self) -> &str;

    /// Do one unit of pending work.
    fn poll(&mut self) -> crate::Result<()>;
}

pub struct ConnectivityLoop {
    services: Vec<Box<dyn ConnectivityService>>,
    period: Duration,
    watchdog: Option<WatchdogHandle>,
}

impl Default for ConnectivityLoop {
    fn default() -> Self {
        Self::new(DEFAULT_PERIOD)
    }
}

impl ConnectivityLoop {
    pub fn new(period: Duration) -> Self {
        Self {
            services: vec![],
            period,
            watchdog: None,
        }
    }

    pub fn add_service(&mut self, service: Box<dyn ConnectivityService>) {
        info!("connectivity service {} added", service.name());
        self.services.push(service);
    }

    pub fn with_watchdog(mut self, watchdog: WatchdogHandle) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    /// Poll every service once, then feed the watchdog. A failing service is logged and skipped.
    pub fn run_once(&mut self) {
        for service in self.services.iter_mut() {
            if let Err(e) = service.poll() {
                warn!("connectivity service {} failed: {}", service.name(), e);
            }
        }
        if let Some(watchdog) = &self.watchdog {
            watchdog.feed();
        }
    }

    pub fn spawn(mut self) -> std::io::Result<ConnectivityHandle> {
        let (shutdown_sender, mut shutdown_receiver) = oneshot::channel::<()>();

        let handle = std::thread::Builder::new()
            .name("connectivity".to_string())
            .spawn(move || {
                while shutdown_receiver.try_recv().is_err() {
                    self.run_once();
                    std::thread::sleep(self.period);
                }
            })?;

        Ok(ConnectivityHandle {
            handle: Some(handle),
            shutdown: Some(shutdown_sender),
        })
    }
}

/// Running connectivity thread, stopped on drop.
pub struct ConnectivityHandle {
    handle: Option<std::thread::JoinHandle<()>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Drop for ConnectivityHandle {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
