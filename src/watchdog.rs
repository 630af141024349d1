//! Task watchdog for the long-lived execution contexts.
//!
//! Every supervised context subscribes once and must call
//! [`WatchdogHandle::feed`] within the timeout. A supervisor thread checks the
//! subscriptions periodically; what happens to a context that misses its horizon
//! is decided by the [`TimeoutPolicy`].

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::events::{EventCode, EventLog};

/// Horizon within which every supervised context must feed the watchdog.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const CHECK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TimeoutPolicy {
    /// Abort the process, the equivalent of a hardware watchdog reset.
    Abort,
    /// Log the timeout and report a [`EventCode::WatchdogTimeout`] event.
    Report,
}

#[derive(Debug)]
struct Subscription {
    name: String,
    last_feed: Instant,
    expired: bool,
}

#[derive(Debug)]
pub struct Watchdog {
    timeout: Duration,
    policy: TimeoutPolicy,
    subscriptions: Mutex<Vec<Subscription>>,
    events: Arc<EventLog>,
}

/// Subscription of one execution context.
#[derive(Debug)]
pub struct WatchdogHandle {
    watchdog: Arc<Watchdog>,
    index: usize,
}

impl WatchdogHandle {
    /// Reset the timeout of this context.
    pub fn feed(&self) {
        self.watchdog.feed(self.index, Instant::now());
    }

    pub fn name(&self) -> String {
        self.watchdog
            .subscriptions
            .lock()
            .map(|s| s[self.index].name.clone())
            .unwrap_or_default()
    }
}

impl Watchdog {
    pub fn new(timeout: Duration, policy: TimeoutPolicy, events: Arc<EventLog>) -> Arc<Self> {
        Arc::new(Self {
            timeout,
            policy,
            subscriptions: Mutex::new(Vec::new()),
            events,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Add a context to the supervised set. The timeout starts running immediately.
    pub fn subscribe(self: &Arc<Self>, name: &str) -> WatchdogHandle {
        let mut subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscriptions.push(Subscription {
            name: name.to_string(),
            last_feed: Instant::now(),
            expired: false,
        });
        debug!("watchdog: {} subscribed", name);

        WatchdogHandle {
            watchdog: self.clone(),
            index: subscriptions.len() - 1,
        }
    }

    fn feed(&self, index: usize, now: Instant) {
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            let subscription = &mut subscriptions[index];
            subscription.last_feed = now;
            subscription.expired = false;
        }
    }

    /// Names of the contexts that have not been fed within the timeout at `now`.
    /// A context is reported once per expiry; feeding it re-arms the report.
    pub fn check(&self, now: Instant) -> Vec<String> {
        let Ok(mut subscriptions) = self.subscriptions.lock() else {
            return vec![];
        };

        let mut expired = vec![];
        for subscription in subscriptions.iter_mut() {
            let elapsed = now.saturating_duration_since(subscription.last_feed);
            if elapsed < self.timeout || subscription.expired {
                continue;
            }
            subscription.expired = true;

            error!(
                "watchdog: {} not fed for {} ms",
                subscription.name,
                elapsed.as_millis()
            );
            self.events
                .report(EventCode::WatchdogTimeout, elapsed.as_millis().min(u32::MAX as u128) as u32);
            expired.push(subscription.name.clone());
        }
        drop(subscriptions);

        if !expired.is_empty() && self.policy == TimeoutPolicy::Abort {
            std::process::abort();
        }
        expired
    }

    /// Start the supervisor thread. It stops when the returned handle is dropped.
    pub fn spawn_supervisor(self: &Arc<Self>) -> std::io::Result<Supervisor> {
        let (shutdown_sender, mut shutdown_receiver) = oneshot::channel::<()>();
        let watchdog = self.clone();

        let handle = std::thread::Builder::new()
            .name("watchdog".to_string())
            .spawn(move || {
                while shutdown_receiver.try_recv().is_err() {
                    watchdog.check(Instant::now());
                    std::thread::sleep(CHECK_INTERVAL);
                }
            })?;

        Ok(Supervisor {
            handle: Some(handle),
            shutdown: Some(shutdown_sender),
        })
    }
}

/// Running supervisor thread.
pub struct Supervisor {
    handle: Option<std::thread::JoinHandle<()>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
