//! In-memory [`CanDriver`] used when no controller is attached, and by the tests.
//!
//! Frames written by the emulator end up in a bounded transmit queue that the
//! owner of the matching [`VirtualCanHandle`] can drain, and frames injected
//! through the handle are returned by `poll`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::time::Instant;

use crate::can::{CanDriver, CanInterface, Frame};
use crate::error::Error;

const DEFAULT_TX_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Queues {
    rx: VecDeque<Frame>,
    tx: VecDeque<(Instant, Frame)>,
    tx_capacity: usize,
}

/// Driver side of a virtual channel.
pub struct VirtualCan {
    interface: CanInterface,
    queues: Arc<Mutex<Queues>>,
}

/// Test/bench side of a virtual channel.
#[derive(Clone)]
pub struct VirtualCanHandle {
    queues: Arc<Mutex<Queues>>,
}

impl VirtualCan {
    pub fn new(interface: CanInterface) -> (VirtualCan, VirtualCanHandle) {
        Self::with_capacity(interface, DEFAULT_TX_CAPACITY)
    }

    /// Create a channel whose transmit queue holds at most `tx_capacity` frames.
    pub fn with_capacity(interface: CanInterface, tx_capacity: usize) -> (VirtualCan, VirtualCanHandle) {
        let queues = Arc::new(Mutex::new(Queues {
            rx: VecDeque::new(),
            tx: VecDeque::new(),
            tx_capacity,
        }));

        (
            VirtualCan {
                interface,
                queues: queues.clone(),
            },
            VirtualCanHandle { queues },
        )
    }
}

impl CanDriver for VirtualCan {
    fn write(&mut self, frame: &Frame) -> Result<(), Error> {
        let mut queues = self.queues.lock().map_err(|_| Error::InterfaceUnavailable(self.interface))?;
        if queues.tx.len() >= queues.tx_capacity {
            return Err(Error::BufferFull(self.interface));
        }
        queues.tx.push_back((Instant::now(), *frame));
        Ok(())
    }

    fn poll(&mut self) -> Result<Option<Frame>, Error> {
        let mut queues = self.queues.lock().map_err(|_| Error::InterfaceUnavailable(self.interface))?;
        Ok(queues.rx.pop_front())
    }
}

impl VirtualCanHandle {
    /// Queue a frame as if it arrived from the wire.
    pub fn inject(&self, frame: Frame) {
        if let Ok(mut queues) = self.queues.lock() {
            queues.rx.push_back(frame);
        }
    }

    /// Drain everything the emulator sent so far.
    pub fn take_transmitted(&self) -> Vec<Frame> {
        self.take_transmitted_timed().into_iter().map(|(_, frame)| frame).collect()
    }

    /// Drain everything the emulator sent so far, with the instant each frame was handed to the driver.
    pub fn take_transmitted_timed(&self) -> Vec<(Instant, Frame)> {
        match self.queues.lock() {
            Ok(mut queues) => queues.tx.drain(..).collect(),
            Err(_) => vec![],
        }
    }

    pub fn transmitted_count(&self) -> usize {
        self.queues.lock().map(|q| q.tx.len()).unwrap_or(0)
    }

    /// Frames injected but not yet polled by the emulator.
    pub fn pending_rx(&self) -> usize {
        self.queues.lock().map(|q| q.rx.len()).unwrap_or(0)
    }
}
