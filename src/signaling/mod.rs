//! Signalling bus abstraction
//!
//! The chat gateway is an opaque, at-least-once message transport. The core
//! only needs `send` plus a subscription stream, so any gateway adapter that
//! can provide those slots in here. [`MemoryBus`] is a loopback
//! implementation used by the test suite and by embedders wiring the core
//! into their own event plumbing.

pub mod events;

use crate::Result;
use async_trait::async_trait;
use std::sync::Mutex;
use tokio::sync::mpsc;

pub use events::{InboundSignal, OutboundSignal};

/// An event delivered by the transport adapter
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// A decoded `voice:*` signal
    Signal(InboundSignal),

    /// The underlying transport dropped and re-established its connection;
    /// listeners must restore channel state
    Reconnected,
}

/// Abstract signalling transport
#[async_trait]
pub trait SignalingBus: Send + Sync {
    /// Emit a signal toward the gateway
    async fn send(&self, signal: OutboundSignal) -> Result<()>;

    /// Open a subscription; every bus event is delivered to every open
    /// subscription
    fn subscribe(&self) -> mpsc::UnboundedReceiver<BusEvent>;
}

/// In-memory signalling bus
///
/// Outbound signals are recorded (and mirrored to an optional watcher
/// channel); inbound events are injected with [`MemoryBus::deliver`].
#[derive(Default)]
pub struct MemoryBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<BusEvent>>>,
    sent: Mutex<Vec<OutboundSignal>>,
    watchers: Mutex<Vec<mpsc::UnboundedSender<OutboundSignal>>>,
}

impl MemoryBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject an inbound event, fanning it out to all subscribers
    pub fn deliver(&self, event: BusEvent) {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Snapshot of everything sent so far
    pub fn sent(&self) -> Vec<OutboundSignal> {
        self.sent.lock().unwrap().clone()
    }

    /// Count of sent signals matching an event name
    pub fn sent_count(&self, event_name: &str) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.event_name() == event_name)
            .count()
    }

    /// Open a channel that receives every outbound signal as it is sent
    pub fn watch_outbound(&self) -> mpsc::UnboundedReceiver<OutboundSignal> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.lock().unwrap().push(tx);
        rx
    }
}

#[async_trait]
impl SignalingBus for MemoryBus {
    async fn send(&self, signal: OutboundSignal) -> Result<()> {
        {
            let mut watchers = self.watchers.lock().unwrap();
            watchers.retain(|tx| tx.send(signal.clone()).is_ok());
        }
        self.sent.lock().unwrap().push(signal);
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<BusEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }
}
