use tokio::sync::broadcast;

use crate::share::{AdminNotification, PoolTelemetry, Share};

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Thin typed wrapper over a broadcast channel. Publishing never blocks; a
/// subscriber that falls behind sees `RecvError::Lagged` and resumes from the
/// oldest retained event.
#[derive(Debug, Clone)]
pub struct Bus<T> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone> Bus<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Delivers to current subscribers, returning how many received it.
    /// A bus with no subscribers drops the event; that is not an error.
    pub fn publish(&self, event: T) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone> Default for Bus<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

/// The process-wide event fabric. One instance per cluster; every pool and
/// the relay/receiver publish into the same channels.
#[derive(Debug, Clone, Default)]
pub struct MessageBus {
    pub shares: Bus<Share>,
    pub admin: Bus<AdminNotification>,
    pub telemetry: Bus<PoolTelemetry>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }
}
