use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use orepool_core::{Clock, MessageBus, ShutdownTrigger};
use parking_lot::Mutex;
use zeromq::{Socket, SocketRecv, SubSocket, ZmqMessage};

use crate::wire::{decode_share, parse_flags};

/// A subscriber torn down and re-established after this long without frames.
const SILENCE_TIMEOUT: Duration = Duration::from_secs(60);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// One remote relay to subscribe to, from `externalStratums[]`.
#[derive(Debug, Clone)]
pub struct RelaySubscription {
    pub url: String,
    pub topics: Vec<String>,
    /// Cluster name stamped into `source` on every received share.
    pub cluster_name: String,
}

/// Subscriber side of the relay fabric: deserializes foreign shares and
/// re-injects them into the local bus as if locally produced, with `source`
/// and `created` rewritten.
pub struct ShareReceiver {
    clock: Arc<dyn Clock>,
    running: Mutex<Option<ShutdownTrigger>>,
}

impl ShareReceiver {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, running: Mutex::new(None) }
    }

    pub fn start(&self, bus: &MessageBus, subscriptions: Vec<RelaySubscription>) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }
        let trigger = ShutdownTrigger::new();
        for subscription in subscriptions {
            let shutdown = trigger.listener();
            let bus = bus.clone();
            let clock = Arc::clone(&self.clock);
            tokio::spawn(run_subscription(subscription, bus, clock, shutdown));
        }
        *running = Some(trigger);
    }

    pub fn stop(&self) {
        if let Some(trigger) = self.running.lock().take() {
            trigger.trigger();
            tracing::info!("share receiver stopped");
        }
    }
}

async fn run_subscription(
    subscription: RelaySubscription,
    bus: MessageBus,
    clock: Arc<dyn Clock>,
    mut shutdown: orepool_core::ShutdownListener,
) {
    let topics: HashSet<String> = subscription.topics.iter().cloned().collect();
    loop {
        match connect(&subscription).await {
            Ok(mut socket) => {
                tracing::info!("subscribed to relay {} for topics {:?}", subscription.url, subscription.topics);
                loop {
                    let frame = tokio::select! {
                        _ = shutdown.wait() => return,
                        frame = tokio::time::timeout(SILENCE_TIMEOUT, socket.recv()) => frame,
                    };
                    match frame {
                        Err(_) => {
                            tracing::warn!("relay {} silent for {:?}, reconnecting", subscription.url, SILENCE_TIMEOUT);
                            break;
                        }
                        Ok(Err(e)) => {
                            tracing::warn!("relay {} receive failed: {}, reconnecting", subscription.url, e);
                            break;
                        }
                        Ok(Ok(message)) => {
                            handle_message(&subscription, &topics, &bus, &clock, message);
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!("relay connect to {} failed: {}", subscription.url, e);
            }
        }
        tokio::select! {
            _ = shutdown.wait() => return,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

async fn connect(subscription: &RelaySubscription) -> Result<SubSocket, String> {
    let mut socket = SubSocket::new();
    socket.connect(&subscription.url).await.map_err(|e| e.to_string())?;
    for topic in &subscription.topics {
        socket.subscribe(topic).await.map_err(|e| e.to_string())?;
    }
    Ok(socket)
}

fn handle_message(
    subscription: &RelaySubscription,
    topics: &HashSet<String>,
    bus: &MessageBus,
    clock: &Arc<dyn Clock>,
    message: ZmqMessage,
) {
    let frames = message.into_vec();
    if frames.len() != 3 {
        tracing::warn!("relay {} sent {}-frame message, expected 3", subscription.url, frames.len());
        return;
    }

    let topic = String::from_utf8_lossy(frames[0].as_ref()).to_string();
    // ZeroMQ topic filters are prefix matches; enforce exact membership.
    if !topics.contains(&topic) {
        tracing::warn!("dropping share for unsubscribed topic {}", topic);
        return;
    }

    let format = match parse_flags(frames[1].as_ref()) {
        Ok((_, format)) => format,
        Err(e) => {
            tracing::warn!("relay {}: {}", subscription.url, e);
            return;
        }
    };

    match decode_share(frames[2].as_ref(), format) {
        Ok(mut share) => {
            share.source = subscription.cluster_name.clone();
            share.created_ms = clock.now_unix_millis();
            bus.shares.publish(share);
        }
        Err(e) => {
            tracing::warn!("relay {}: dropping undecodable share: {}", subscription.url, e);
        }
    }
}
