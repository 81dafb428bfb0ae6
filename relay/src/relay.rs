use orepool_core::{MessageBus, ShutdownTrigger};
use parking_lot::Mutex;
use thiserror::Error;
use zeromq::{PubSocket, Socket, SocketSend, ZmqMessage};

use crate::wire::{WireError, WireFormat, encode_share};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay socket failure: {0}")]
    Socket(String),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("relay already started")]
    AlreadyStarted,
}

#[derive(Debug, Clone)]
pub struct ShareRelayOptions {
    /// ZeroMQ publish endpoint, e.g. `tcp://0.0.0.0:6000`.
    pub publish_url: String,
    pub format: WireFormat,
}

/// Fan-out publisher for validated shares. Subscribes to the local share bus
/// and republishes every event as a three-frame message
/// `[topic = pool id, flags, payload]` for remote clusters.
pub struct ShareRelay {
    options: ShareRelayOptions,
    running: Mutex<Option<ShutdownTrigger>>,
}

impl ShareRelay {
    pub fn new(options: ShareRelayOptions) -> Self {
        Self { options, running: Mutex::new(None) }
    }

    /// Bind the publish socket and start forwarding. Returns the resolved
    /// endpoint (useful when the configured port is 0).
    pub async fn start(&self, bus: &MessageBus) -> Result<String, RelayError> {
        if self.running.lock().is_some() {
            return Err(RelayError::AlreadyStarted);
        }

        let mut socket = PubSocket::new();
        let endpoint = socket.bind(&self.options.publish_url).await.map_err(|e| RelayError::Socket(e.to_string()))?;
        let endpoint = endpoint.to_string();
        tracing::info!("share relay publishing on {}", endpoint);

        let trigger = ShutdownTrigger::new();
        let mut shutdown = trigger.listener();
        *self.running.lock() = Some(trigger);

        let format = self.options.format;
        let mut shares = bus.shares.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    received = shares.recv() => {
                        let share = match received {
                            Ok(share) => share,
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                                tracing::warn!("share relay lagged, {} shares not relayed", missed);
                                continue;
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        };
                        let payload = match encode_share(&share, format) {
                            Ok(payload) => payload,
                            Err(e) => {
                                tracing::error!("share encode failed: {}", e);
                                continue;
                            }
                        };
                        let mut message = ZmqMessage::from(share.pool_id.as_str());
                        message.push_back(format.flags().to_be_bytes().to_vec().into());
                        message.push_back(payload.into());
                        if let Err(e) = socket.send(message).await {
                            tracing::warn!("share relay send failed: {}", e);
                        }
                    }
                }
            }
        });

        Ok(endpoint)
    }

    pub fn stop(&self) {
        if let Some(trigger) = self.running.lock().take() {
            trigger.trigger();
            tracing::info!("share relay stopped");
        }
    }
}
