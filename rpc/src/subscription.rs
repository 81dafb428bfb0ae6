use std::time::Duration;

use futures_util::StreamExt;
use orepool_core::ShutdownListener;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Subscribe to a daemon's websocket push channel. Every JSON text frame is
/// handed to `on_message`; the connection is re-established after errors
/// until the shutdown listener fires. Push is an optimization over polling,
/// so failures here never propagate.
pub fn spawn_push_subscription<F>(ws_url: String, mut shutdown: ShutdownListener, on_message: F) -> JoinHandle<()>
where
    F: Fn(Value) + Send + Sync + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                connected = connect_async(ws_url.as_str()) => {
                    match connected {
                        Ok((mut stream, _)) => {
                            tracing::info!("websocket subscription to {} established", ws_url);
                            loop {
                                tokio::select! {
                                    _ = shutdown.wait() => return,
                                    frame = stream.next() => {
                                        match frame {
                                            Some(Ok(Message::Text(text))) => {
                                                match serde_json::from_str::<Value>(&text) {
                                                    Ok(value) => on_message(value),
                                                    Err(e) => tracing::warn!("unparseable push payload: {}", e),
                                                }
                                            }
                                            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                                            Some(Ok(Message::Close(_))) | None => {
                                                tracing::info!("websocket {} closed", ws_url);
                                                break;
                                            }
                                            Some(Ok(_)) => {}
                                            Some(Err(e)) => {
                                                tracing::warn!("websocket {} failed: {}", ws_url, e);
                                                break;
                                            }
                                        }
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!("websocket connect to {} failed: {}", ws_url, e);
                        }
                    }
                }
            }
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }
    })
}
