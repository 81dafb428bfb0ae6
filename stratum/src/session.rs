use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use orepool_core::{Clock, ShutdownTrigger};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use crate::banning::BanManager;
use crate::codec::{StratumRequest, StratumResponse, unmarshal_request};
use crate::server::RequestHandler;

const MAX_LINE_LENGTH: usize = 8192;

/// Linux errnos treated as routine disconnects rather than faults:
/// ECONNABORTED, ECONNRESET, ETIMEDOUT, ECANCELED, EPIPE.
const IGNORED_ERRNOS: [i32; 5] = [103, 104, 110, 125, 32];

pub(crate) fn is_ignored_socket_error(err: &std::io::Error) -> bool {
    if let Some(errno) = err.raw_os_error() {
        if IGNORED_ERRNOS.contains(&errno) {
            return true;
        }
    }
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::BrokenPipe
    )
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub idle_timeout: Duration,
    /// Outbound messages buffered before the session is considered a slow
    /// consumer and force-closed.
    pub send_queue_depth: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self { idle_timeout: Duration::from_secs(300), send_queue_depth: 256 }
    }
}

/// Negotiated worker state. Owned by the session; observers take copies.
#[derive(Debug, Clone, Default)]
pub struct WorkerContext {
    pub worker_name: Option<String>,
    pub extra_nonce1: String,
    pub difficulty: f64,
    /// Set by the vardiff controller; applied on the next job notification.
    pub pending_difficulty: Option<f64>,
    pub authorized: bool,
    pub subscribed: bool,
}

/// One miner connection. Shared between the I/O driver and the request
/// dispatcher; all outbound traffic funnels through the bounded send queue so
/// broadcasts never interleave bytes mid-line.
pub struct Session {
    id: String,
    remote: SocketAddr,
    pool_id: String,
    worker: Mutex<WorkerContext>,
    outbox: mpsc::Sender<String>,
    close: ShutdownTrigger,
    last_activity_ms: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl Session {
    pub(crate) fn new(
        id: String,
        remote: SocketAddr,
        pool_id: String,
        clock: Arc<dyn Clock>,
        options: &SessionOptions,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (outbox, outbox_rx) = mpsc::channel(options.send_queue_depth);
        let now = clock.now_unix_millis();
        let session = Arc::new(Self {
            id,
            remote,
            pool_id,
            worker: Mutex::new(WorkerContext::default()),
            outbox,
            close: ShutdownTrigger::new(),
            last_activity_ms: AtomicU64::new(now),
            clock,
        });
        (session, outbox_rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }

    /// Run `f` against the worker context under its lock.
    pub fn with_worker<R>(&self, f: impl FnOnce(&mut WorkerContext) -> R) -> R {
        f(&mut self.worker.lock())
    }

    /// Copy-out snapshot for observers.
    pub fn worker_snapshot(&self) -> WorkerContext {
        self.worker.lock().clone()
    }

    pub fn send_response(&self, response: &StratumResponse) {
        if let Ok(line) = serde_json::to_string(response) {
            self.send_line(line);
        }
    }

    pub fn send_notification(&self, request: &StratumRequest) {
        if let Ok(line) = serde_json::to_string(request) {
            self.send_line(line);
        }
    }

    /// Enqueue one already-serialized line. A full queue means the miner is
    /// not keeping up; the session is closed rather than buffering unbounded.
    pub fn send_line(&self, line: String) {
        match self.outbox.try_send(line) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("session {} send queue full, disconnecting", self.id);
                self.close();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    pub fn close(&self) {
        self.close.trigger();
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_triggered()
    }

    fn touch(&self) {
        self.last_activity_ms.store(self.clock.now_unix_millis(), Ordering::Relaxed);
    }
}

/// Drive one session over `stream` until disconnect, close, or idle timeout.
/// Generic over the stream so plain TCP, TLS-wrapped sockets, and in-memory
/// test duplexes all use the same loop.
pub(crate) async fn drive<S>(
    session: Arc<Session>,
    stream: S,
    mut outbox_rx: mpsc::Receiver<String>,
    handler: Arc<dyn RequestHandler>,
    ban_manager: Arc<BanManager>,
    options: SessionOptions,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut frames = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    let writer_session = Arc::clone(&session);
    let mut writer_closed = session.close.listener();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_closed.wait() => {
                    // Flush whatever was queued before the close (error
                    // replies on the junk path), then stop.
                    while let Ok(mut line) = outbox_rx.try_recv() {
                        line.push('\n');
                        if write_half.write_all(line.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
                line = outbox_rx.recv() => {
                    let Some(mut line) = line else { break };
                    line.push('\n');
                    if let Err(e) = write_half.write_all(line.as_bytes()).await {
                        if !is_ignored_socket_error(&e) {
                            tracing::error!("session {} write failed: {}", writer_session.id(), e);
                        }
                        writer_session.close();
                        break;
                    }
                }
            }
        }
        let _ = write_half.shutdown().await;
    });

    let mut closed = session.close.listener();
    loop {
        tokio::select! {
            _ = closed.wait() => break,
            frame = tokio::time::timeout(options.idle_timeout, frames.next()) => {
                match frame {
                    Err(_) => {
                        tracing::debug!("session {} idle for {:?}, closing", session.id(), options.idle_timeout);
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
                        handle_junk(&session, &ban_manager, "oversized frame");
                        break;
                    }
                    Ok(Some(Err(LinesCodecError::Io(e)))) => {
                        if is_ignored_socket_error(&e) {
                            tracing::debug!("session {} disconnected: {}", session.id(), e);
                        } else {
                            tracing::error!("session {} read failed: {}", session.id(), e);
                        }
                        break;
                    }
                    Ok(Some(Ok(line))) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        session.touch();
                        match unmarshal_request(line) {
                            Ok(request) => {
                                if let Some(response) = handler.handle_request(&session, request).await {
                                    session.send_response(&response);
                                }
                            }
                            Err(e) => {
                                tracing::warn!("session {} sent junk: {}", session.id(), e);
                                session.send_response(&StratumResponse::parse_error());
                                handle_junk(&session, &ban_manager, "unparseable frame");
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    session.close();
    // Give the writer a beat to flush queued replies (the parse-error
    // response in the junk path), then stop it.
    let _ = tokio::time::timeout(Duration::from_millis(250), writer).await;
}

fn handle_junk(session: &Arc<Session>, ban_manager: &BanManager, what: &str) {
    if ban_manager.report_junk_receive(session.remote().ip()) {
        tracing::info!("session {} banned after {}", session.id(), what);
    }
}

/// Per-pool extra-nonce source. Monotonic, formatted as fixed-width hex, so
/// no two live sessions of a pool can share a prefix.
pub struct ExtraNonceCounter {
    counter: AtomicU64,
    size_bytes: usize,
}

impl ExtraNonceCounter {
    pub fn new(size_bytes: usize) -> Self {
        Self { counter: AtomicU64::new(0), size_bytes }
    }

    pub fn next(&self) -> String {
        let value = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let mask = if self.size_bytes >= 8 { u64::MAX } else { (1u64 << (self.size_bytes * 8)) - 1 };
        format!("{:0width$x}", value & mask, width = self.size_bytes * 2)
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }
}
