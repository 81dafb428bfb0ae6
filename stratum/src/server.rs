use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use orepool_core::{Clock, ShutdownTrigger};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use uuid::Uuid;

use crate::banning::BanManager;
use crate::codec::{StratumRequest, StratumResponse};
use crate::session::{self, Session, SessionOptions};
use crate::tls::{TlsConfigCache, TlsError};
use crate::vardiff::VardiffOptions;

const LISTEN_BACKLOG: u32 = 1024;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("server already started")]
    AlreadyStarted,
}

/// TLS material for one listening endpoint, referencing PEM files on disk.
#[derive(Debug, Clone)]
pub struct TlsListenerMaterial {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// One stratum listening endpoint and the worker defaults it hands out.
#[derive(Debug, Clone)]
pub struct ListenerDescriptor {
    pub bind: SocketAddr,
    pub base_difficulty: f64,
    pub tls: Option<TlsListenerMaterial>,
    pub vardiff: Option<VardiffOptions>,
}

/// The pool side of the stratum server: request dispatch plus connection
/// lifecycle hooks.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle_request(&self, session: &Arc<Session>, request: StratumRequest) -> Option<StratumResponse>;

    async fn on_connect(&self, _session: &Arc<Session>, _listener: &ListenerDescriptor) {}

    async fn on_disconnect(&self, _session: &Arc<Session>) {}
}

struct Running {
    trigger: ShutdownTrigger,
    tasks: Vec<JoinHandle<()>>,
    local_addrs: Vec<SocketAddr>,
}

/// Multi-port TCP front-end. Owns the session registry; everything else sees
/// snapshots.
pub struct StratumServer {
    pool_id: String,
    clock: Arc<dyn Clock>,
    ban_manager: Arc<BanManager>,
    tls_cache: Arc<TlsConfigCache>,
    options: SessionOptions,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    running: Mutex<Option<Running>>,
}

impl StratumServer {
    pub fn new(
        pool_id: String,
        clock: Arc<dyn Clock>,
        ban_manager: Arc<BanManager>,
        tls_cache: Arc<TlsConfigCache>,
        options: SessionOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool_id,
            clock,
            ban_manager,
            tls_cache,
            options,
            sessions: Mutex::new(HashMap::new()),
            running: Mutex::new(None),
        })
    }

    /// Bind every listener and begin accepting. Fails without side effects if
    /// any endpoint cannot be bound or its TLS material cannot be loaded.
    pub async fn start(
        self: &Arc<Self>,
        handler: Arc<dyn RequestHandler>,
        listeners: &[ListenerDescriptor],
    ) -> Result<Vec<SocketAddr>, ServerError> {
        if self.running.lock().is_some() {
            return Err(ServerError::AlreadyStarted);
        }

        let trigger = ShutdownTrigger::new();
        let mut bound = Vec::with_capacity(listeners.len());
        for descriptor in listeners {
            let listener = bind_listener(descriptor.bind)?;
            let local_addr = listener.local_addr().map_err(|source| ServerError::Bind { addr: descriptor.bind, source })?;
            let acceptor = match &descriptor.tls {
                Some(material) => {
                    let config = self.tls_cache.server_config(&material.cert_path, &material.key_path)?;
                    Some(TlsAcceptor::from(config))
                }
                None => None,
            };
            bound.push((listener, local_addr, acceptor, Arc::new(descriptor.clone())));
        }

        let mut tasks = Vec::with_capacity(bound.len());
        let mut local_addrs = Vec::with_capacity(bound.len());
        for (listener, local_addr, acceptor, descriptor) in bound {
            tracing::info!("pool {} stratum listening on {}", self.pool_id, local_addr);
            local_addrs.push(local_addr);
            let server = Arc::clone(self);
            let handler = Arc::clone(&handler);
            let shutdown = trigger.listener();
            tasks.push(tokio::spawn(async move {
                server.accept_loop(listener, acceptor, descriptor, handler, shutdown).await;
            }));
        }

        *self.running.lock() = Some(Running { trigger, tasks, local_addrs: local_addrs.clone() });
        Ok(local_addrs)
    }

    /// Close all listeners and live sessions. Safe to call repeatedly and to
    /// follow with another `start`.
    pub fn stop(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else { return };
        tracing::info!("pool {} stratum server stopping", self.pool_id);
        running.trigger.trigger();
        for task in running.tasks {
            task.abort();
        }
        let sessions: Vec<_> = {
            let mut registry = self.sessions.lock();
            registry.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.close();
        }
        tracing::info!("pool {} stratum server stopped", self.pool_id);
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addrs.clone()).unwrap_or_default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Copied snapshot of the live registry; iteration never holds the lock.
    pub fn sessions_snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Fan a notification out to every live session. Delivery is independent
    /// per session: a slow consumer fills its own queue and gets dropped
    /// without stalling the rest.
    pub fn broadcast_notification(&self, request: &StratumRequest) {
        let Ok(line) = serde_json::to_string(request) else { return };
        for session in self.sessions_snapshot() {
            session.send_line(line.clone());
        }
    }

    /// Fan out with a per-session payload (difficulty notifications differ
    /// between workers). `None` skips the session.
    pub fn broadcast_with(&self, build: impl Fn(&Arc<Session>) -> Option<Vec<StratumRequest>>) {
        for session in self.sessions_snapshot() {
            if let Some(requests) = build(&session) {
                for request in &requests {
                    session.send_notification(request);
                }
            }
        }
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        acceptor: Option<TlsAcceptor>,
        descriptor: Arc<ListenerDescriptor>,
        handler: Arc<dyn RequestHandler>,
        mut shutdown: orepool_core::ShutdownListener,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            // Banned peers are dropped before any read.
                            if self.ban_manager.is_banned(peer.ip()) {
                                tracing::debug!("refused banned peer {}", peer.ip());
                                drop(stream);
                                continue;
                            }
                            self.spawn_connection(stream, peer, acceptor.clone(), Arc::clone(&descriptor), Arc::clone(&handler));
                        }
                        Err(e) => {
                            tracing::warn!("pool {} accept failed: {}", self.pool_id, e);
                        }
                    }
                }
            }
        }
    }

    fn spawn_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        acceptor: Option<TlsAcceptor>,
        descriptor: Arc<ListenerDescriptor>,
        handler: Arc<dyn RequestHandler>,
    ) {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let _ = stream.set_nodelay(true);
            let connection_id = Uuid::new_v4().to_string();
            let (session, outbox_rx) =
                Session::new(connection_id.clone(), peer, server.pool_id.clone(), Arc::clone(&server.clock), &server.options);

            server.sessions.lock().insert(connection_id.clone(), Arc::clone(&session));
            // A stop() racing this accept already drained the registry; don't
            // let the new session outlive it.
            if server.running.lock().is_none() {
                session.close();
            }
            handler.on_connect(&session, &descriptor).await;

            match acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        session::drive(
                            Arc::clone(&session),
                            tls_stream,
                            outbox_rx,
                            Arc::clone(&handler),
                            Arc::clone(&server.ban_manager),
                            server.options.clone(),
                        )
                        .await;
                    }
                    Err(e) => {
                        tracing::debug!("tls handshake with {} failed: {}", peer, e);
                        session.close();
                    }
                },
                None => {
                    session::drive(
                        Arc::clone(&session),
                        stream,
                        outbox_rx,
                        Arc::clone(&handler),
                        Arc::clone(&server.ban_manager),
                        server.options.clone(),
                    )
                    .await;
                }
            }

            server.sessions.lock().remove(&connection_id);
            handler.on_disconnect(&session).await;
        });
    }
}

fn bind_listener(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(|source| ServerError::Bind { addr, source })?;
    socket.set_reuseaddr(true).map_err(|source| ServerError::Bind { addr, source })?;
    socket.bind(addr).map_err(|source| ServerError::Bind { addr, source })?;
    socket.listen(LISTEN_BACKLOG).map_err(|source| ServerError::Bind { addr, source })
}
