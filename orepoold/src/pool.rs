use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use orepool_core::{AdminNotification, Clock, MessageBus, PoolTelemetry, ShutdownTrigger};
use orepool_mining::{
    Blake2Chain, ChainShareValidator, ContextCache, HeaderShareValidator, Job, JobEvent, JobManager, JobManagerError,
    JobManagerOptions, ShareValidator, SubmitContext, WorkProvider,
};
use orepool_rpc::{DaemonClient, DaemonClientOptions, RpcError, spawn_push_subscription};
use orepool_stratum::{
    BanManager, ExtraNonceCounter, ListenerDescriptor, RequestHandler, ServerError, Session, SessionOptions,
    StratumRequest, StratumResponse, StratumServer, StratumError, TlsConfigCache, VardiffOptions, VardiffState,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use thiserror::Error;

use crate::config::{CoinConfig, PoolConfig};
use crate::daemon::DaemonWorkProvider;

/// Extra-nonce2 width reported to workers on subscribe.
const EXTRANONCE2_SIZE: usize = 4;
const VARDIFF_TICK: Duration = Duration::from_secs(10);
const TELEMETRY_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error(transparent)]
    Manager(#[from] JobManagerError),
    #[error("pool already started")]
    AlreadyStarted,
}

struct VardiffEntry {
    state: VardiffState,
    options: VardiffOptions,
}

/// One currency's worth of pool: job manager + stratum server + validator +
/// vardiff, wired over the shared message bus.
pub struct Pool {
    config: PoolConfig,
    cluster_name: String,
    clock: Arc<dyn Clock>,
    bus: MessageBus,
    manager: Arc<JobManager>,
    server: Arc<StratumServer>,
    validator: Arc<dyn ShareValidator>,
    ban_manager: Arc<BanManager>,
    extra_nonces: ExtraNonceCounter,
    vardiff: Mutex<HashMap<String, VardiffEntry>>,
    valid_shares: AtomicU64,
    invalid_shares: AtomicU64,
    blocks_found: AtomicU64,
    running: Mutex<Option<ShutdownTrigger>>,
}

impl Pool {
    /// Wire a pool from configuration: daemon client, family validator and
    /// epoch context, job manager and stratum server.
    pub fn from_config(
        config: PoolConfig,
        cluster_name: String,
        bus: MessageBus,
        clock: Arc<dyn Clock>,
        ban_manager: Arc<BanManager>,
        tls_cache: Arc<TlsConfigCache>,
    ) -> Result<Arc<Self>, PoolError> {
        let client = Arc::new(DaemonClient::new(config.daemons.clone(), DaemonClientOptions::default())?);
        let provider: Arc<dyn WorkProvider> = Arc::new(DaemonWorkProvider::new(client, &config.coin));

        let (validator, contexts): (Arc<dyn ShareValidator>, Option<Arc<ContextCache>>) = match &config.coin {
            CoinConfig::MemoryHard { .. } => {
                let contexts = ContextCache::blake2_reference();
                (Arc::new(HeaderShareValidator::new(Arc::clone(&contexts))), Some(contexts))
            }
            CoinConfig::Sha2Chain { .. } => (Arc::new(ChainShareValidator::new(Arc::new(Blake2Chain))), None),
        };

        Ok(Self::assemble(config, cluster_name, bus, clock, ban_manager, tls_cache, provider, validator, contexts))
    }

    /// Assembly seam shared by `from_config` and tests that script the
    /// daemon or the proof-of-work primitive.
    #[allow(clippy::too_many_arguments)]
    pub fn assemble(
        config: PoolConfig,
        cluster_name: String,
        bus: MessageBus,
        clock: Arc<dyn Clock>,
        ban_manager: Arc<BanManager>,
        tls_cache: Arc<TlsConfigCache>,
        provider: Arc<dyn WorkProvider>,
        validator: Arc<dyn ShareValidator>,
        contexts: Option<Arc<ContextCache>>,
    ) -> Arc<Self> {
        let manager = JobManager::new(
            config.id.clone(),
            provider,
            Arc::clone(&clock),
            bus.clone(),
            contexts,
            JobManagerOptions { refresh_interval: config.block_refresh_interval(), ..Default::default() },
        );
        let server = StratumServer::new(
            config.id.clone(),
            Arc::clone(&clock),
            Arc::clone(&ban_manager),
            tls_cache,
            SessionOptions::default(),
        );
        let extra_nonces = ExtraNonceCounter::new(config.extranonce_size);

        Arc::new(Self {
            config,
            cluster_name,
            clock,
            bus,
            manager,
            server,
            validator,
            ban_manager,
            extra_nonces,
            vardiff: Mutex::new(HashMap::new()),
            valid_shares: AtomicU64::new(0),
            invalid_shares: AtomicU64::new(0),
            blocks_found: AtomicU64::new(0),
            running: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn job_manager(&self) -> &Arc<JobManager> {
        &self.manager
    }

    pub fn stratum_server(&self) -> &Arc<StratumServer> {
        &self.server
    }

    /// Run startup preconditions and bring the pool online. A fatal daemon
    /// failure stops this pool only; the caller keeps serving its siblings.
    pub async fn start(self: &Arc<Self>) -> Result<(), PoolError> {
        if self.running.lock().is_some() {
            return Err(PoolError::AlreadyStarted);
        }

        if let Err(e) = self.manager.start().await {
            self.bus.admin.publish(AdminNotification::PoolStartupFailed {
                pool_id: self.config.id.clone(),
                reason: e.to_string(),
            });
            return Err(e.into());
        }

        let trigger = ShutdownTrigger::new();
        self.spawn_job_fanout(trigger.listener());
        self.spawn_vardiff_loop(trigger.listener());
        self.spawn_telemetry_loop(trigger.listener());

        // Push-capable daemons feed the same installation path as polling.
        for endpoint in &self.config.daemons {
            if let Some(ws_url) = endpoint.ws_url.clone() {
                let manager = Arc::clone(&self.manager);
                spawn_push_subscription(ws_url, trigger.listener(), move |payload| {
                    match crate::daemon::parse_template(&payload) {
                        Ok(template) => {
                            manager.offer_template(template);
                        }
                        Err(e) => tracing::warn!("ignoring unusable pushed template: {}", e),
                    }
                });
            }
        }

        *self.running.lock() = Some(trigger);

        if self.config.enable_internal_stratum {
            let listeners: Vec<ListenerDescriptor> =
                self.config.stratums.iter().map(|s| s.listener_descriptor()).collect();
            let handler: Arc<dyn RequestHandler> = Arc::clone(self) as Arc<dyn RequestHandler>;
            if let Err(e) = self.server.start(handler, &listeners).await {
                self.stop();
                return Err(e.into());
            }
        }

        tracing::info!("pool {} started", self.config.id);
        Ok(())
    }

    /// Graceful shutdown: listeners close, sessions drain, polling and push
    /// subscriptions cancel. The pool can be started again afterwards.
    pub fn stop(&self) {
        self.server.stop();
        self.manager.stop();
        if let Some(trigger) = self.running.lock().take() {
            trigger.trigger();
        }
        tracing::info!("pool {} stopped", self.config.id);
    }

    pub fn stats(&self) -> PoolTelemetry {
        PoolTelemetry {
            pool_id: self.config.id.clone(),
            connected_sessions: self.server.session_count(),
            valid_shares: self.valid_shares.load(Ordering::Relaxed),
            invalid_shares: self.invalid_shares.load(Ordering::Relaxed),
            blocks_found: self.blocks_found.load(Ordering::Relaxed),
            network_difficulty: self
                .manager
                .job_store()
                .current()
                .map(|job| job.template.network_difficulty)
                .unwrap_or(0.0),
        }
    }

    fn spawn_job_fanout(self: &Arc<Self>, mut shutdown: orepool_core::ShutdownListener) {
        let pool = Arc::clone(self);
        let mut events = self.manager.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    event = events.recv() => match event {
                        Ok(event) => pool.broadcast_job(&event),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!("pool {}: job fanout lagged by {}", pool.config.id, missed);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    fn spawn_vardiff_loop(self: &Arc<Self>, mut shutdown: orepool_core::ShutdownListener) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(VARDIFF_TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = tick.tick() => pool.retarget_workers(),
                }
            }
        });
    }

    fn spawn_telemetry_loop(self: &Arc<Self>, mut shutdown: orepool_core::ShutdownListener) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(TELEMETRY_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = tick.tick() => {
                        pool.bus.telemetry.publish(pool.stats());
                    }
                }
            }
        });
    }

    /// Propose new difficulties. Changes are attached to the session as
    /// pending and only take effect on the next job notification.
    fn retarget_workers(&self) {
        let now = self.clock.now_unix_millis();
        let sessions: HashMap<String, Arc<Session>> =
            self.server.sessions_snapshot().into_iter().map(|s| (s.id().to_string(), s)).collect();

        let mut vardiff = self.vardiff.lock();
        for (session_id, entry) in vardiff.iter_mut() {
            let Some(session) = sessions.get(session_id) else { continue };
            if let Some(next) = entry.state.retarget(now, &entry.options) {
                tracing::debug!("pool {}: session {} difficulty {} pending", self.config.id, session_id, next);
                session.with_worker(|w| w.pending_difficulty = Some(next));
            }
        }
    }

    fn job_notification(job: &Job, clean_jobs: bool) -> StratumRequest {
        StratumRequest::notification(
            "mining.notify",
            json!([
                job.id,
                job.template.prev_hash,
                hex::encode(&job.template.header),
                job.template.seed_hash,
                job.template.height,
                clean_jobs,
            ]),
        )
    }

    fn set_difficulty_notification(difficulty: f64) -> StratumRequest {
        StratumRequest::notification("mining.set_difficulty", json!([difficulty]))
    }

    fn broadcast_job(&self, event: &JobEvent) {
        let now = self.clock.now_unix_millis();
        self.server.broadcast_with(|session| {
            let worker = session.worker_snapshot();
            if !worker.subscribed {
                return None;
            }
            let mut out = Vec::with_capacity(2);
            if let Some(pending) = worker.pending_difficulty {
                session.with_worker(|w| {
                    w.difficulty = pending;
                    w.pending_difficulty = None;
                });
                if let Some(entry) = self.vardiff.lock().get_mut(session.id()) {
                    entry.state.difficulty_applied(now);
                }
                out.push(Self::set_difficulty_notification(pending));
            }
            out.push(Self::job_notification(&event.job, event.clean_jobs));
            Some(out)
        });
    }

    fn handle_subscribe(&self, session: &Arc<Session>, id: Option<Value>) {
        let extra_nonce1 = self.extra_nonces.next();
        let difficulty = session.with_worker(|w| {
            w.subscribed = true;
            w.extra_nonce1 = extra_nonce1.clone();
            w.difficulty
        });

        session.send_response(&StratumResponse::ok(id, json!([Value::Null, extra_nonce1, EXTRANONCE2_SIZE])));
        session.send_notification(&Self::set_difficulty_notification(difficulty));
        if let Some(job) = self.manager.job_store().current() {
            session.send_notification(&Self::job_notification(&job, true));
        }
    }

    fn handle_authorize(&self, session: &Arc<Session>, id: Option<Value>, params: &Value) -> StratumResponse {
        let Some(worker_name) = params.get(0).and_then(Value::as_str).filter(|w| !w.is_empty()) else {
            return StratumResponse::stratum_error(id, &StratumError::UnauthorizedWorker);
        };
        session.with_worker(|w| {
            w.worker_name = Some(worker_name.to_string());
            w.authorized = true;
        });
        tracing::debug!("pool {}: session {} authorized as {}", self.config.id, session.id(), worker_name);
        StratumResponse::ok(id, json!(true))
    }

    async fn handle_submit(&self, session: &Arc<Session>, id: Option<Value>, params: &Value) -> StratumResponse {
        let worker = session.worker_snapshot();
        if !worker.subscribed {
            return StratumResponse::stratum_error(id, &StratumError::NotSubscribed);
        }
        if !worker.authorized {
            return StratumResponse::stratum_error(id, &StratumError::UnauthorizedWorker);
        }

        let fallback_name = session.remote().to_string();
        let worker_name = worker.worker_name.as_deref().unwrap_or(&fallback_name);
        let ctx = SubmitContext {
            pool_id: &self.config.id,
            source: &self.cluster_name,
            worker_name,
            extra_nonce1: &worker.extra_nonce1,
            difficulty: worker.difficulty,
            now_ms: self.clock.now_unix_millis(),
        };

        let job_store = self.manager.job_store();
        match self.validator.validate_submit(&ctx, params, &job_store) {
            Ok(mut share) => {
                self.valid_shares.fetch_add(1, Ordering::Relaxed);
                if let Some(entry) = self.vardiff.lock().get_mut(session.id()) {
                    entry.state.record_share(ctx.now_ms);
                }
                if share.is_block_candidate && self.manager.submit_candidate(&mut share).await {
                    self.blocks_found.fetch_add(1, Ordering::Relaxed);
                }
                self.bus.shares.publish(share);
                StratumResponse::ok(id, json!(true))
            }
            Err(err) => {
                self.invalid_shares.fetch_add(1, Ordering::Relaxed);
                if self.ban_manager.report_invalid_share(session.remote().ip()) {
                    tracing::info!("pool {}: session {} banned for invalid shares", self.config.id, session.id());
                    session.close();
                }
                StratumResponse::stratum_error(id, &err)
            }
        }
    }
}

#[async_trait]
impl RequestHandler for Pool {
    async fn handle_request(&self, session: &Arc<Session>, request: StratumRequest) -> Option<StratumResponse> {
        let id = request.id.clone();
        match request.method.as_str() {
            "mining.subscribe" => {
                // Ack first, then difficulty and the current job, in order,
                // through the same queue.
                self.handle_subscribe(session, id);
                None
            }
            "mining.authorize" => Some(self.handle_authorize(session, id, &request.params)),
            "mining.extranonce.subscribe" => Some(StratumResponse::ok(id, json!(true))),
            "mining.submit" => Some(self.handle_submit(session, id, &request.params).await),
            other => {
                if id.is_none() {
                    tracing::debug!("pool {}: ignoring unknown notification {}", self.config.id, other);
                    None
                } else {
                    Some(StratumResponse::error(id, -32601, "method not found"))
                }
            }
        }
    }

    async fn on_connect(&self, session: &Arc<Session>, listener: &ListenerDescriptor) {
        session.with_worker(|w| w.difficulty = listener.base_difficulty);
        if let Some(options) = &listener.vardiff {
            self.vardiff.lock().insert(
                session.id().to_string(),
                VardiffEntry {
                    state: VardiffState::new(listener.base_difficulty, self.clock.now_unix_millis()),
                    options: options.clone(),
                },
            );
        }
        tracing::debug!("pool {}: session {} connected from {}", self.config.id, session.id(), session.remote());
    }

    async fn on_disconnect(&self, session: &Arc<Session>) {
        self.vardiff.lock().remove(session.id());
        tracing::debug!("pool {}: session {} disconnected", self.config.id, session.id());
    }
}
