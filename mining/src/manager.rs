use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use orepool_core::{AdminNotification, Bus, Clock, MessageBus, Share, ShutdownTrigger};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::family::ContextCache;
use crate::job::{BlockTemplate, Job, JobStore};

/// Aggregate sync view across a pool's daemons.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncState {
    Synced,
    Syncing { progress_percent: Option<f64> },
    /// Families whose daemons do not report sync progress.
    NotApplicable,
}

#[derive(Debug, Clone, Error)]
pub enum WorkProviderError {
    #[error("daemon rejected credentials")]
    Unauthorized,
    #[error("transient daemon failure: {0}")]
    Transient(String),
    #[error("daemon protocol error: {0}")]
    Protocol(String),
}

/// Narrow daemon capability the job manager works against. The production
/// implementation sits on the JSON-RPC client; tests script it.
#[async_trait]
pub trait WorkProvider: Send + Sync {
    /// Verify every endpoint answers a well-formed template request.
    async fn check_healthy(&self) -> Result<(), WorkProviderError>;

    async fn peer_count(&self) -> Result<u32, WorkProviderError>;

    async fn sync_state(&self) -> Result<SyncState, WorkProviderError>;

    async fn get_block_template(&self) -> Result<BlockTemplate, WorkProviderError>;

    /// Submit a solved block; `Ok(true)` means the daemon accepted it.
    async fn submit_block(&self, share: &Share) -> Result<bool, WorkProviderError>;
}

#[derive(Debug, Error)]
pub enum JobManagerError {
    #[error("daemon rejected credentials")]
    Unauthorized,
    #[error("daemon protocol error: {0}")]
    Protocol(String),
    #[error("job manager already started")]
    AlreadyStarted,
    #[error("startup aborted by shutdown")]
    Aborted,
}

#[derive(Debug, Clone)]
pub struct JobManagerOptions {
    pub refresh_interval: Duration,
    /// Cadence of the startup peer/sync wait loop.
    pub startup_poll_interval: Duration,
    /// Consecutive poll failures before "daemons unreachable" goes out.
    pub failure_threshold: u32,
}

impl Default for JobManagerOptions {
    fn default() -> Self {
        Self { refresh_interval: Duration::from_millis(500), startup_poll_interval: Duration::from_secs(5), failure_threshold: 5 }
    }
}

/// Fanned out to the stratum side whenever a job is installed.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job: Arc<Job>,
    /// True when the block height advanced: workers must abandon older work.
    pub clean_jobs: bool,
}

/// Owns the job set for one pool. Template updates arrive from the poll task
/// and, when the daemon supports push, from the websocket subscription; both
/// funnel through `offer_template`.
pub struct JobManager {
    pool_id: String,
    provider: Arc<dyn WorkProvider>,
    jobs: Arc<JobStore>,
    clock: Arc<dyn Clock>,
    bus: MessageBus,
    job_events: Bus<JobEvent>,
    contexts: Option<Arc<ContextCache>>,
    options: JobManagerOptions,
    running: Mutex<Option<ShutdownTrigger>>,
}

impl JobManager {
    pub fn new(
        pool_id: String,
        provider: Arc<dyn WorkProvider>,
        clock: Arc<dyn Clock>,
        bus: MessageBus,
        contexts: Option<Arc<ContextCache>>,
        options: JobManagerOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool_id,
            provider,
            jobs: Arc::new(JobStore::new()),
            clock,
            bus,
            job_events: Bus::default(),
            contexts,
            options,
            running: Mutex::new(None),
        })
    }

    pub fn job_store(&self) -> Arc<JobStore> {
        Arc::clone(&self.jobs)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.job_events.subscribe()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Run the startup preconditions, install the first job and begin
    /// polling. Credential and schema failures are fatal for this pool;
    /// missing peers and an unsynced chain are waited out.
    pub async fn start(self: &Arc<Self>) -> Result<(), JobManagerError> {
        if self.running.lock().is_some() {
            return Err(JobManagerError::AlreadyStarted);
        }
        let trigger = ShutdownTrigger::new();
        let mut shutdown = trigger.listener();
        *self.running.lock() = Some(trigger.clone());

        if let Err(e) = self.startup_sequence(&mut shutdown).await {
            *self.running.lock() = None;
            return Err(e);
        }

        let manager = Arc::clone(self);
        let mut poll_shutdown = trigger.listener();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.options.refresh_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut consecutive_failures = 0u32;
            loop {
                tokio::select! {
                    _ = poll_shutdown.wait() => break,
                    _ = interval.tick() => {
                        match manager.provider.get_block_template().await {
                            Ok(template) => {
                                if consecutive_failures >= manager.options.failure_threshold {
                                    tracing::info!("pool {}: daemons reachable again", manager.pool_id);
                                }
                                consecutive_failures = 0;
                                manager.offer_template(template);
                            }
                            Err(e) => {
                                consecutive_failures += 1;
                                tracing::warn!("pool {}: template poll failed ({}): {}", manager.pool_id, consecutive_failures, e);
                                if consecutive_failures == manager.options.failure_threshold {
                                    // Outstanding jobs keep serving; operators get told once.
                                    manager.bus.admin.publish(AdminNotification::DaemonsUnreachable {
                                        pool_id: manager.pool_id.clone(),
                                    });
                                }
                            }
                        }
                    }
                }
            }
        });

        tracing::info!("pool {}: job manager started", self.pool_id);
        Ok(())
    }

    /// Cancel the poll task. Push subscriptions share the same trigger via
    /// `shutdown_listener`.
    pub fn stop(&self) {
        if let Some(trigger) = self.running.lock().take() {
            trigger.trigger();
            tracing::info!("pool {}: job manager stopped", self.pool_id);
        }
    }

    pub fn shutdown_listener(&self) -> Option<orepool_core::ShutdownListener> {
        self.running.lock().as_ref().map(|t| t.listener())
    }

    /// Template entry point shared by poll and push modes. Installs a new
    /// job when the template actually changed and the height never goes
    /// backwards; publishes the corresponding job event.
    pub fn offer_template(&self, template: BlockTemplate) -> Option<JobEvent> {
        let current = self.jobs.current();
        let clean_jobs = match &current {
            Some(job) => {
                if template.height < job.template.height {
                    tracing::debug!(
                        "pool {}: dropping template at height {} behind current {}",
                        self.pool_id,
                        template.height,
                        job.template.height
                    );
                    return None;
                }
                if job.template == template {
                    return None;
                }
                template.height > job.template.height
            }
            None => true,
        };

        // Memory-hard families: the epoch context must exist before the
        // first job of that epoch reaches any worker.
        if let (Some(contexts), Some(seed)) = (&self.contexts, template.seed_hash.as_deref()) {
            if let Err(e) = contexts.ensure(seed) {
                tracing::error!("pool {}: context build for seed {} failed: {}", self.pool_id, seed, e);
                return None;
            }
        }

        let id = self.jobs.next_job_id();
        let height = template.height;
        let job = self.jobs.install(Job::new(id.clone(), template));
        tracing::debug!("pool {}: installed job {} at height {} (clean={})", self.pool_id, id, height, clean_jobs);
        let event = JobEvent { job, clean_jobs };
        self.job_events.publish(event.clone());
        Some(event)
    }

    /// Ship a block-candidate share to the daemon. Rejection keeps the share
    /// valid but clears the candidate flag; no retry, another solution may
    /// arrive any moment.
    pub async fn submit_candidate(&self, share: &mut Share) -> bool {
        match self.provider.submit_block(share).await {
            Ok(true) => {
                tracing::info!("pool {}: block accepted at height {}", self.pool_id, share.block_height);
                self.bus.admin.publish(AdminNotification::BlockAccepted {
                    pool_id: self.pool_id.clone(),
                    block_height: share.block_height,
                    transaction_hash: share.transaction_hash.clone().unwrap_or_default(),
                });
                true
            }
            Ok(false) => {
                tracing::warn!("pool {}: block rejected at height {}", self.pool_id, share.block_height);
                share.is_block_candidate = false;
                self.bus.admin.publish(AdminNotification::BlockSubmissionFailed {
                    pool_id: self.pool_id.clone(),
                    block_height: share.block_height,
                    reason: "daemon rejected submission".into(),
                });
                false
            }
            Err(e) => {
                tracing::warn!("pool {}: block submission failed at height {}: {}", self.pool_id, share.block_height, e);
                share.is_block_candidate = false;
                self.bus.admin.publish(AdminNotification::BlockSubmissionFailed {
                    pool_id: self.pool_id.clone(),
                    block_height: share.block_height,
                    reason: e.to_string(),
                });
                false
            }
        }
    }

    async fn startup_sequence(&self, shutdown: &mut orepool_core::ShutdownListener) -> Result<(), JobManagerError> {
        self.wait_until_healthy(shutdown).await?;
        self.wait_for_peers(shutdown).await?;
        self.wait_for_sync(shutdown).await?;

        match self.provider.get_block_template().await {
            Ok(template) => {
                self.offer_template(template);
            }
            Err(WorkProviderError::Unauthorized) => return Err(JobManagerError::Unauthorized),
            Err(e) => {
                tracing::warn!("pool {}: initial template fetch failed: {}", self.pool_id, e);
            }
        }
        Ok(())
    }

    async fn wait_until_healthy(&self, shutdown: &mut orepool_core::ShutdownListener) -> Result<(), JobManagerError> {
        loop {
            match self.provider.check_healthy().await {
                Ok(()) => return Ok(()),
                Err(WorkProviderError::Unauthorized) => return Err(JobManagerError::Unauthorized),
                Err(WorkProviderError::Protocol(e)) => return Err(JobManagerError::Protocol(e)),
                Err(WorkProviderError::Transient(e)) => {
                    tracing::warn!("pool {}: daemons not healthy yet: {}", self.pool_id, e);
                }
            }
            self.startup_pause(shutdown).await?;
        }
    }

    async fn wait_for_peers(&self, shutdown: &mut orepool_core::ShutdownListener) -> Result<(), JobManagerError> {
        loop {
            match self.provider.peer_count().await {
                Ok(peers) if peers > 0 => return Ok(()),
                Ok(_) => tracing::info!("pool {}: waiting for daemon peers", self.pool_id),
                Err(e) => tracing::warn!("pool {}: peer count failed: {}", self.pool_id, e),
            }
            self.startup_pause(shutdown).await?;
        }
    }

    async fn wait_for_sync(&self, shutdown: &mut orepool_core::ShutdownListener) -> Result<(), JobManagerError> {
        loop {
            match self.provider.sync_state().await {
                Ok(SyncState::Synced) | Ok(SyncState::NotApplicable) => return Ok(()),
                Ok(SyncState::Syncing { progress_percent }) => match progress_percent {
                    Some(progress) => tracing::info!("pool {}: daemon syncing, {:.1}% done", self.pool_id, progress),
                    None => tracing::info!("pool {}: daemon syncing", self.pool_id),
                },
                Err(e) => tracing::warn!("pool {}: sync state failed: {}", self.pool_id, e),
            }
            self.startup_pause(shutdown).await?;
        }
    }

    async fn startup_pause(&self, shutdown: &mut orepool_core::ShutdownListener) -> Result<(), JobManagerError> {
        tokio::select! {
            _ = shutdown.wait() => Err(JobManagerError::Aborted),
            _ = tokio::time::sleep(self.options.startup_poll_interval) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orepool_core::SystemClock;
    use parking_lot::Mutex as PlMutex;
    use std::collections::VecDeque;

    fn template_at(height: u64) -> BlockTemplate {
        BlockTemplate {
            height,
            prev_hash: format!("{:064x}", height),
            header: vec![7u8; 16],
            network_difficulty: 1000.0,
            seed_hash: None,
            coinbase: None,
        }
    }

    #[derive(Default)]
    struct ScriptedProvider {
        templates: PlMutex<VecDeque<Result<BlockTemplate, WorkProviderError>>>,
        submit_results: PlMutex<VecDeque<Result<bool, WorkProviderError>>>,
        healthy: PlMutex<Option<WorkProviderError>>,
    }

    #[async_trait]
    impl WorkProvider for ScriptedProvider {
        async fn check_healthy(&self) -> Result<(), WorkProviderError> {
            match self.healthy.lock().clone() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        async fn peer_count(&self) -> Result<u32, WorkProviderError> {
            Ok(4)
        }

        async fn sync_state(&self) -> Result<SyncState, WorkProviderError> {
            Ok(SyncState::Synced)
        }

        async fn get_block_template(&self) -> Result<BlockTemplate, WorkProviderError> {
            self.templates.lock().pop_front().unwrap_or_else(|| Err(WorkProviderError::Transient("no template".into())))
        }

        async fn submit_block(&self, _share: &Share) -> Result<bool, WorkProviderError> {
            self.submit_results.lock().pop_front().unwrap_or(Ok(true))
        }
    }

    fn manager_with(provider: Arc<ScriptedProvider>) -> (Arc<JobManager>, MessageBus) {
        let bus = MessageBus::new();
        let manager = JobManager::new(
            "pool1".into(),
            provider,
            Arc::new(SystemClock),
            bus.clone(),
            None,
            JobManagerOptions::default(),
        );
        (manager, bus)
    }

    fn candidate_share() -> Share {
        Share {
            pool_id: "pool1".into(),
            worker: "w".into(),
            miner_address: None,
            claimed_difficulty: 10.0,
            actual_difficulty: 200.0,
            network_difficulty: 100.0,
            block_height: 42,
            is_block_candidate: true,
            source: "local".into(),
            created_ms: 0,
            nonce: Some("0x9".into()),
            mix_hash: None,
            transaction_hash: Some("aa".repeat(32)),
        }
    }

    #[test]
    fn offer_template_rejects_height_regression() {
        let (manager, _bus) = manager_with(Arc::new(ScriptedProvider::default()));
        assert!(manager.offer_template(template_at(100)).is_some());
        assert!(manager.offer_template(template_at(99)).is_none());
        assert_eq!(manager.job_store().current().unwrap().template.height, 100);
    }

    #[test]
    fn offer_template_marks_clean_jobs_only_on_height_advance() {
        let (manager, _bus) = manager_with(Arc::new(ScriptedProvider::default()));
        let first = manager.offer_template(template_at(100)).unwrap();
        assert!(first.clean_jobs);

        // Same height, fresh transactions: new job, but workers keep going.
        let mut refresh = template_at(100);
        refresh.header = vec![8u8; 16];
        let second = manager.offer_template(refresh).unwrap();
        assert!(!second.clean_jobs);

        let third = manager.offer_template(template_at(101)).unwrap();
        assert!(third.clean_jobs);
    }

    #[test]
    fn identical_template_installs_nothing() {
        let (manager, _bus) = manager_with(Arc::new(ScriptedProvider::default()));
        assert!(manager.offer_template(template_at(100)).is_some());
        assert!(manager.offer_template(template_at(100)).is_none());
        assert_eq!(manager.job_store().len(), 1);
    }

    #[tokio::test]
    async fn accepted_block_keeps_candidate_flag_and_notifies() {
        let provider = Arc::new(ScriptedProvider::default());
        provider.submit_results.lock().push_back(Ok(true));
        let (manager, bus) = manager_with(provider);
        let mut admin = bus.admin.subscribe();

        let mut share = candidate_share();
        assert!(manager.submit_candidate(&mut share).await);
        assert!(share.is_block_candidate);
        match admin.recv().await.unwrap() {
            AdminNotification::BlockAccepted { pool_id, block_height, .. } => {
                assert_eq!(pool_id, "pool1");
                assert_eq!(block_height, 42);
            }
            other => panic!("unexpected notification {:?}", other),
        }
    }

    #[tokio::test]
    async fn rejected_block_clears_flag_and_notifies() {
        let provider = Arc::new(ScriptedProvider::default());
        provider.submit_results.lock().push_back(Ok(false));
        let (manager, bus) = manager_with(provider);
        let mut admin = bus.admin.subscribe();

        let mut share = candidate_share();
        assert!(!manager.submit_candidate(&mut share).await);
        assert!(!share.is_block_candidate);
        assert!(matches!(admin.recv().await.unwrap(), AdminNotification::BlockSubmissionFailed { .. }));
    }

    #[tokio::test]
    async fn unauthorized_daemon_is_fatal_at_startup() {
        let provider = Arc::new(ScriptedProvider::default());
        *provider.healthy.lock() = Some(WorkProviderError::Unauthorized);
        let (manager, _bus) = manager_with(provider);
        assert!(matches!(manager.start().await, Err(JobManagerError::Unauthorized)));
    }

    #[tokio::test]
    async fn poll_loop_installs_templates_and_stops() {
        let provider = Arc::new(ScriptedProvider::default());
        provider.templates.lock().push_back(Ok(template_at(100)));
        provider.templates.lock().push_back(Ok(template_at(101)));
        provider.templates.lock().push_back(Ok(template_at(101)));

        let bus = MessageBus::new();
        let manager = JobManager::new(
            "pool1".into(),
            provider,
            Arc::new(SystemClock),
            bus.clone(),
            None,
            JobManagerOptions { refresh_interval: Duration::from_millis(10), ..Default::default() },
        );
        let mut events = manager.subscribe();

        manager.start().await.unwrap();
        let first = events.recv().await.unwrap();
        assert_eq!(first.job.template.height, 100);
        let second = events.recv().await.unwrap();
        assert_eq!(second.job.template.height, 101);
        assert!(second.clean_jobs);

        manager.stop();
        assert!(manager.shutdown_listener().is_none());
    }
}
