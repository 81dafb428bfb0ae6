use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use num_bigint::BigUint;
use parking_lot::Mutex;

use crate::target;

/// Jobs older than this many block heights behind the tip are evicted;
/// submissions against them fail as stale.
pub const MAX_BLOCK_BACKLOG: u64 = 3;

/// Everything a job needs from the daemon's template response. Family code
/// interprets `header` and `coinbase`; the store only cares about identity
/// and height.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockTemplate {
    pub height: u64,
    pub prev_hash: String,
    /// Serialized header-in-progress (pre-nonce), family-specific layout.
    pub header: Vec<u8>,
    pub network_difficulty: f64,
    /// Epoch seed for memory-hard families; `None` elsewhere.
    pub seed_hash: Option<String>,
    /// Coinbase construction inputs for families that build it locally.
    pub coinbase: Option<Vec<u8>>,
}

/// A unit of distributable work plus the bookkeeping to reject replays.
#[derive(Debug)]
pub struct Job {
    pub id: String,
    pub template: BlockTemplate,
    pub network_target: BigUint,
    seen: Mutex<HashSet<String>>,
}

impl Job {
    pub fn new(id: String, template: BlockTemplate) -> Self {
        let network_target = target::difficulty_to_target(template.network_difficulty);
        Self { id, template, network_target, seen: Mutex::new(HashSet::new()) }
    }

    fn submission_key(extra_nonce1: &str, nonce: &str, extra_nonce2: Option<&str>) -> String {
        match extra_nonce2 {
            Some(en2) => format!("{}:{}:{}", extra_nonce1.to_lowercase(), nonce.to_lowercase(), en2.to_lowercase()),
            None => format!("{}:{}", extra_nonce1.to_lowercase(), nonce.to_lowercase()),
        }
    }

    pub fn is_duplicate(&self, extra_nonce1: &str, nonce: &str, extra_nonce2: Option<&str>) -> bool {
        self.seen.lock().contains(&Self::submission_key(extra_nonce1, nonce, extra_nonce2))
    }

    /// Record a fully validated submission tuple.
    pub fn record_submission(&self, extra_nonce1: &str, nonce: &str, extra_nonce2: Option<&str>) {
        self.seen.lock().insert(Self::submission_key(extra_nonce1, nonce, extra_nonce2));
    }
}

#[derive(Default)]
struct JobStoreInner {
    jobs: HashMap<String, Arc<Job>>,
    current: Option<Arc<Job>>,
}

/// The set of valid jobs for one pool. Single writer (the job manager),
/// many readers (validators); readers get `Arc` snapshots.
#[derive(Default)]
pub struct JobStore {
    inner: Mutex<JobStoreInner>,
    id_counter: AtomicU64,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Monotonic short hex token.
    pub fn next_job_id(&self) -> String {
        format!("{:x}", self.id_counter.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Install a new current job and evict everything more than
    /// `MAX_BLOCK_BACKLOG` heights behind it.
    pub fn install(&self, job: Job) -> Arc<Job> {
        let job = Arc::new(job);
        let mut inner = self.inner.lock();
        let floor = job.template.height.saturating_sub(MAX_BLOCK_BACKLOG);
        inner.jobs.retain(|_, j| j.template.height >= floor);
        inner.jobs.insert(job.id.clone(), Arc::clone(&job));
        inner.current = Some(Arc::clone(&job));
        job
    }

    pub fn get(&self, id: &str) -> Option<Arc<Job>> {
        self.inner.lock().jobs.get(id).cloned()
    }

    pub fn current(&self) -> Option<Arc<Job>> {
        self.inner.lock().current.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn retained_heights(&self) -> Vec<u64> {
        let mut heights: Vec<u64> = self.inner.lock().jobs.values().map(|j| j.template.height).collect();
        heights.sort_unstable();
        heights
    }
}
