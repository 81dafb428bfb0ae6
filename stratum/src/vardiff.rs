use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// How many recent share timestamps each worker's ring retains.
const SAMPLE_RING_SIZE: usize = 10;
/// Samples required before an early (pre-interval) retarget is considered.
const MIN_SAMPLES: usize = 4;
/// Largest single-step change factor, both directions. Dampens oscillation
/// when a miner's hashrate estimate is briefly wrong.
const MAX_STEP: f64 = 2.0;

/// Per-listener vardiff tuning, straight from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VardiffOptions {
    pub min_diff: f64,
    pub max_diff: Option<f64>,
    /// Desired seconds between shares from one worker.
    pub target_time_secs: f64,
    /// Seconds between retarget evaluations.
    pub retarget_time_secs: f64,
    /// Tolerated deviation from the target interval, in percent, before a
    /// retarget actually fires.
    pub variance_percent: f64,
}

impl Default for VardiffOptions {
    fn default() -> Self {
        Self { min_diff: 0.01, max_diff: None, target_time_secs: 15.0, retarget_time_secs: 90.0, variance_percent: 30.0 }
    }
}

/// Adaptive difficulty state for one worker: a bounded ring of recent share
/// timestamps plus the current difficulty. The controller only proposes a new
/// difficulty; applying it is deferred to the next job notification by the
/// session that owns this state.
#[derive(Debug, Clone)]
pub struct VardiffState {
    timestamps_ms: VecDeque<u64>,
    last_retarget_ms: u64,
    current_diff: f64,
}

impl VardiffState {
    pub fn new(start_diff: f64, now_ms: u64) -> Self {
        Self { timestamps_ms: VecDeque::with_capacity(SAMPLE_RING_SIZE), last_retarget_ms: now_ms, current_diff: start_diff }
    }

    pub fn current_difficulty(&self) -> f64 {
        self.current_diff
    }

    /// Record an accepted share's timestamp.
    pub fn record_share(&mut self, now_ms: u64) {
        if self.timestamps_ms.len() == SAMPLE_RING_SIZE {
            self.timestamps_ms.pop_front();
        }
        self.timestamps_ms.push_back(now_ms);
    }

    /// Evaluate a retarget. Returns the new difficulty when a change should
    /// be scheduled, `None` when the observed rate is inside the band, too
    /// few samples have accumulated, or the retarget interval has not
    /// elapsed yet.
    pub fn retarget(&mut self, now_ms: u64, opts: &VardiffOptions) -> Option<f64> {
        let elapsed_secs = (now_ms.saturating_sub(self.last_retarget_ms)) as f64 / 1000.0;
        if elapsed_secs < opts.retarget_time_secs && self.timestamps_ms.len() < MIN_SAMPLES {
            return None;
        }

        // A silent worker past the retarget interval gets its difficulty
        // halved so it can resume submitting.
        if self.timestamps_ms.len() < 2 {
            if elapsed_secs < opts.retarget_time_secs {
                return None;
            }
            self.last_retarget_ms = now_ms;
            let next = clamp_diff(self.current_diff / MAX_STEP, opts);
            return self.commit(next);
        }

        let (Some(&first), Some(&last)) = (self.timestamps_ms.front(), self.timestamps_ms.back()) else {
            return None;
        };
        let (first, last) = (first as f64, last as f64);
        let observed_secs = (last - first) / 1000.0 / (self.timestamps_ms.len() - 1) as f64;
        if observed_secs <= 0.0 {
            return None;
        }

        let band = opts.target_time_secs * opts.variance_percent / 100.0;
        if (observed_secs - opts.target_time_secs).abs() <= band {
            self.last_retarget_ms = now_ms;
            self.timestamps_ms.clear();
            return None;
        }

        // Interval scales with difficulty, so scale difficulty by
        // target/observed, stepped to avoid oscillation.
        let ratio = (opts.target_time_secs / observed_secs).clamp(1.0 / MAX_STEP, MAX_STEP);
        let next = clamp_diff(self.current_diff * ratio, opts);

        self.last_retarget_ms = now_ms;
        self.timestamps_ms.clear();
        self.commit(next)
    }

    fn commit(&mut self, next: f64) -> Option<f64> {
        if (next - self.current_diff).abs() / self.current_diff < 0.05 {
            return None;
        }
        self.current_diff = next;
        Some(next)
    }

    /// Called when the pending difficulty has been pushed to the worker.
    pub fn difficulty_applied(&mut self, now_ms: u64) {
        self.last_retarget_ms = now_ms;
        self.timestamps_ms.clear();
    }
}

fn clamp_diff(diff: f64, opts: &VardiffOptions) -> f64 {
    let upper = opts.max_diff.unwrap_or(f64::MAX);
    diff.clamp(opts.min_diff, upper)
}
