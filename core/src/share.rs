use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

/// A validated proof-of-work submission. Emitted on the message bus once the
/// validator has accepted it; downstream consumers (persistence, relay,
/// vardiff accounting) treat it as immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
#[serde(rename_all = "camelCase")]
pub struct Share {
    pub pool_id: String,
    pub worker: String,
    /// Payout address parsed from the worker name, when one is present.
    pub miner_address: Option<String>,
    /// Difficulty the worker was credited at (its stratum-assigned diff).
    pub claimed_difficulty: f64,
    /// Difficulty the hash actually achieved. Never below `claimed_difficulty`
    /// for a recorded share.
    pub actual_difficulty: f64,
    pub network_difficulty: f64,
    pub block_height: u64,
    pub is_block_candidate: bool,
    /// Cluster that produced the share. Rewritten by the share receiver when
    /// a share arrives from a remote relay.
    pub source: String,
    /// Unix millis. Re-stamped with the local clock on relay receipt.
    pub created_ms: u64,
    /// Submission material kept for block candidates (nonce, and the mix hash
    /// for families that carry one).
    pub nonce: Option<String>,
    pub mix_hash: Option<String>,
    /// Set once the daemon has accepted the candidate.
    pub transaction_hash: Option<String>,
}

/// Operator-facing events: block outcomes and daemon health transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum AdminNotification {
    BlockAccepted { pool_id: String, block_height: u64, transaction_hash: String },
    BlockSubmissionFailed { pool_id: String, block_height: u64, reason: String },
    DaemonsUnreachable { pool_id: String },
    PoolStartupFailed { pool_id: String, reason: String },
}

/// Periodic per-pool counters published on the telemetry channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolTelemetry {
    pub pool_id: String,
    pub connected_sessions: usize,
    pub valid_shares: u64,
    pub invalid_shares: u64,
    pub blocks_found: u64,
    pub network_difficulty: f64,
}
