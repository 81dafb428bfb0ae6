use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use num_bigint::BigUint;
use orepool_core::Share;
use orepool_stratum::StratumError;
use serde_json::Value;

use crate::family::PowContext;
use crate::job::{Job, JobStore};
use crate::target;

/// Worker-side inputs to one submission, snapshotted by the dispatcher
/// before validation so the pipeline never touches session locks.
#[derive(Debug, Clone)]
pub struct SubmitContext<'a> {
    pub pool_id: &'a str,
    /// Cluster name stamped into the share's `source`.
    pub source: &'a str,
    pub worker_name: &'a str,
    pub extra_nonce1: &'a str,
    /// Difficulty the worker is currently credited at.
    pub difficulty: f64,
    pub now_ms: u64,
}

/// Coin-family validation capability. One implementation per family; the
/// pool wires the right one at construction.
pub trait ShareValidator: Send + Sync {
    fn validate_submit(&self, ctx: &SubmitContext<'_>, params: &Value, jobs: &JobStore) -> Result<Share, StratumError>;
}

/// Job lookup with the staleness rules: a retired id is stale, and so is a
/// job whose height the pool has already moved past (workers briefly holding
/// the previous job race the clean-jobs notification and lose).
pub(crate) fn locate_job(jobs: &JobStore, job_id: &str) -> Result<Arc<Job>, StratumError> {
    let job = jobs.get(job_id).ok_or(StratumError::StaleShare)?;
    if let Some(current) = jobs.current() {
        if job.template.height < current.template.height {
            return Err(StratumError::StaleShare);
        }
    }
    Ok(job)
}

pub(crate) fn param_str<'a>(params: &'a Value, index: usize, name: &str) -> Result<&'a str, StratumError> {
    params
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| StratumError::Other(format!("missing or non-string param: {}", name)))
}

pub(crate) fn parse_hex_u64(input: &str, name: &str) -> Result<u64, StratumError> {
    let stripped = input.strip_prefix("0x").unwrap_or(input);
    if stripped.is_empty() || stripped.len() > 16 || !stripped.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(StratumError::Other(format!("malformed hex in {}", name)));
    }
    u64::from_str_radix(stripped, 16).map_err(|_| StratumError::Other(format!("malformed hex in {}", name)))
}

pub(crate) fn parse_hex_bytes(input: &str, expected_len: usize, name: &str) -> Result<Vec<u8>, StratumError> {
    let stripped = input.strip_prefix("0x").unwrap_or(input);
    if stripped.len() != expected_len * 2 {
        return Err(StratumError::Other(format!("{} must be {} bytes", name, expected_len)));
    }
    hex::decode(stripped).map_err(|_| StratumError::Other(format!("malformed hex in {}", name)))
}

/// Payout address embedded in a `address.rig` style worker name, when the
/// first segment is plausibly an address.
pub(crate) fn miner_address_of(worker_name: &str) -> Option<String> {
    let first = worker_name.split('.').next()?;
    if first.len() >= 30 { Some(first.to_string()) } else { None }
}

/// Hash via the family primitive with a panic shield: validator-internal
/// panics must not take the session down.
pub(crate) fn checked_pow_hash(context: &Arc<dyn PowContext>, header: &[u8], nonce: u64) -> Result<[u8; 32], StratumError> {
    let result = catch_unwind(AssertUnwindSafe(|| context.pow_hash(header, nonce)));
    match result {
        Ok(Ok(hash)) => Ok(hash),
        Ok(Err(e)) => {
            tracing::error!("pow hashing failed: {}", e);
            Err(StratumError::Other("validation failure".into()))
        }
        Err(_) => {
            tracing::error!("pow hashing panicked");
            Err(StratumError::Other("validation failure".into()))
        }
    }
}

/// Shared tail of every family pipeline: target comparison, seen-set
/// recording and share construction.
#[allow(clippy::too_many_arguments)]
pub(crate) fn finish_validation(
    ctx: &SubmitContext<'_>,
    job: &Arc<Job>,
    hash: [u8; 32],
    nonce_hex: &str,
    mix_hash_hex: Option<&str>,
    extra_nonce2: Option<&str>,
) -> Result<Share, StratumError> {
    let value = BigUint::from_bytes_be(&hash);
    let actual_difficulty = target::hash_to_difficulty(&value);
    let worker_target = target::difficulty_to_target(ctx.difficulty);

    if value > worker_target {
        // Report the achieved ratio, rounded so the message stays readable.
        let reported = (actual_difficulty * 100.0).round() / 100.0;
        return Err(StratumError::LowDifficultyShare(reported));
    }

    let is_block_candidate = value <= job.network_target;
    job.record_submission(ctx.extra_nonce1, nonce_hex, extra_nonce2);

    Ok(Share {
        pool_id: ctx.pool_id.to_string(),
        worker: ctx.worker_name.to_string(),
        miner_address: miner_address_of(ctx.worker_name),
        claimed_difficulty: ctx.difficulty,
        actual_difficulty,
        network_difficulty: job.template.network_difficulty,
        block_height: job.template.height,
        is_block_candidate,
        source: ctx.source.to_string(),
        created_ms: ctx.now_ms,
        nonce: Some(nonce_hex.to_string()),
        mix_hash: mix_hash_hex.map(str::to_string),
        transaction_hash: is_block_candidate.then(|| hex::encode(hash)),
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::family::PowError;
    use num_bigint::BigUint;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Scripted pow primitive: maps nonce -> preset hash value. Unknown
    /// nonces hash to all-ones (fails every target).
    pub struct ScriptedContext {
        values: Mutex<HashMap<u64, BigUint>>,
        panic_on: Option<u64>,
    }

    impl ScriptedContext {
        pub fn new() -> Self {
            Self { values: Mutex::new(HashMap::new()), panic_on: None }
        }

        pub fn with_panic_on(nonce: u64) -> Self {
            Self { values: Mutex::new(HashMap::new()), panic_on: Some(nonce) }
        }

        pub fn script(&self, nonce: u64, value: BigUint) {
            self.values.lock().insert(nonce, value);
        }
    }

    impl PowContext for ScriptedContext {
        fn pow_hash(&self, _header: &[u8], nonce: u64) -> Result<[u8; 32], PowError> {
            if self.panic_on == Some(nonce) {
                panic!("scripted panic");
            }
            let values = self.values.lock();
            let value = values.get(&nonce).cloned().unwrap_or_else(|| BigUint::from_bytes_be(&[0xff; 32]));
            let bytes = value.to_bytes_be();
            let mut out = [0u8; 32];
            out[32 - bytes.len()..].copy_from_slice(&bytes);
            Ok(out)
        }
    }
}
