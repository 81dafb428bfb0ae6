use std::sync::Arc;

use orepool_core::Share;
use orepool_stratum::StratumError;
use serde_json::Value;

use crate::family::ContextCache;
use crate::job::JobStore;
use crate::validator::{
    SubmitContext, ShareValidator, checked_pow_hash, finish_validation, locate_job, param_str, parse_hex_bytes,
    parse_hex_u64,
};

/// Validator for header-based, memory-hard families (Ethash-style): the
/// submission carries a 64-bit nonce and a mix hash, and hashing goes through
/// a per-epoch context the job manager prepared ahead of time.
///
/// Submission params: `[worker, job_id, nonce, mix_hash?]`.
pub struct HeaderShareValidator {
    contexts: Arc<ContextCache>,
}

impl HeaderShareValidator {
    pub fn new(contexts: Arc<ContextCache>) -> Self {
        Self { contexts }
    }
}

impl ShareValidator for HeaderShareValidator {
    fn validate_submit(&self, ctx: &SubmitContext<'_>, params: &Value, jobs: &JobStore) -> Result<Share, StratumError> {
        let job_id = param_str(params, 1, "job_id")?;
        let nonce_hex = param_str(params, 2, "nonce")?;
        let mix_hash_hex = params.get(3).and_then(Value::as_str);

        let job = locate_job(jobs, job_id)?;

        let nonce = parse_hex_u64(nonce_hex, "nonce")?;
        if let Some(mix) = mix_hash_hex {
            parse_hex_bytes(mix, 32, "mix_hash")?;
        }

        if job.is_duplicate(ctx.extra_nonce1, nonce_hex, None) {
            return Err(StratumError::DuplicateShare);
        }

        let seed = job.template.seed_hash.as_deref().unwrap_or("");
        let context = self
            .contexts
            .get(seed)
            .ok_or_else(|| {
                tracing::error!("no pow context for seed {} at height {}", seed, job.template.height);
                StratumError::Other("validation failure".into())
            })?;

        let mut candidate = job.template.header.clone();
        candidate.extend_from_slice(ctx.extra_nonce1.as_bytes());
        let hash = checked_pow_hash(&context, &candidate, nonce)?;

        finish_validation(ctx, &job, hash, nonce_hex, mix_hash_hex, None)
    }
}
