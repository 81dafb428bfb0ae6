use std::sync::Arc;

use orepool_core::Share;
use orepool_stratum::StratumError;
use serde_json::Value;

use crate::family::PowContext;
use crate::job::JobStore;
use crate::validator::{
    SubmitContext, ShareValidator, checked_pow_hash, finish_validation, locate_job, param_str, parse_hex_u64,
};

/// Validator for SHA-family chains that build the coinbase locally: the
/// submission carries an extra-nonce2 which, together with the session's
/// extra-nonce prefix, completes the coinbase before hashing. No epoch data.
///
/// Submission params: `[worker, job_id, extra_nonce2, nonce]`.
pub struct ChainShareValidator {
    hasher: Arc<dyn PowContext>,
}

impl ChainShareValidator {
    pub fn new(hasher: Arc<dyn PowContext>) -> Self {
        Self { hasher }
    }
}

impl ShareValidator for ChainShareValidator {
    fn validate_submit(&self, ctx: &SubmitContext<'_>, params: &Value, jobs: &JobStore) -> Result<Share, StratumError> {
        let job_id = param_str(params, 1, "job_id")?;
        let extra_nonce2 = param_str(params, 2, "extra_nonce2")?;
        let nonce_hex = param_str(params, 3, "nonce")?;

        let job = locate_job(jobs, job_id)?;

        let nonce = parse_hex_u64(nonce_hex, "nonce")?;
        if extra_nonce2.is_empty() || extra_nonce2.len() > 16 || !extra_nonce2.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StratumError::Other("malformed hex in extra_nonce2".into()));
        }

        if job.is_duplicate(ctx.extra_nonce1, nonce_hex, Some(extra_nonce2)) {
            return Err(StratumError::DuplicateShare);
        }

        let mut candidate = job.template.header.clone();
        if let Some(coinbase) = &job.template.coinbase {
            candidate.extend_from_slice(coinbase);
        }
        candidate.extend_from_slice(ctx.extra_nonce1.as_bytes());
        candidate.extend_from_slice(extra_nonce2.as_bytes());
        let hash = checked_pow_hash(&self.hasher, &candidate, nonce)?;

        finish_validation(ctx, &job, hash, nonce_hex, None, Some(extra_nonce2))
    }
}
