pub mod chain;
pub mod header;

use std::collections::HashMap;
use std::sync::Arc;

use blake2::{Blake2b512, Digest};
use parking_lot::Mutex;
use thiserror::Error;

pub use chain::ChainShareValidator;
pub use header::HeaderShareValidator;

#[derive(Debug, Error)]
pub enum PowError {
    #[error("no context built for seed {0}")]
    MissingContext(String),
    #[error("context build failed: {0}")]
    ContextBuild(String),
    #[error("hashing failed: {0}")]
    Hash(String),
}

/// Narrow verify capability over a coin's proof-of-work primitive. Real
/// implementations (Ethash DAGs, memory-hard CPU PoW, SHA chains) live
/// outside this crate; the validator only asks for the 32-byte pow hash of
/// an assembled candidate.
pub trait PowContext: Send + Sync {
    fn pow_hash(&self, header: &[u8], nonce: u64) -> Result<[u8; 32], PowError>;
}

type ContextBuilder = Box<dyn Fn(&str) -> Result<Arc<dyn PowContext>, PowError> + Send + Sync>;

/// Per-epoch context registry for memory-hard families. A context (DAG) is
/// built once per seed, on the job-installation path, and shared immutably by
/// every validation afterwards.
pub struct ContextCache {
    builder: ContextBuilder,
    contexts: Mutex<HashMap<String, Arc<dyn PowContext>>>,
}

impl ContextCache {
    pub fn new(builder: ContextBuilder) -> Arc<Self> {
        Arc::new(Self { builder, contexts: Mutex::new(HashMap::new()) })
    }

    /// Reference cache whose contexts hash with blake2b. Stands in for real
    /// DAG construction in tests and dev pools.
    pub fn blake2_reference() -> Arc<Self> {
        Self::new(Box::new(|seed| Ok(Arc::new(Blake2Context { seed: seed.to_string() }) as Arc<dyn PowContext>)))
    }

    /// Build-once accessor used by the job manager before publishing the
    /// first job of a new epoch.
    pub fn ensure(&self, seed: &str) -> Result<Arc<dyn PowContext>, PowError> {
        if let Some(context) = self.contexts.lock().get(seed) {
            return Ok(Arc::clone(context));
        }
        let context = (self.builder)(seed)?;
        let mut contexts = self.contexts.lock();
        let entry = contexts.entry(seed.to_string()).or_insert(context);
        Ok(Arc::clone(entry))
    }

    /// Lookup for the validation hot path; absent means the manager never
    /// prepared this epoch.
    pub fn get(&self, seed: &str) -> Option<Arc<dyn PowContext>> {
        self.contexts.lock().get(seed).cloned()
    }
}

/// Deterministic stand-in for a per-epoch dataset.
struct Blake2Context {
    seed: String,
}

impl PowContext for Blake2Context {
    fn pow_hash(&self, header: &[u8], nonce: u64) -> Result<[u8; 32], PowError> {
        let mut hasher = Blake2b512::new();
        hasher.update(self.seed.as_bytes());
        hasher.update(header);
        hasher.update(nonce.to_le_bytes());
        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest[..32]);
        Ok(out)
    }
}

/// Stateless blake2b hasher for chain families that need no epoch data.
pub struct Blake2Chain;

impl PowContext for Blake2Chain {
    fn pow_hash(&self, header: &[u8], nonce: u64) -> Result<[u8; 32], PowError> {
        let mut hasher = Blake2b512::new();
        hasher.update(header);
        hasher.update(nonce.to_le_bytes());
        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest[..32]);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn context_built_once_per_seed() {
        let builds = Arc::new(AtomicUsize::new(0));
        let builds_in_builder = Arc::clone(&builds);
        let cache = ContextCache::new(Box::new(move |seed| {
            builds_in_builder.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Blake2Context { seed: seed.to_string() }) as Arc<dyn PowContext>)
        }));

        cache.ensure("seed-a").unwrap();
        cache.ensure("seed-a").unwrap();
        cache.ensure("seed-b").unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert!(cache.get("seed-a").is_some());
        assert!(cache.get("seed-c").is_none());
    }

    #[test]
    fn reference_context_is_deterministic() {
        let cache = ContextCache::blake2_reference();
        let context = cache.ensure("epoch0").unwrap();
        let a = context.pow_hash(b"header", 42).unwrap();
        let b = context.pow_hash(b"header", 42).unwrap();
        let c = context.pow_hash(b"header", 43).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
