//! Fairness Engine
//!
//! Generates the secret seed, commitment and crash point for each round.
//! Entropy comes from an injectable [`EntropySource`]; a source that fails or
//! produces obviously broken output is a fatal configuration error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, error};

use crate::core::hash::DomainHasher;
use crate::core::money::Multiplier;
use crate::fairness::commitment::{derive, Seed};
use crate::fairness::FairnessError;

/// Source of seed entropy.
pub trait EntropySource: Send + Sync {
    /// Fill `out` with fresh random bytes.
    fn fill_seed(&self, out: &mut [u8; Seed::LEN]) -> Result<(), FairnessError>;
}

/// Operating system CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn fill_seed(&self, out: &mut [u8; Seed::LEN]) -> Result<(), FairnessError> {
        OsRng
            .try_fill_bytes(out)
            .map_err(|e| FairnessError::EntropyUnavailable(e.to_string()))
    }
}

/// Reproducible seed stream for simulations and tests.
///
/// Seed `n` is `SHA-256(domain, base, n)`. Never use this in production.
#[derive(Debug)]
pub struct DeterministicEntropy {
    base: u64,
    counter: AtomicU64,
}

impl DeterministicEntropy {
    /// Create a stream from a base value.
    pub fn new(base: u64) -> Self {
        Self { base, counter: AtomicU64::new(0) }
    }
}

impl EntropySource for DeterministicEntropy {
    fn fill_seed(&self, out: &mut [u8; Seed::LEN]) -> Result<(), FairnessError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let mut hasher = DomainHasher::new(b"CRASH_ROUND_TEST_ENTROPY_V1");
        hasher.update_u64(self.base);
        hasher.update_u64(n);
        *out = hasher.finalize();
        Ok(())
    }
}

/// Everything the scheduler needs to open a round.
#[derive(Clone, Debug)]
pub struct RoundFairness {
    /// Round this data is bound to.
    pub round_id: u64,
    /// Secret seed, revealed at crash.
    pub seed: Seed,
    /// Published commitment (hex).
    pub commit_hash: String,
    /// Hidden crash point.
    pub crash_point: Multiplier,
}

/// Generates provably-fair round data.
pub struct FairnessEngine {
    entropy: Arc<dyn EntropySource>,
    last_seed: Option<Seed>,
}

impl FairnessEngine {
    /// Create an engine over an entropy source.
    pub fn new(entropy: Arc<dyn EntropySource>) -> Self {
        Self { entropy, last_seed: None }
    }

    /// Engine backed by the OS CSPRNG.
    pub fn with_os_entropy() -> Self {
        Self::new(Arc::new(OsEntropy))
    }

    /// Generate seed, commitment and crash point for `round_id`.
    ///
    /// Refuses to produce data when the entropy source errors, returns an
    /// all-zero seed, or repeats the previous seed.
    pub fn generate(&mut self, round_id: u64) -> Result<RoundFairness, FairnessError> {
        let mut bytes = [0u8; Seed::LEN];
        self.entropy.fill_seed(&mut bytes)?;
        let seed = Seed::new(bytes);

        if seed.is_zero() {
            error!(round_id, "entropy source returned an all-zero seed");
            return Err(FairnessError::EntropyUnavailable("all-zero seed".into()));
        }
        if self.last_seed == Some(seed) {
            error!(round_id, "entropy source repeated the previous seed");
            return Err(FairnessError::EntropyUnavailable("repeated seed".into()));
        }
        self.last_seed = Some(seed);

        let (hash, crash_point) = derive(&seed, round_id);
        let commit_hash = hex::encode(hash);
        debug!(round_id, commit = %commit_hash, "generated round fairness data");

        Ok(RoundFairness { round_id, seed, commit_hash, crash_point })
    }
}

impl std::fmt::Debug for FairnessEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FairnessEngine").finish_non_exhaustive()
    }
}
