//! Provably-Fair Crash Points
//!
//! Commit-reveal scheme for round outcomes:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    FAIRNESS ENGINE                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  commitment.rs - seed, commitment, crash point derivation   │
//! │  engine.rs     - entropy sources, per-round generation      │
//! │  verify.rs     - reveal verification and proof data         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The commitment is published when betting opens; the seed is revealed
//! only after the round crashes.

pub mod commitment;
pub mod engine;
pub mod verify;

use thiserror::Error;

pub use commitment::{
    commit_hex, crash_point_from_unit, derive, to_unit_float, Seed, HOUSE_EDGE,
    MAX_CRASH_POINT, MIN_CRASH_POINT,
};
pub use engine::{DeterministicEntropy, EntropySource, FairnessEngine, OsEntropy, RoundFairness};
pub use verify::{proof, verify, verify_reveal, CrashProof, VERIFY_EPSILON};

/// Fairness errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FairnessError {
    /// Entropy source failed or produced unusable output. Fatal.
    #[error("entropy unavailable: {0}")]
    EntropyUnavailable(String),

    /// Revealed seed is not 32 bytes of hex.
    #[error("invalid seed encoding")]
    InvalidSeed,

    /// Revealed seed does not hash to the published commitment.
    #[error("commitment mismatch: published {expected}, computed {computed}")]
    CommitMismatch {
        /// Published commitment.
        expected: String,
        /// Commitment computed from the seed.
        computed: String,
    },

    /// Revealed seed does not reproduce the claimed crash point.
    #[error("crash point mismatch: claimed {claimed}, computed {computed}")]
    CrashPointMismatch {
        /// Claimed crash point.
        claimed: f64,
        /// Crash point computed from the seed.
        computed: f64,
    },
}
