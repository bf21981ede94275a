//! Verification of Revealed Rounds
//!
//! Anyone holding the revealed seed can recompute the commitment and the
//! crash point. Tampering shows up as a commitment mismatch; the epsilon on
//! the crash point only absorbs float rounding between implementations.

use serde::{Deserialize, Serialize};

use crate::core::money::Multiplier;
use crate::fairness::commitment::{commit, crash_point_from_unit, to_unit_float, Seed, HOUSE_EDGE};
use crate::fairness::FairnessError;

/// Tolerance when comparing a claimed crash point to the recomputed one.
pub const VERIFY_EPSILON: f64 = 0.01;

/// Proof data published alongside the revealed seed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrashProof {
    /// Commitment (hex).
    pub hash: String,
    /// Unit float derived from the commitment.
    pub unit_float: f64,
    /// Human readable derivation.
    pub calculation: String,
}

/// Build proof data for a revealed seed.
pub fn proof(seed: &Seed, round_id: u64) -> CrashProof {
    let hash = commit(seed, round_id);
    let unit_float = to_unit_float(&hash);
    CrashProof {
        hash: hex::encode(hash),
        unit_float,
        calculation: format!("crashPoint = {} / (1 - {})", 1.0 - HOUSE_EDGE, unit_float),
    }
}

/// Recompute the crash point from a revealed seed and compare.
///
/// Returns `false` for malformed seeds.
pub fn verify(seed_hex: &str, round_id: u64, claimed_crash_point: f64) -> bool {
    let seed = match Seed::from_hex(seed_hex) {
        Ok(seed) => seed,
        Err(_) => return false,
    };
    let computed = crash_point_from_unit(to_unit_float(&commit(&seed, round_id)));
    (computed.to_f64() - claimed_crash_point).abs() < VERIFY_EPSILON
}

/// Full reveal check: the seed must match the published commitment and
/// reproduce the claimed crash point.
pub fn verify_reveal(
    seed_hex: &str,
    round_id: u64,
    commit_hash: &str,
    claimed_crash_point: Multiplier,
) -> Result<(), FairnessError> {
    let seed = Seed::from_hex(seed_hex)?;
    let hash = commit(&seed, round_id);
    let computed_hash = hex::encode(hash);

    if !computed_hash.eq_ignore_ascii_case(commit_hash) {
        return Err(FairnessError::CommitMismatch {
            expected: commit_hash.to_string(),
            computed: computed_hash,
        });
    }

    // Both sides are already floored to hundredths, so compare exactly.
    let computed = crash_point_from_unit(to_unit_float(&hash));
    if computed != claimed_crash_point {
        return Err(FairnessError::CrashPointMismatch {
            claimed: claimed_crash_point.to_f64(),
            computed: computed.to_f64(),
        });
    }

    Ok(())
}
