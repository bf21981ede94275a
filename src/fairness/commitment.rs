//! Round Commitment and Crash Point Derivation
//!
//! The commitment binds a secret seed to a round id before betting opens:
//!
//! ```text
//! commit      = hex(SHA-256(seed_hex + "-" + round_id))
//! unit_float  = top 52 bits of commit / 2^52          ∈ [0, 1)
//! crash_point = clamp(floor(0.99 / (1 - unit_float) × 100) / 100, 1.01, 1000.00)
//! ```
//!
//! Everything here is pure. The same `(seed, round_id)` always yields the same
//! commitment and crash point on any platform.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::hash::{sha256, Hash32};
use crate::core::money::Multiplier;
use crate::fairness::FairnessError;

/// Fraction of every round reserved for the house.
pub const HOUSE_EDGE: f64 = 0.01;

/// Lowest crash point a round can have (1.01x).
pub const MIN_CRASH_POINT: Multiplier = Multiplier::from_hundredths(101);

/// Highest crash point a round can have (1000.00x).
pub const MAX_CRASH_POINT: Multiplier = Multiplier::from_hundredths(100_000);

/// Bits of the commitment used for the unit float (13 hex digits).
pub const UNIT_FLOAT_BITS: u32 = 52;

/// 2^52
const UNIT_FLOAT_DIVISOR: f64 = (1u64 << UNIT_FLOAT_BITS) as f64;

/// Secret round seed (256 bits).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Seed(pub [u8; 32]);

impl Seed {
    /// Seed byte length.
    pub const LEN: usize = 32;

    /// Create from raw bytes.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Lowercase hex rendering (64 chars). This is the revealed form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a revealed seed.
    pub fn from_hex(s: &str) -> Result<Self, FairnessError> {
        let bytes = hex::decode(s).map_err(|_| FairnessError::InvalidSeed)?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| FairnessError::InvalidSeed)?;
        Ok(Self(arr))
    }

    /// True if every byte is zero.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

// Never print the secret by accident.
impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seed(<redacted>)")
    }
}

/// Commitment digest of `(seed, round_id)`.
pub fn commit(seed: &Seed, round_id: u64) -> Hash32 {
    let preimage = format!("{}-{}", seed.to_hex(), round_id);
    sha256(preimage.as_bytes())
}

/// Commitment digest as published (lowercase hex).
pub fn commit_hex(seed: &Seed, round_id: u64) -> String {
    hex::encode(commit(seed, round_id))
}

/// Map a commitment onto `[0, 1)` using its top 52 bits.
pub fn to_unit_float(hash: &Hash32) -> f64 {
    let mut head = [0u8; 8];
    head.copy_from_slice(&hash[..8]);
    let top = u64::from_be_bytes(head) >> (64 - UNIT_FLOAT_BITS);
    top as f64 / UNIT_FLOAT_DIVISOR
}

/// Crash point for a unit float, floored to hundredths and clamped.
pub fn crash_point_from_unit(unit: f64) -> Multiplier {
    let raw = Multiplier::floor_from_f64((1.0 - HOUSE_EDGE) / (1.0 - unit));
    raw.clamp(MIN_CRASH_POINT, MAX_CRASH_POINT)
}

/// Derive the commitment and crash point for a round.
pub fn derive(seed: &Seed, round_id: u64) -> (Hash32, Multiplier) {
    let hash = commit(seed, round_id);
    let crash_point = crash_point_from_unit(to_unit_float(&hash));
    (hash, crash_point)
}
