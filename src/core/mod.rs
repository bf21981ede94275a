//! Core primitives.
//!
//! Fixed-point money, hashing and time. Nothing in here knows about rounds.

pub mod clock;
pub mod hash;
pub mod money;

// Re-export core types
pub use clock::{Clock, ManualClock, SystemClock};
pub use hash::{hash_with_domain, sha256_hex, DomainHasher, Hash32};
pub use money::{CryptoAmount, Multiplier, Usd};
