//! # Crash Round Server
//!
//! Provably-fair crash rounds with a live WebSocket event stream.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   CRASH ROUND SERVER                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Primitives                                │
//! │  ├── money.rs    - Fixed-point USD, crypto and multipliers   │
//! │  ├── hash.rs     - Domain separated SHA-256                  │
//! │  └── clock.rs    - Injectable time source                    │
//! │                                                              │
//! │  fairness/       - Commit-reveal crash points                │
//! │                                                              │
//! │  round/          - Round lifecycle                           │
//! │  ├── ledger.rs   - Bets, cash-outs, settlement               │
//! │  ├── scheduler.rs- Phase transitions and multiplier curve    │
//! │  └── runtime.rs  - Actor task, persistence, event publishing │
//! │                                                              │
//! │  services/       - Wallet, price oracle, persistence         │
//! │                                                              │
//! │  network/        - WebSocket server and event fan-out        │
//! │  ├── server.rs   - Connections and request routing           │
//! │  ├── protocol.rs - Message types                             │
//! │  ├── broadcast.rs- Sequenced event broadcast                 │
//! │  └── auth.rs     - JWT validation                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Fairness Guarantee
//!
//! Each round's crash point is fixed by a secret seed before betting opens.
//! Only `SHA-256(seed_hex "-" round_id)` is published up front; the seed is
//! revealed after the crash so anyone can recompute the crash point with
//! [`fairness::verify`].
//!
//! Money never touches floating point inside the engine: USD is held in
//! micro-dollars, crypto in 1e-8 units and multipliers in hundredths.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod fairness;
pub mod network;
pub mod round;
pub mod services;

// Re-export commonly used types
pub use core::money::{CryptoAmount, Multiplier, Usd};
pub use fairness::{CrashProof, FairnessEngine, Seed};
pub use network::{BroadcastChannel, CrashServer, ServerConfig};
pub use round::{Bet, Currency, RoundEvent, RoundHandle, RoundId, RoundPhase, RoundRuntime, UserId};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
