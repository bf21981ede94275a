//! Round Engine
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ROUND ENGINE                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  state.rs     - rounds, bets, transactions, snapshots       │
//! │  ledger.rs    - bet placement, cash-out, settlement         │
//! │  scheduler.rs - WAITING -> RUNNING -> CRASHED transitions   │
//! │  runtime.rs   - actor task driving the scheduler            │
//! │  events.rs    - observer-facing event schema                │
//! │  error.rs     - request and lifecycle errors                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only the runtime task mutates the active round. Everything else talks to
//! it through a [`RoundHandle`].

pub mod error;
pub mod events;
pub mod ledger;
pub mod runtime;
pub mod scheduler;
pub mod state;

pub use error::RoundError;
pub use events::RoundEvent;
pub use ledger::{BetLedger, BetRequest, LedgerWrites, Settlement, MIN_BET};
pub use runtime::{RoundHandle, RoundRuntime, RuntimeConfig, RuntimeError};
pub use scheduler::{
    multiplier_at, CrashReport, OpenedRound, RoundScheduler, SchedulerConfig, StartedRound, TickOutcome,
};
pub use state::{
    transaction_hash, Bet, BetStatus, Currency, Round, RoundId, RoundPhase, RoundRecord, RoundSnapshot,
    Transaction, TransactionKind, UserId,
};
