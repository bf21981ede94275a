//! Round Errors
//!
//! Validation errors are raised before any state is touched, so a failed
//! `place_bet` or `cash_out` never leaves a partial write behind.

use thiserror::Error;

use crate::fairness::FairnessError;
use crate::round::state::RoundId;
use crate::services::persistence::StoreError;
use crate::services::wallet::WalletError;

/// Errors from the ledger, scheduler and runtime.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RoundError {
    /// Stake below the minimum or not representable.
    #[error("minimum bet amount is 1 USD")]
    InvalidBetAmount,

    /// User already has a bet in this round.
    #[error("user already has a bet in round {0}")]
    DuplicateBet(RoundId),

    /// Betting window is closed.
    #[error("round is not accepting bets")]
    RoundNotAcceptingBets,

    /// Wallet cannot cover the stake.
    #[error("insufficient balance")]
    InsufficientBalance,

    /// No bet to cash out.
    #[error("no active bet found for this user")]
    NoActiveBet,

    /// Bet was already cashed out.
    #[error("bet already cashed out")]
    AlreadyCashedOut,

    /// Cash-out outside the running phase.
    #[error("cash out is only allowed while the round is running")]
    RoundNotRunning,

    /// A round is still in progress.
    #[error("round {0} is still in progress")]
    RoundInProgress(RoundId),

    /// Price snapshot unusable.
    #[error("invalid price for {0}")]
    InvalidPrice(String),

    /// Unsupported quote currency.
    #[error("unsupported currency: {0}")]
    UnsupportedCurrency(String),

    /// Storage write failed. Retryable.
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    /// Wallet did not answer. Retryable, nothing was applied.
    #[error("wallet unavailable: {0}")]
    WalletUnavailable(String),

    /// A revealed round does not verify.
    #[error("fairness verification failed: {0}")]
    FairnessVerificationFailure(FairnessError),

    /// Entropy source broken. Fatal, no further rounds open.
    #[error("fairness engine unavailable: {0}")]
    FairnessUnavailable(FairnessError),

    /// The round engine has stopped.
    #[error("round engine stopped")]
    EngineStopped,
}

impl RoundError {
    /// Whether the caller may retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RoundError::PersistenceFailure(_) | RoundError::WalletUnavailable(_))
    }
}

impl From<FairnessError> for RoundError {
    fn from(err: FairnessError) -> Self {
        match err {
            FairnessError::EntropyUnavailable(_) => RoundError::FairnessUnavailable(err),
            other => RoundError::FairnessVerificationFailure(other),
        }
    }
}

impl From<StoreError> for RoundError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateBet { round_id, .. } => RoundError::DuplicateBet(round_id),
            other => RoundError::PersistenceFailure(other.to_string()),
        }
    }
}

impl From<WalletError> for RoundError {
    fn from(err: WalletError) -> Self {
        match err {
            WalletError::InsufficientBalance { .. } => RoundError::InsufficientBalance,
            other => RoundError::WalletUnavailable(other.to_string()),
        }
    }
}
