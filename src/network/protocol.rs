//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket. All messages
//! are JSON text frames tagged by `type`. Amounts and multipliers are sent
//! as decimal numbers; the fixed-point values stay inside the server.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::round::error::RoundError;
use crate::round::events::RoundEvent;
use crate::round::ledger::Settlement;
use crate::round::state::{Bet, BetStatus, Currency, RoundId, RoundPhase, RoundSnapshot};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate with a JWT from the identity provider.
    Auth {
        /// Bearer token.
        token: String,
    },

    /// Request a snapshot of the active round.
    GetState,

    /// Place a bet in the open betting window.
    PlaceBet(PlaceBetRequest),

    /// Cash out the current bet.
    CashOut,

    /// Request the caller's wallet balances.
    GetBalance,

    /// Send a chat line to every connected client.
    Chat {
        /// Message text.
        message: String,
    },

    /// Ping for latency measurement.
    Ping {
        /// Client timestamp, echoed back.
        #[serde(default)]
        timestamp: u64,
    },
}

/// Bet request as sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceBetRequest {
    /// Stake in USD.
    pub amount: f64,
    /// Quote currency ticker (`btc`, `eth`).
    pub currency: String,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Authentication result.
    AuthResult(AuthResult),

    /// A broadcast round event.
    Event {
        /// Position in the event stream.
        seq: u64,
        /// The event.
        event: RoundEvent,
    },

    /// Snapshot reply to `get_state`.
    State(StateView),

    /// The caller's bet was accepted.
    BetAccepted(BetView),

    /// The caller's cash-out went through.
    CashoutSuccess(CashoutView),

    /// Reply to `get_balance`.
    Balance(BalanceView),

    /// A relayed chat line.
    Chat(ChatMessage),

    /// Events were dropped for this connection; request a fresh snapshot.
    ResyncRequired {
        /// Number of events missed.
        missed: u64,
    },

    /// Pong response.
    Pong {
        /// Echoed client timestamp.
        timestamp: u64,
        /// Server time (Unix millis).
        server_time: u64,
    },

    /// Request failed.
    Error(ServerError),

    /// Server is shutting down.
    Shutdown {
        /// Human readable reason.
        reason: String,
    },
}

/// Authentication result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthResult {
    /// Whether the token was accepted.
    pub success: bool,
    /// Resolved user id (UUID).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Failure reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Server version.
    pub server_version: String,
}

/// Public view of a bet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BetView {
    /// Round.
    pub round_id: RoundId,
    /// Owner (UUID).
    pub user_id: String,
    /// Display name.
    pub username: String,
    /// Stake in USD.
    pub usd_amount: f64,
    /// Stake in crypto.
    pub crypto_amount: f64,
    /// Currency.
    pub currency: Currency,
    /// USD per coin at placement.
    pub price_at_bet: f64,
    /// Resolution.
    pub status: BetStatus,
    /// Convenience flag for clients.
    pub cashed_out: bool,
    /// Multiplier at cash-out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cashout_multiplier: Option<f64>,
    /// USD payout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usd_payout: Option<f64>,
    /// Crypto payout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crypto_payout: Option<f64>,
}

impl From<&Bet> for BetView {
    fn from(bet: &Bet) -> Self {
        Self {
            round_id: bet.round_id,
            user_id: bet.user_id.to_uuid_string(),
            username: bet.username.clone(),
            usd_amount: bet.usd_amount.to_f64(),
            crypto_amount: bet.crypto_amount.to_f64(),
            currency: bet.currency,
            price_at_bet: bet.price_at_bet,
            status: bet.status,
            cashed_out: bet.is_cashed_out(),
            cashout_multiplier: bet.cashout_multiplier.map(|m| m.to_f64()),
            usd_payout: bet.usd_payout.map(|u| u.to_f64()),
            crypto_payout: bet.crypto_payout.map(|c| c.to_f64()),
        }
    }
}

/// Cash-out confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CashoutView {
    /// Round.
    pub round_id: RoundId,
    /// Multiplier applied.
    pub multiplier: f64,
    /// USD payout.
    pub usd_payout: f64,
    /// Crypto payout.
    pub crypto_payout: f64,
    /// Currency.
    pub currency: Currency,
    /// Ledger entry id.
    pub transaction_hash: String,
}

impl From<&Settlement> for CashoutView {
    fn from(s: &Settlement) -> Self {
        Self {
            round_id: s.round_id,
            multiplier: s.cashout_multiplier.to_f64(),
            usd_payout: s.usd_payout.to_f64(),
            crypto_payout: s.crypto_payout.to_f64(),
            currency: s.currency,
            transaction_hash: s.transaction_hash.clone(),
        }
    }
}

/// Snapshot of the active round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateView {
    /// Active round, if any.
    pub round_id: Option<RoundId>,
    /// Phase.
    pub phase: Option<RoundPhase>,
    /// Published commitment.
    pub commit_hash: Option<String>,
    /// Current multiplier.
    pub multiplier: f64,
    /// Milliseconds since start.
    pub elapsed_ms: u64,
    /// Start timestamp.
    pub started_at: Option<DateTime<Utc>>,
    /// Bets in the round.
    pub bets: Vec<BetView>,
    /// Previous crash point.
    pub last_crash: Option<f64>,
    /// USD per coin, for currencies with a usable price.
    pub crypto_prices: BTreeMap<Currency, f64>,
}

impl StateView {
    /// Snapshot plus the current prices.
    pub fn new(s: &RoundSnapshot, crypto_prices: BTreeMap<Currency, f64>) -> Self {
        Self {
            round_id: s.round_id,
            phase: s.phase,
            commit_hash: s.commit_hash.clone(),
            multiplier: s.multiplier.to_f64(),
            elapsed_ms: s.elapsed_ms,
            started_at: s.started_at,
            bets: s.bets.iter().map(BetView::from).collect(),
            last_crash: s.last_crash.map(|m| m.to_f64()),
            crypto_prices,
        }
    }
}

/// Wallet holdings of the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceView {
    /// One entry per supported currency.
    pub balances: Vec<CurrencyBalance>,
    /// Sum of the priced USD equivalents.
    pub total_usd_equivalent: f64,
}

/// Holding in one currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrencyBalance {
    /// Currency.
    pub currency: Currency,
    /// Coins held.
    pub amount: f64,
    /// USD per coin, if a price was available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    /// `amount × price`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usd_equivalent: Option<f64>,
}

impl BalanceView {
    /// Build from `(currency, coins, price)` rows.
    pub fn new(rows: impl IntoIterator<Item = (Currency, f64, Option<f64>)>) -> Self {
        let balances: Vec<CurrencyBalance> = rows
            .into_iter()
            .map(|(currency, amount, price)| CurrencyBalance {
                currency,
                amount,
                price,
                usd_equivalent: price.map(|p| amount * p),
            })
            .collect();
        let total_usd_equivalent = balances.iter().filter_map(|b| b.usd_equivalent).sum();
        Self { balances, total_usd_equivalent }
    }
}

/// Longest chat line accepted, in characters.
pub const MAX_CHAT_LEN: usize = 280;

/// Chat line as relayed to every client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Sender (UUID).
    pub user_id: String,
    /// Sender display name.
    pub username: String,
    /// Trimmed text.
    pub message: String,
    /// Server time (Unix millis).
    pub timestamp: u64,
}

// =============================================================================
// ERRORS
// =============================================================================

/// Error payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human readable message.
    pub message: String,
    /// Whether the same request may succeed if retried.
    #[serde(default)]
    pub retryable: bool,
}

impl ServerError {
    /// Error with a code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), retryable: false }
    }
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Stake below minimum or malformed.
    InvalidBetAmount,
    /// Already bet in this round.
    DuplicateBet,
    /// Betting window closed.
    RoundNotAcceptingBets,
    /// Wallet cannot cover the stake.
    InsufficientBalance,
    /// No bet to cash out.
    NoActiveBet,
    /// Bet already cashed out.
    AlreadyCashedOut,
    /// Cash-out outside the running phase.
    RoundNotRunning,
    /// Unsupported currency.
    UnsupportedCurrency,
    /// Price unavailable.
    InvalidPrice,
    /// Storage failure.
    PersistenceFailure,
    /// Wallet failure.
    WalletUnavailable,
    /// Revealed round did not verify.
    FairnessVerificationFailure,
    /// Not authenticated.
    NotAuthenticated,
    /// Authentication failed.
    AuthFailed,
    /// JWT token has expired.
    TokenExpired,
    /// Invalid JWT token (signature, format, claims).
    InvalidToken,
    /// Message could not be parsed.
    InvalidMessage,
    /// Chat line empty or too long.
    InvalidChatMessage,
    /// Internal error.
    InternalError,
}

impl From<&RoundError> for ServerError {
    fn from(err: &RoundError) -> Self {
        let code = match err {
            RoundError::InvalidBetAmount => ErrorCode::InvalidBetAmount,
            RoundError::DuplicateBet(_) => ErrorCode::DuplicateBet,
            RoundError::RoundNotAcceptingBets => ErrorCode::RoundNotAcceptingBets,
            RoundError::InsufficientBalance => ErrorCode::InsufficientBalance,
            RoundError::NoActiveBet => ErrorCode::NoActiveBet,
            RoundError::AlreadyCashedOut => ErrorCode::AlreadyCashedOut,
            RoundError::RoundNotRunning => ErrorCode::RoundNotRunning,
            RoundError::RoundInProgress(_) => ErrorCode::RoundNotAcceptingBets,
            RoundError::InvalidPrice(_) => ErrorCode::InvalidPrice,
            RoundError::UnsupportedCurrency(_) => ErrorCode::UnsupportedCurrency,
            RoundError::PersistenceFailure(_) => ErrorCode::PersistenceFailure,
            RoundError::WalletUnavailable(_) => ErrorCode::WalletUnavailable,
            RoundError::FairnessVerificationFailure(_) => ErrorCode::FairnessVerificationFailure,
            RoundError::FairnessUnavailable(_) | RoundError::EngineStopped => ErrorCode::InternalError,
        };
        Self { code, message: err.to_string(), retryable: err.is_retryable() }
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Error message from a round error.
    pub fn round_error(err: &RoundError) -> Self {
        ServerMessage::Error(ServerError::from(err))
    }
}
