//! Round, Bet and Transaction Records
//!
//! The active [`Round`] is owned by the scheduler. Its seed and crash point
//! stay private until the round has crashed.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::hash::DomainHasher;
use crate::core::money::{CryptoAmount, Multiplier, Usd};
use crate::fairness::{RoundFairness, Seed};

/// Monotonic round identifier.
pub type RoundId = u64;

// =============================================================================
// USER ID
// =============================================================================

/// Unique user identifier (16 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub [u8; 16]);

impl UserId {
    /// Create from raw bytes.
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Fresh random id for an unauthenticated guest.
    pub fn guest() -> Self {
        Self(*uuid::Uuid::new_v4().as_bytes())
    }

    /// Create from UUID string.
    pub fn from_uuid_str(s: &str) -> Option<Self> {
        uuid::Uuid::parse_str(s).ok().map(|u| Self(*u.as_bytes()))
    }

    /// Convert to UUID string.
    pub fn to_uuid_string(&self) -> String {
        uuid::Uuid::from_bytes(self.0).to_string()
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_uuid_string())
    }
}

// =============================================================================
// CURRENCY
// =============================================================================

/// Crypto currency a bet is quoted and paid in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Currency {
    /// Bitcoin
    Btc,
    /// Ether
    Eth,
}

impl Currency {
    /// All supported currencies.
    pub const ALL: [Currency; 2] = [Currency::Btc, Currency::Eth];

    /// Lowercase ticker.
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Btc => "btc",
            Currency::Eth => "eth",
        }
    }
}

impl FromStr for Currency {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "btc" => Ok(Currency::Btc),
            "eth" => Ok(Currency::Eth),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// ROUND
// =============================================================================

/// Round lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    /// Betting window open.
    Waiting,
    /// Multiplier rising, cash-outs accepted.
    Running,
    /// Round over, seed revealed.
    Crashed,
}

/// A single crash round.
#[derive(Clone, Debug)]
pub struct Round {
    /// Round identifier.
    pub id: RoundId,
    /// Published commitment (hex).
    pub commit_hash: String,
    /// Current phase.
    pub phase: RoundPhase,
    /// When the round was opened.
    pub created_at: DateTime<Utc>,
    /// When the multiplier started rising.
    pub started_at: Option<DateTime<Utc>>,
    /// When the round crashed.
    pub ended_at: Option<DateTime<Utc>>,
    /// Tick value that ended the round.
    pub final_multiplier: Option<Multiplier>,
    seed: Seed,
    crash_point: Multiplier,
}

impl Round {
    /// Open a round from freshly generated fairness data.
    pub fn open(fairness: RoundFairness, now: DateTime<Utc>) -> Self {
        Self {
            id: fairness.round_id,
            commit_hash: fairness.commit_hash,
            phase: RoundPhase::Waiting,
            created_at: now,
            started_at: None,
            ended_at: None,
            final_multiplier: None,
            seed: fairness.seed,
            crash_point: fairness.crash_point,
        }
    }

    /// The hidden crash point. Only the scheduler reads this before the crash.
    pub(crate) fn crash_point(&self) -> Multiplier {
        self.crash_point
    }

    /// Crash point, once public.
    pub fn revealed_crash_point(&self) -> Option<Multiplier> {
        (self.phase == RoundPhase::Crashed).then_some(self.crash_point)
    }

    /// Seed, once public.
    pub fn revealed_seed(&self) -> Option<Seed> {
        (self.phase == RoundPhase::Crashed).then_some(self.seed)
    }

    /// Full record for durable storage. Contains the secret seed.
    pub fn to_record(&self) -> RoundRecord {
        RoundRecord {
            id: self.id,
            seed: self.seed.to_hex(),
            commit_hash: self.commit_hash.clone(),
            crash_point: Some(self.crash_point),
            phase: self.phase,
            created_at: self.created_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            final_multiplier: self.final_multiplier,
        }
    }
}

/// Persisted form of a round.
///
/// Stores must never expose `seed` or `crash_point` of a non-crashed record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    /// Round identifier.
    pub id: RoundId,
    /// Seed (hex).
    pub seed: String,
    /// Commitment (hex).
    pub commit_hash: String,
    /// Crash point. `None` when read back from a store before the crash.
    pub crash_point: Option<Multiplier>,
    /// Phase at time of write.
    pub phase: RoundPhase,
    /// Opened at.
    pub created_at: DateTime<Utc>,
    /// Started at.
    pub started_at: Option<DateTime<Utc>>,
    /// Crashed at.
    pub ended_at: Option<DateTime<Utc>>,
    /// Final tick value.
    pub final_multiplier: Option<Multiplier>,
}

// =============================================================================
// BETS
// =============================================================================

/// Bet resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetStatus {
    /// Stake debited, outcome pending.
    Active,
    /// Cashed out before the crash.
    CashedOut,
    /// Lost to the crash.
    Lost,
}

/// A player's stake in one round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bet {
    /// Round the bet belongs to.
    pub round_id: RoundId,
    /// Owner.
    pub user_id: UserId,
    /// Display name.
    pub username: String,
    /// Stake in USD.
    pub usd_amount: Usd,
    /// Stake in crypto at `price_at_bet`.
    pub crypto_amount: CryptoAmount,
    /// Quote currency.
    pub currency: Currency,
    /// USD per coin when the bet was placed.
    pub price_at_bet: f64,
    /// Resolution.
    pub status: BetStatus,
    /// Multiplier at cash-out.
    pub cashout_multiplier: Option<Multiplier>,
    /// USD payout at cash-out.
    pub usd_payout: Option<Usd>,
    /// Crypto payout at cash-out.
    pub crypto_payout: Option<CryptoAmount>,
    /// Placement time.
    pub placed_at: DateTime<Utc>,
}

impl Bet {
    /// True once cashed out.
    pub fn is_cashed_out(&self) -> bool {
        self.status == BetStatus::CashedOut
    }

    /// True once cashed out or lost.
    pub fn is_settled(&self) -> bool {
        self.status != BetStatus::Active
    }
}

// =============================================================================
// TRANSACTIONS
// =============================================================================

/// Ledger entry kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Stake debited.
    Bet,
    /// Payout credited.
    Cashout,
    /// Stake forfeited at crash.
    Loss,
}

impl TransactionKind {
    fn tag(self) -> u8 {
        match self {
            TransactionKind::Bet => 1,
            TransactionKind::Cashout => 2,
            TransactionKind::Loss => 3,
        }
    }
}

/// Append-only ledger entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// User.
    pub user_id: UserId,
    /// Round.
    pub round_id: RoundId,
    /// USD amount moved (stake or payout).
    pub usd_amount: Usd,
    /// Crypto amount moved.
    pub crypto_amount: CryptoAmount,
    /// Currency.
    pub currency: Currency,
    /// Price the bet was quoted at.
    pub price_at_time: f64,
    /// Entry kind.
    pub kind: TransactionKind,
    /// Cash-out multiplier (cashout only).
    pub multiplier: Option<Multiplier>,
    /// Deterministic id, also the wallet idempotency key.
    pub transaction_hash: String,
    /// Time of entry.
    pub timestamp: DateTime<Utc>,
}

/// Deterministic transaction id for `(kind, round, user)`.
///
/// At most one entry of each kind exists per bet, so the id is unique and a
/// retried wallet call reuses it.
pub fn transaction_hash(kind: TransactionKind, round_id: RoundId, user_id: &UserId) -> String {
    let mut hasher = DomainHasher::for_transaction();
    hasher.update_u8(kind.tag());
    hasher.update_u64(round_id);
    hasher.update_id(user_id.as_bytes());
    format!("0x{}", hex::encode(hasher.finalize()))
}

// =============================================================================
// SNAPSHOT
// =============================================================================

/// Point-in-time view of the active round for `get_state`.
///
/// Never contains the seed or crash point of an unfinished round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundSnapshot {
    /// Active round id (None before the first round opens).
    pub round_id: Option<RoundId>,
    /// Phase of the active round.
    pub phase: Option<RoundPhase>,
    /// Commitment of the active round.
    pub commit_hash: Option<String>,
    /// Last computed multiplier.
    pub multiplier: Multiplier,
    /// Milliseconds since the round started.
    pub elapsed_ms: u64,
    /// When the round started.
    pub started_at: Option<DateTime<Utc>>,
    /// Bets in the active round.
    pub bets: Vec<Bet>,
    /// Crash point of the previous round.
    pub last_crash: Option<Multiplier>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_fairness() -> RoundFairness {
        let seed = Seed::new([3; 32]);
        let (hash, crash_point) = crate::fairness::derive(&seed, 9);
        RoundFairness { round_id: 9, seed, commit_hash: hex::encode(hash), crash_point }
    }

    #[test]
    fn test_secrets_hidden_until_crash() {
        let mut round = Round::open(test_fairness(), Utc::now());
        assert_eq!(round.phase, RoundPhase::Waiting);
        assert!(round.revealed_seed().is_none());
        assert!(round.revealed_crash_point().is_none());

        round.phase = RoundPhase::Running;
        assert!(round.revealed_seed().is_none());

        round.phase = RoundPhase::Crashed;
        assert_eq!(round.revealed_seed(), Some(Seed::new([3; 32])));
        assert_eq!(round.revealed_crash_point(), Some(round.crash_point()));
    }

    #[test]
    fn test_currency_parse() {
        assert_eq!("BTC".parse::<Currency>(), Ok(Currency::Btc));
        assert_eq!(" eth ".parse::<Currency>(), Ok(Currency::Eth));
        assert!("doge".parse::<Currency>().is_err());
    }

    #[test]
    fn test_transaction_hash_unique_per_kind_round_user() {
        let alice = UserId::new([1; 16]);
        let bob = UserId::new([2; 16]);

        let h = transaction_hash(TransactionKind::Bet, 1, &alice);
        assert!(h.starts_with("0x"));
        assert_eq!(h.len(), 66);
        assert_eq!(h, transaction_hash(TransactionKind::Bet, 1, &alice));
        assert_ne!(h, transaction_hash(TransactionKind::Cashout, 1, &alice));
        assert_ne!(h, transaction_hash(TransactionKind::Bet, 2, &alice));
        assert_ne!(h, transaction_hash(TransactionKind::Bet, 1, &bob));
    }

    #[test]
    fn test_user_id_uuid_roundtrip() {
        let id = UserId::guest();
        assert_eq!(UserId::from_uuid_str(&id.to_uuid_string()), Some(id));
        assert_ne!(UserId::guest(), id);
    }
}
