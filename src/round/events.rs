//! Round Events
//!
//! Everything observers see about the lifecycle. One variant per kind with
//! a fixed schema; amounts and multipliers go out as decimal numbers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fairness::CrashProof;
use crate::round::ledger::Settlement;
use crate::round::scheduler::{CrashReport, OpenedRound, StartedRound};
use crate::round::state::{Bet, Currency, RoundId};

/// Lifecycle and ledger events, in the order they happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoundEvent {
    /// Betting window opened; the commitment is public from here on.
    NewRound {
        /// Round id.
        round_id: RoundId,
        /// `SHA-256(seed_hex "-" round_id)`, hex.
        commit_hash: String,
        /// Length of the betting window.
        wait_seconds: u64,
    },

    /// Multiplier started rising.
    RoundStarted {
        /// Round id.
        round_id: RoundId,
        /// Start of the curve.
        started_at: DateTime<Utc>,
    },

    /// One tick.
    MultiplierUpdate {
        /// Round id.
        round_id: RoundId,
        /// Current multiplier.
        multiplier: f64,
        /// Milliseconds since start.
        elapsed_ms: u64,
    },

    /// Round ended; seed and crash point revealed.
    RoundCrashed {
        /// Round id.
        round_id: RoundId,
        /// Crash point fixed by the seed.
        crash_point: f64,
        /// Last tick value, at or above the crash point.
        final_multiplier: f64,
        /// Revealed seed (hex).
        seed: String,
        /// Everything needed to re-derive the crash point.
        proof: CrashProof,
    },

    /// A bet was accepted.
    BetPlaced {
        /// Round id.
        round_id: RoundId,
        /// Bettor (UUID form).
        user_id: String,
        /// Display name.
        username: String,
        /// Stake in USD.
        usd_amount: f64,
        /// Stake debited, in whole coins.
        crypto_amount: f64,
        /// Stake currency.
        currency: Currency,
    },

    /// A bet was cashed out.
    Cashout {
        /// Round id.
        round_id: RoundId,
        /// Bettor (UUID form).
        user_id: String,
        /// Display name.
        username: String,
        /// Multiplier at cash-out.
        multiplier: f64,
        /// Payout in USD.
        usd_payout: f64,
        /// Payout credited, in whole coins.
        crypto_payout: f64,
        /// Payout currency.
        currency: Currency,
    },
}

impl RoundEvent {
    /// Round the event belongs to.
    pub fn round_id(&self) -> RoundId {
        match self {
            RoundEvent::NewRound { round_id, .. }
            | RoundEvent::RoundStarted { round_id, .. }
            | RoundEvent::MultiplierUpdate { round_id, .. }
            | RoundEvent::RoundCrashed { round_id, .. }
            | RoundEvent::BetPlaced { round_id, .. }
            | RoundEvent::Cashout { round_id, .. } => *round_id,
        }
    }

    /// Event for an opened round.
    pub fn new_round(opened: &OpenedRound) -> Self {
        RoundEvent::NewRound {
            round_id: opened.round_id,
            commit_hash: opened.commit_hash.clone(),
            wait_seconds: opened.wait.as_secs(),
        }
    }

    /// Event for a started round.
    pub fn round_started(started: &StartedRound) -> Self {
        RoundEvent::RoundStarted { round_id: started.round_id, started_at: started.started_at }
    }

    /// Event for a crash.
    pub fn round_crashed(report: &CrashReport) -> Self {
        RoundEvent::RoundCrashed {
            round_id: report.round_id,
            crash_point: report.crash_point.to_f64(),
            final_multiplier: report.final_multiplier.to_f64(),
            seed: report.seed.to_hex(),
            proof: report.proof.clone(),
        }
    }

    /// Event for an accepted bet.
    pub fn bet_placed(bet: &Bet) -> Self {
        RoundEvent::BetPlaced {
            round_id: bet.round_id,
            user_id: bet.user_id.to_uuid_string(),
            username: bet.username.clone(),
            usd_amount: bet.usd_amount.to_f64(),
            crypto_amount: bet.crypto_amount.to_f64(),
            currency: bet.currency,
        }
    }

    /// Event for a cash-out.
    pub fn cashout(settlement: &Settlement) -> Self {
        RoundEvent::Cashout {
            round_id: settlement.round_id,
            user_id: settlement.user_id.to_uuid_string(),
            username: settlement.username.clone(),
            multiplier: settlement.cashout_multiplier.to_f64(),
            usd_payout: settlement.usd_payout.to_f64(),
            crypto_payout: settlement.crypto_payout.to_f64(),
            currency: settlement.currency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::money::{CryptoAmount, Multiplier, Usd};
    use crate::round::state::UserId;
    use std::time::Duration;

    #[test]
    fn test_new_round_wire_shape() {
        let event = RoundEvent::new_round(&OpenedRound {
            round_id: 4,
            commit_hash: "ab".into(),
            wait: Duration::from_secs(10),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "new_round");
        assert_eq!(json["round_id"], 4);
        assert_eq!(json["commit_hash"], "ab");
        assert_eq!(json["wait_seconds"], 10);
        assert_eq!(event.round_id(), 4);
    }

    #[test]
    fn test_cashout_amounts_are_decimal() {
        let event = RoundEvent::cashout(&Settlement {
            round_id: 2,
            user_id: UserId::new([7; 16]),
            username: "ana".into(),
            currency: Currency::Eth,
            cashout_multiplier: Multiplier(150),
            usd_payout: Usd::from_dollars(150),
            crypto_payout: CryptoAmount(7_500_000),
            transaction_hash: "0x00".into(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "cashout");
        assert_eq!(json["multiplier"], 1.5);
        assert_eq!(json["usd_payout"], 150.0);
        assert_eq!(json["crypto_payout"], 0.075);
        assert_eq!(json["currency"], "eth");

        let back: RoundEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
