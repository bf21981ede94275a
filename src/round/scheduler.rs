//! Round Scheduler
//!
//! Pure state machine for the round lifecycle. It owns the active round and
//! its ledger; time is passed in by the caller, so the same code runs under
//! the real clock and under simulated time.
//!
//! ```text
//!            open_round + confirm_open
//!   ┌──────────────────────────────────────────────┐
//!   ▼                                              │
//! WAITING ──start()──▶ RUNNING ──tick() ≥ crash──▶ CRASHED
//!   │                     │                        ▲
//!   │                     └──force_crash()─────────┤
//!   └──force_crash() (stakes returned at 1.00x)────┘
//! ```
//!
//! Every bet, cash-out and tick goes through `&mut self`, so whichever the
//! round loop handles first wins.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::core::money::Multiplier;
use crate::fairness::{proof, verify_reveal, CrashProof, FairnessEngine, FairnessError, Seed};
use crate::round::error::RoundError;
use crate::round::ledger::{BetLedger, BetRequest, LedgerWrites, Settlement};
use crate::round::state::{Bet, Round, RoundId, RoundPhase, RoundRecord, RoundSnapshot, UserId};
use crate::services::wallet::Wallet;

// =============================================================================
// CONFIG
// =============================================================================

/// Lifecycle timing.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Betting window.
    pub wait: Duration,
    /// Interval between multiplier ticks.
    pub tick: Duration,
    /// Multiplier growth per elapsed millisecond.
    pub growth_per_ms: f64,
    /// Pause between a crash and the next round.
    pub cooldown: Duration,
    /// Delay before retrying a round that could not be persisted.
    pub open_retry_backoff: Duration,
    /// Upper bound on a single wallet call.
    pub wallet_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(10),
            tick: Duration::from_millis(100),
            growth_per_ms: 0.00006,
            cooldown: Duration::from_secs(10),
            open_retry_backoff: Duration::from_secs(5),
            wallet_timeout: Duration::from_millis(50),
        }
    }
}

impl SchedulerConfig {
    /// Load from environment variables, falling back to defaults.
    ///
    /// `CRASH_WAIT_SECS`, `CRASH_TICK_MS`, `CRASH_GROWTH_PER_MS`,
    /// `CRASH_COOLDOWN_SECS`, `CRASH_RETRY_BACKOFF_SECS`,
    /// `CRASH_WALLET_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        fn var<T: std::str::FromStr>(key: &str) -> Option<T> {
            std::env::var(key).ok().and_then(|v| v.parse().ok())
        }

        let defaults = Self::default();
        Self {
            wait: var("CRASH_WAIT_SECS").map(Duration::from_secs).unwrap_or(defaults.wait),
            tick: var("CRASH_TICK_MS")
                .filter(|ms: &u64| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.tick),
            growth_per_ms: var("CRASH_GROWTH_PER_MS")
                .filter(|g: &f64| g.is_finite() && *g > 0.0)
                .unwrap_or(defaults.growth_per_ms),
            cooldown: var("CRASH_COOLDOWN_SECS").map(Duration::from_secs).unwrap_or(defaults.cooldown),
            open_retry_backoff: var("CRASH_RETRY_BACKOFF_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.open_retry_backoff),
            wallet_timeout: var("CRASH_WALLET_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.wallet_timeout),
        }
    }
}

/// `floor((1 + elapsed_ms × growth) × 100) / 100`.
///
/// Non-decreasing in `elapsed_ms`, and `multiplier_at(0, _) == 1.00x`.
pub fn multiplier_at(elapsed_ms: u64, growth_per_ms: f64) -> Multiplier {
    Multiplier::floor_from_f64(1.0 + elapsed_ms as f64 * growth_per_ms).max(Multiplier::ONE)
}

// =============================================================================
// OUTPUTS
// =============================================================================

/// A freshly opened round, ready to announce.
#[derive(Clone, Debug, PartialEq)]
pub struct OpenedRound {
    /// Round id.
    pub round_id: RoundId,
    /// Published commitment.
    pub commit_hash: String,
    /// Betting window.
    pub wait: Duration,
}

/// A round that just left the betting window.
#[derive(Clone, Debug, PartialEq)]
pub struct StartedRound {
    /// Round id.
    pub round_id: RoundId,
    /// Start timestamp.
    pub started_at: DateTime<Utc>,
    /// Record to persist.
    pub record: RoundRecord,
}

/// Everything revealed and written when a round ends.
#[derive(Clone, Debug)]
pub struct CrashReport {
    /// Round id.
    pub round_id: RoundId,
    /// Hidden crash point, now public.
    pub crash_point: Multiplier,
    /// Tick value that ended the round.
    pub final_multiplier: Multiplier,
    /// Revealed seed.
    pub seed: Seed,
    /// Proof data for verifiers.
    pub proof: CrashProof,
    /// Record to persist.
    pub record: RoundRecord,
    /// Cash-outs made while force-closing a waiting round.
    pub refunds: Vec<Settlement>,
    /// Bet resolutions to persist.
    pub writes: LedgerWrites,
    /// Ended by `force_crash` rather than by reaching the crash point.
    pub forced: bool,
}

/// Result of one tick.
#[derive(Clone, Debug)]
pub enum TickOutcome {
    /// Multiplier still below the crash point.
    Update {
        /// Round id.
        round_id: RoundId,
        /// Current multiplier.
        multiplier: Multiplier,
        /// Milliseconds since start.
        elapsed_ms: u64,
    },
    /// Round crashed on this tick.
    Crashed(Box<CrashReport>),
}

// =============================================================================
// SCHEDULER
// =============================================================================

struct ActiveRound {
    round: Round,
    ledger: BetLedger,
    confirmed: bool,
    started: Option<Duration>,
    multiplier: Multiplier,
    elapsed_ms: u64,
}

/// Owns the active round, its ledger and the authoritative multiplier.
pub struct RoundScheduler {
    config: SchedulerConfig,
    fairness: FairnessEngine,
    wallet: Arc<dyn Wallet>,
    next_round_id: RoundId,
    active: Option<ActiveRound>,
    last_crash: Option<Multiplier>,
    fatal: Option<FairnessError>,
}

impl RoundScheduler {
    /// Create a scheduler whose first round is `next_round_id`.
    pub fn new(
        config: SchedulerConfig,
        fairness: FairnessEngine,
        wallet: Arc<dyn Wallet>,
        next_round_id: RoundId,
    ) -> Self {
        Self {
            config,
            fairness,
            wallet,
            next_round_id: next_round_id.max(1),
            active: None,
            last_crash: None,
            fatal: None,
        }
    }

    /// Timing configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Id the next opened round will get.
    pub fn next_round_id(&self) -> RoundId {
        self.next_round_id
    }

    /// Active round, if any.
    pub fn round(&self) -> Option<&Round> {
        self.active.as_ref().map(|a| &a.round)
    }

    /// Phase of the active round.
    pub fn phase(&self) -> Option<RoundPhase> {
        self.active.as_ref().map(|a| a.round.phase)
    }

    /// Whether a published round is still waiting or running.
    pub fn has_open_round(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.confirmed && a.round.phase != RoundPhase::Crashed)
    }

    /// Last computed multiplier of the active round.
    pub fn current_multiplier(&self) -> Multiplier {
        self.active.as_ref().map(|a| a.multiplier).unwrap_or(Multiplier::ONE)
    }

    /// Ledger of the active round.
    pub fn ledger(&self) -> Option<&BetLedger> {
        self.active.as_ref().map(|a| &a.ledger)
    }

    /// Set once the fairness engine has failed; no round opens after that.
    pub fn fatal_error(&self) -> Option<&FairnessError> {
        self.fatal.as_ref()
    }

    /// Prepare the next round and return its record for persistence.
    ///
    /// Nothing is published until [`confirm_open`](Self::confirm_open). If
    /// persisting fails, calling this again returns the same pending round.
    pub fn open_round(&mut self, now: DateTime<Utc>) -> Result<RoundRecord, RoundError> {
        if let Some(err) = &self.fatal {
            return Err(RoundError::FairnessUnavailable(err.clone()));
        }
        if let Some(active) = &self.active {
            if !active.confirmed {
                debug!(round_id = active.round.id, "reusing pending round");
                return Ok(active.round.to_record());
            }
            if active.round.phase != RoundPhase::Crashed {
                return Err(RoundError::RoundInProgress(active.round.id));
            }
        }

        let round_id = self.next_round_id;
        let fairness = match self.fairness.generate(round_id) {
            Ok(f) => f,
            Err(e) => {
                error!(round_id, error = %e, "fairness engine failed, refusing to open rounds");
                self.fatal = Some(e.clone());
                return Err(RoundError::from(e));
            }
        };

        let round = Round::open(fairness, now);
        let record = round.to_record();
        self.active = Some(ActiveRound {
            ledger: BetLedger::new(round_id, self.wallet.clone(), self.config.wallet_timeout),
            round,
            confirmed: false,
            started: None,
            multiplier: Multiplier::ONE,
            elapsed_ms: 0,
        });
        Ok(record)
    }

    /// Publish the pending round: the commitment goes out and bets open.
    pub fn confirm_open(&mut self) -> Result<OpenedRound, RoundError> {
        let active = self.active.as_mut().ok_or(RoundError::RoundNotAcceptingBets)?;
        if active.confirmed {
            return Err(RoundError::RoundInProgress(active.round.id));
        }
        active.confirmed = true;
        self.next_round_id = active.round.id + 1;
        info!(round_id = active.round.id, commit = %active.round.commit_hash, "round opened");
        Ok(OpenedRound {
            round_id: active.round.id,
            commit_hash: active.round.commit_hash.clone(),
            wait: self.config.wait,
        })
    }

    /// Close the betting window and start the multiplier.
    pub fn start(&mut self, clock_now: Duration, now: DateTime<Utc>) -> Result<StartedRound, RoundError> {
        let active = self.active.as_mut().ok_or(RoundError::RoundNotAcceptingBets)?;
        if !active.confirmed || active.round.phase != RoundPhase::Waiting {
            return Err(RoundError::RoundInProgress(active.round.id));
        }
        active.round.phase = RoundPhase::Running;
        active.round.started_at = Some(now);
        active.started = Some(clock_now);
        active.multiplier = Multiplier::ONE;
        active.elapsed_ms = 0;
        info!(round_id = active.round.id, bets = active.ledger.bets().count(), "round started");
        Ok(StartedRound { round_id: active.round.id, started_at: now, record: active.round.to_record() })
    }

    /// Evaluate one tick. The first tick at or above the crash point ends the
    /// round with that tick's value. Ticks after the crash are rejected.
    pub async fn tick(&mut self, clock_now: Duration, now: DateTime<Utc>) -> Result<TickOutcome, RoundError> {
        let growth = self.config.growth_per_ms;
        let active = self.active.as_mut().ok_or(RoundError::RoundNotRunning)?;
        if active.round.phase != RoundPhase::Running {
            return Err(RoundError::RoundNotRunning);
        }
        let started = active.started.ok_or(RoundError::RoundNotRunning)?;

        let elapsed_ms = u64::try_from(clock_now.saturating_sub(started).as_millis()).unwrap_or(u64::MAX);
        let multiplier = multiplier_at(elapsed_ms, growth).max(active.multiplier);
        active.multiplier = multiplier;
        active.elapsed_ms = elapsed_ms;

        if multiplier >= active.round.crash_point() {
            let report = self.crash(multiplier, now, false, Vec::new(), LedgerWrites::default()).await?;
            return Ok(TickOutcome::Crashed(Box::new(report)));
        }
        Ok(TickOutcome::Update { round_id: active.round.id, multiplier, elapsed_ms })
    }

    /// End the active round immediately at its last multiplier.
    ///
    /// A running round keeps its cash-outs and every other bet is lost. A
    /// waiting round is started and every stake cashed out at 1.00x.
    pub async fn force_crash(&mut self, clock_now: Duration, now: DateTime<Utc>) -> Result<CrashReport, RoundError> {
        let phase = self.phase().ok_or(RoundError::RoundNotRunning)?;
        let mut refunds = Vec::new();
        let mut writes = LedgerWrites::default();
        match phase {
            RoundPhase::Crashed => return Err(RoundError::RoundNotRunning),
            RoundPhase::Waiting => {
                self.start(clock_now, now)?;
                let users: Vec<UserId> = self
                    .ledger()
                    .map(|l| l.bets().map(|b| b.user_id).collect())
                    .unwrap_or_default();
                for user_id in users {
                    match self.cash_out(&user_id, now).await {
                        Ok((settlement, refund_writes)) => {
                            refunds.push(settlement);
                            writes.extend(refund_writes);
                        }
                        Err(e) => warn!(user = %user_id, error = %e, "refund failed"),
                    }
                }
            }
            RoundPhase::Running => {}
        }
        let multiplier = self.current_multiplier();
        warn!(round_id = ?self.round().map(|r| r.id), %multiplier, "force-closing round");
        self.crash(multiplier, now, true, refunds, writes).await
    }

    async fn crash(
        &mut self,
        final_multiplier: Multiplier,
        now: DateTime<Utc>,
        forced: bool,
        refunds: Vec<Settlement>,
        mut writes: LedgerWrites,
    ) -> Result<CrashReport, RoundError> {
        let active = self.active.as_mut().ok_or(RoundError::RoundNotRunning)?;
        active.round.phase = RoundPhase::Crashed;
        active.round.ended_at = Some(now);
        active.round.final_multiplier = Some(final_multiplier);

        writes.extend(active.ledger.settle(now).await);

        let round = &active.round;
        let crash_point = round.crash_point();
        let seed = round.revealed_seed().ok_or(RoundError::RoundNotRunning)?;
        if let Err(e) = verify_reveal(&seed.to_hex(), round.id, &round.commit_hash, crash_point) {
            error!(round_id = round.id, error = %e, "revealed round does not verify");
            self.fatal = Some(e.clone());
            return Err(RoundError::from(e));
        }

        self.last_crash = Some(crash_point);
        info!(round_id = round.id, %crash_point, %final_multiplier, forced, "round crashed");
        Ok(CrashReport {
            round_id: round.id,
            crash_point,
            final_multiplier,
            seed,
            proof: proof(&seed, round.id),
            record: round.to_record(),
            refunds,
            writes,
            forced,
        })
    }

    /// Place a bet in the open betting window.
    pub async fn place_bet(&mut self, request: BetRequest, now: DateTime<Utc>) -> Result<(Bet, LedgerWrites), RoundError> {
        let active = self.active.as_mut().ok_or(RoundError::RoundNotAcceptingBets)?;
        if !active.confirmed {
            return Err(RoundError::RoundNotAcceptingBets);
        }
        active.ledger.place_bet(&active.round, request, now).await
    }

    /// Cash out at the last computed multiplier.
    pub async fn cash_out(&mut self, user_id: &UserId, now: DateTime<Utc>) -> Result<(Settlement, LedgerWrites), RoundError> {
        let active = self.active.as_mut().ok_or(RoundError::RoundNotRunning)?;
        active.ledger.cash_out(&active.round, user_id, active.multiplier, now).await
    }

    /// Public view of the active round.
    pub fn snapshot(&self) -> RoundSnapshot {
        match self.active.as_ref().filter(|a| a.confirmed) {
            Some(active) => RoundSnapshot {
                round_id: Some(active.round.id),
                phase: Some(active.round.phase),
                commit_hash: Some(active.round.commit_hash.clone()),
                multiplier: active.multiplier,
                elapsed_ms: active.elapsed_ms,
                started_at: active.round.started_at,
                bets: active.ledger.bets().cloned().collect(),
                last_crash: self.last_crash,
            },
            None => RoundSnapshot {
                round_id: None,
                phase: None,
                commit_hash: None,
                multiplier: Multiplier::ONE,
                elapsed_ms: 0,
                started_at: None,
                bets: Vec::new(),
                last_crash: self.last_crash,
            },
        }
    }
}

impl std::fmt::Debug for RoundScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoundScheduler")
            .field("next_round_id", &self.next_round_id)
            .field("phase", &self.phase())
            .field("last_crash", &self.last_crash)
            .finish_non_exhaustive()
    }
}
