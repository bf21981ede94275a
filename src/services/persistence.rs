//! Persistence
//!
//! Durable storage for rounds, bets and ledger entries, plus the
//! write-behind queue that keeps non-critical writes off the round loop.
//!
//! ```text
//! ┌──────────────┐  awaited + retried   ┌──────────────────┐
//! │ RoundRuntime │ ───────────────────▶ │                  │
//! │              │  create              │ PersistenceStore │
//! │              │                      │                  │
//! │              │  enqueue / write     │                  │
//! │              │ ──▶ PersistenceQueue ▶│                  │
//! └──────────────┘  bets, txs, rounds   └──────────────────┘
//! ```
//!
//! Every update to an existing round goes through the queue, so a slow
//! "started" write can never land after the "crashed" one.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::round::state::{Bet, RoundId, RoundPhase, RoundRecord, Transaction, UserId};

// =============================================================================
// ERRORS
// =============================================================================

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// Backend unreachable or write rejected. Retryable.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A round with this id already exists.
    #[error("round {0} already exists")]
    RoundExists(RoundId),

    /// No round with this id.
    #[error("round {0} not found")]
    RoundNotFound(RoundId),

    /// The user already has a bet in this round.
    #[error("user {user_id} already has a bet in round {round_id}")]
    DuplicateBet {
        /// Round.
        round_id: RoundId,
        /// User.
        user_id: UserId,
    },

    /// No bet for this user in this round.
    #[error("no bet for user {user_id} in round {round_id}")]
    BetNotFound {
        /// Round.
        round_id: RoundId,
        /// User.
        user_id: UserId,
    },

    /// A different entry already uses this transaction hash.
    #[error("transaction {0} already recorded")]
    DuplicateTransaction(String),
}

impl StoreError {
    /// Whether a retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

// =============================================================================
// STORE
// =============================================================================

/// Durable storage.
///
/// `append_bet` is conditional: at most one bet per `(round, user)`.
/// Transactions are write-once by hash. Re-applying an identical write is a
/// no-op so callers can retry freely.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Insert a new round.
    async fn create_round(&self, round: &RoundRecord) -> Result<(), StoreError>;

    /// Overwrite an existing round.
    async fn update_round(&self, round: &RoundRecord) -> Result<(), StoreError>;

    /// Insert a bet if the user has none in that round.
    async fn append_bet(&self, bet: &Bet) -> Result<(), StoreError>;

    /// Overwrite an existing bet.
    async fn update_bet(&self, bet: &Bet) -> Result<(), StoreError>;

    /// Insert a ledger entry.
    async fn append_transaction(&self, tx: &Transaction) -> Result<(), StoreError>;

    /// Highest round id ever created.
    async fn find_latest_round_id(&self) -> Result<Option<RoundId>, StoreError>;

    /// Load a round. Seed and crash point of a non-crashed round are blanked.
    async fn find_round(&self, round_id: RoundId) -> Result<Option<RoundRecord>, StoreError>;

    /// Most recent crashed rounds, newest first.
    async fn list_crashed_rounds(&self, limit: usize) -> Result<Vec<RoundRecord>, StoreError>;
}

/// In-process store.
///
/// `fail_next_writes` injects transient write failures for tests.
#[derive(Default)]
pub struct InMemoryStore {
    rounds: RwLock<BTreeMap<RoundId, RoundRecord>>,
    bets: RwLock<BTreeMap<(RoundId, UserId), Bet>>,
    transactions: RwLock<Vec<Transaction>>,
    tx_hashes: RwLock<BTreeSet<String>>,
    failing_writes: AtomicU32,
}

impl InMemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail with `Unavailable`.
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    fn check_write(&self) -> Result<(), StoreError> {
        let consumed = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match consumed {
            Ok(_) => Err(StoreError::Unavailable("injected failure".into())),
            Err(_) => Ok(()),
        }
    }

    /// All bets of a round.
    pub async fn bets_for_round(&self, round_id: RoundId) -> Vec<Bet> {
        self.bets
            .read()
            .await
            .range((round_id, UserId::new([0; 16]))..=(round_id, UserId::new([0xff; 16])))
            .map(|(_, bet)| bet.clone())
            .collect()
    }

    /// All ledger entries of a round, in insertion order.
    pub async fn transactions_for_round(&self, round_id: RoundId) -> Vec<Transaction> {
        self.transactions
            .read()
            .await
            .iter()
            .filter(|tx| tx.round_id == round_id)
            .cloned()
            .collect()
    }

    /// Full record including secrets, for tests and audits.
    pub async fn raw_round(&self, round_id: RoundId) -> Option<RoundRecord> {
        self.rounds.read().await.get(&round_id).cloned()
    }
}

fn redact(mut record: RoundRecord) -> RoundRecord {
    if record.phase != RoundPhase::Crashed {
        record.seed.clear();
        record.crash_point = None;
    }
    record
}

#[async_trait]
impl PersistenceStore for InMemoryStore {
    async fn create_round(&self, round: &RoundRecord) -> Result<(), StoreError> {
        self.check_write()?;
        let mut rounds = self.rounds.write().await;
        match rounds.get(&round.id) {
            Some(existing) if existing == round => Ok(()),
            Some(_) => Err(StoreError::RoundExists(round.id)),
            None => {
                rounds.insert(round.id, round.clone());
                Ok(())
            }
        }
    }

    async fn update_round(&self, round: &RoundRecord) -> Result<(), StoreError> {
        self.check_write()?;
        let mut rounds = self.rounds.write().await;
        let slot = rounds.get_mut(&round.id).ok_or(StoreError::RoundNotFound(round.id))?;
        *slot = round.clone();
        Ok(())
    }

    async fn append_bet(&self, bet: &Bet) -> Result<(), StoreError> {
        self.check_write()?;
        let mut bets = self.bets.write().await;
        let key = (bet.round_id, bet.user_id);
        match bets.get(&key) {
            Some(existing) if existing == bet => Ok(()),
            Some(_) => Err(StoreError::DuplicateBet { round_id: bet.round_id, user_id: bet.user_id }),
            None => {
                bets.insert(key, bet.clone());
                Ok(())
            }
        }
    }

    async fn update_bet(&self, bet: &Bet) -> Result<(), StoreError> {
        self.check_write()?;
        let mut bets = self.bets.write().await;
        let slot = bets
            .get_mut(&(bet.round_id, bet.user_id))
            .ok_or(StoreError::BetNotFound { round_id: bet.round_id, user_id: bet.user_id })?;
        *slot = bet.clone();
        Ok(())
    }

    async fn append_transaction(&self, tx: &Transaction) -> Result<(), StoreError> {
        self.check_write()?;
        let mut hashes = self.tx_hashes.write().await;
        let mut transactions = self.transactions.write().await;
        if hashes.contains(&tx.transaction_hash) {
            let identical = transactions.iter().any(|t| t == tx);
            return if identical {
                Ok(())
            } else {
                Err(StoreError::DuplicateTransaction(tx.transaction_hash.clone()))
            };
        }
        hashes.insert(tx.transaction_hash.clone());
        transactions.push(tx.clone());
        Ok(())
    }

    async fn find_latest_round_id(&self) -> Result<Option<RoundId>, StoreError> {
        Ok(self.rounds.read().await.keys().next_back().copied())
    }

    async fn find_round(&self, round_id: RoundId) -> Result<Option<RoundRecord>, StoreError> {
        Ok(self.rounds.read().await.get(&round_id).cloned().map(redact))
    }

    async fn list_crashed_rounds(&self, limit: usize) -> Result<Vec<RoundRecord>, StoreError> {
        Ok(self
            .rounds
            .read()
            .await
            .values()
            .rev()
            .filter(|r| r.phase == RoundPhase::Crashed)
            .take(limit)
            .cloned()
            .collect())
    }
}

// =============================================================================
// RETRY
// =============================================================================

/// Retry policy for store writes.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles each attempt.
    pub initial_backoff: Duration,
    /// Upper bound on the delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// Run a store write, retrying transient failures.
pub async fn with_retry<F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<(), StoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), StoreError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(what, attempt, ?delay, error = %e, "store write failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// =============================================================================
// WRITE-BEHIND QUEUE
// =============================================================================

/// A deferred store write.
#[derive(Clone, Debug)]
pub enum PersistOp {
    /// Round state change.
    UpdateRound(RoundRecord),
    /// New bet.
    AppendBet(Bet),
    /// Bet resolution.
    UpdateBet(Bet),
    /// Ledger entry.
    AppendTransaction(Transaction),
}

impl PersistOp {
    fn label(&self) -> &'static str {
        match self {
            PersistOp::UpdateRound(_) => "update_round",
            PersistOp::AppendBet(_) => "append_bet",
            PersistOp::UpdateBet(_) => "update_bet",
            PersistOp::AppendTransaction(_) => "append_transaction",
        }
    }

    async fn apply(&self, store: &dyn PersistenceStore) -> Result<(), StoreError> {
        match self {
            PersistOp::UpdateRound(r) => store.update_round(r).await,
            PersistOp::AppendBet(b) => store.append_bet(b).await,
            PersistOp::UpdateBet(b) => store.update_bet(b).await,
            PersistOp::AppendTransaction(t) => store.append_transaction(t).await,
        }
    }
}

/// Ordered write-behind queue drained by a background task.
///
/// Writes are applied in enqueue order. Dropping every sender lets the task
/// drain what is left and exit; await the task handle to flush.
#[derive(Clone)]
pub struct PersistenceQueue {
    tx: mpsc::UnboundedSender<Queued>,
}

struct Queued {
    op: PersistOp,
    ack: Option<oneshot::Sender<Result<(), StoreError>>>,
}

impl PersistenceQueue {
    /// Spawn the drain task.
    pub fn spawn(store: Arc<dyn PersistenceStore>, policy: RetryPolicy) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Queued>();
        let handle = tokio::spawn(async move {
            while let Some(Queued { op, ack }) = rx.recv().await {
                let result = with_retry(&policy, op.label(), || op.apply(store.as_ref())).await;
                match &result {
                    Ok(()) => debug!(op = op.label(), "persisted"),
                    Err(e) => error!(op = op.label(), error = %e, "dropping write after retries"),
                }
                if let Some(ack) = ack {
                    let _ = ack.send(result);
                }
            }
            debug!("persistence queue drained");
        });
        (Self { tx }, handle)
    }

    /// Queue a write.
    pub fn enqueue(&self, op: PersistOp) {
        if self.tx.send(Queued { op, ack: None }).is_err() {
            error!("persistence queue closed, write lost");
        }
    }

    /// Queue a write and wait until it, and everything queued before it,
    /// has been applied.
    pub async fn write(&self, op: PersistOp) -> Result<(), StoreError> {
        let closed = || StoreError::Unavailable("persistence queue closed".into());
        let (ack, done) = oneshot::channel();
        self.tx.send(Queued { op, ack: Some(ack) }).map_err(|_| closed())?;
        done.await.map_err(|_| closed())?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::money::{CryptoAmount, Multiplier, Usd};
    use crate::round::state::{transaction_hash, BetStatus, Currency, TransactionKind};
    use chrono::Utc;

    fn record(id: RoundId, phase: RoundPhase) -> RoundRecord {
        RoundRecord {
            id,
            seed: "ab".repeat(32),
            commit_hash: "cd".repeat(32),
            crash_point: Some(Multiplier(250)),
            phase,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            final_multiplier: None,
        }
    }

    fn bet(round_id: RoundId, user: u8) -> Bet {
        Bet {
            round_id,
            user_id: UserId::new([user; 16]),
            username: format!("user{user}"),
            usd_amount: Usd::from_dollars(10),
            crypto_amount: CryptoAmount(1_000),
            currency: Currency::Btc,
            price_at_bet: 30_000.0,
            status: BetStatus::Active,
            cashout_multiplier: None,
            usd_payout: None,
            crypto_payout: None,
            placed_at: Utc::now(),
        }
    }

    fn tx(round_id: RoundId, user: u8) -> Transaction {
        let user_id = UserId::new([user; 16]);
        Transaction {
            user_id,
            round_id,
            usd_amount: Usd::from_dollars(10),
            crypto_amount: CryptoAmount(1_000),
            currency: Currency::Btc,
            price_at_time: 30_000.0,
            kind: TransactionKind::Bet,
            multiplier: None,
            transaction_hash: transaction_hash(TransactionKind::Bet, round_id, &user_id),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_latest_round_id() {
        let store = InMemoryStore::new();
        assert_eq!(store.find_latest_round_id().await.unwrap(), None);

        store.create_round(&record(3, RoundPhase::Crashed)).await.unwrap();
        store.create_round(&record(7, RoundPhase::Waiting)).await.unwrap();
        assert_eq!(store.find_latest_round_id().await.unwrap(), Some(7));

        assert!(matches!(
            store.create_round(&record(7, RoundPhase::Running)).await,
            Err(StoreError::RoundExists(7))
        ));
    }

    #[tokio::test]
    async fn test_seed_redacted_until_crashed() {
        let store = InMemoryStore::new();
        let mut r = record(1, RoundPhase::Waiting);
        store.create_round(&r).await.unwrap();
        let hidden = store.find_round(1).await.unwrap().unwrap();
        assert!(hidden.seed.is_empty());
        assert_eq!(hidden.crash_point, None);

        r.phase = RoundPhase::Running;
        store.update_round(&r).await.unwrap();
        let hidden = store.find_round(1).await.unwrap().unwrap();
        assert!(hidden.seed.is_empty());
        assert_eq!(hidden.crash_point, None);
        // The stored record keeps both.
        assert_eq!(store.raw_round(1).await.unwrap().crash_point, Some(Multiplier(250)));

        r.phase = RoundPhase::Crashed;
        store.update_round(&r).await.unwrap();
        let revealed = store.find_round(1).await.unwrap().unwrap();
        assert_eq!(revealed.seed, "ab".repeat(32));
        assert_eq!(revealed.crash_point, Some(Multiplier(250)));
    }

    #[tokio::test]
    async fn test_conditional_bet_append() {
        let store = InMemoryStore::new();
        let b = bet(1, 1);
        store.append_bet(&b).await.unwrap();
        store.append_bet(&b).await.unwrap();

        let mut other = b.clone();
        other.usd_amount = Usd::from_dollars(20);
        assert!(matches!(store.append_bet(&other).await, Err(StoreError::DuplicateBet { round_id: 1, .. })));

        store.append_bet(&bet(2, 1)).await.unwrap();
        assert_eq!(store.bets_for_round(1).await.len(), 1);
    }

    #[tokio::test]
    async fn test_transactions_write_once() {
        let store = InMemoryStore::new();
        let t = tx(1, 1);
        store.append_transaction(&t).await.unwrap();
        store.append_transaction(&t).await.unwrap();

        let mut changed = t.clone();
        changed.usd_amount = Usd::from_dollars(99);
        assert!(matches!(
            store.append_transaction(&changed).await,
            Err(StoreError::DuplicateTransaction(_))
        ));
        assert_eq!(store.transactions_for_round(1).await.len(), 1);
    }

    #[tokio::test]
    async fn test_list_crashed_newest_first() {
        let store = InMemoryStore::new();
        for id in 1..=4 {
            store.create_round(&record(id, RoundPhase::Crashed)).await.unwrap();
        }
        store.create_round(&record(5, RoundPhase::Running)).await.unwrap();

        let ids: Vec<_> = store.list_crashed_rounds(2).await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![4, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient_failure() {
        let store = InMemoryStore::new();
        store.fail_next_writes(2);

        let r = record(1, RoundPhase::Waiting);
        with_retry(&RetryPolicy::default(), "create_round", || store.create_round(&r))
            .await
            .unwrap();
        assert!(store.raw_round(1).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up() {
        let store = InMemoryStore::new();
        store.fail_next_writes(10);

        let policy = RetryPolicy { max_attempts: 3, ..RetryPolicy::default() };
        let r = record(1, RoundPhase::Waiting);
        let result = with_retry(&policy, "create_round", || store.create_round(&r)).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(40), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_applies_in_order() {
        let store = Arc::new(InMemoryStore::new());
        store.fail_next_writes(1);
        let (queue, handle) = PersistenceQueue::spawn(store.clone(), RetryPolicy::default());

        let mut b = bet(1, 1);
        queue.enqueue(PersistOp::AppendBet(b.clone()));
        b.status = BetStatus::Lost;
        queue.enqueue(PersistOp::UpdateBet(b.clone()));
        queue.enqueue(PersistOp::AppendTransaction(tx(1, 1)));
        drop(queue);
        handle.await.unwrap();

        assert_eq!(store.bets_for_round(1).await, vec![b]);
        assert_eq!(store.transactions_for_round(1).await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_waits_for_earlier_round_updates() {
        let store = Arc::new(InMemoryStore::new());
        let mut r = record(1, RoundPhase::Waiting);
        store.create_round(&r).await.unwrap();
        store.fail_next_writes(2);
        let (queue, handle) = PersistenceQueue::spawn(store.clone(), RetryPolicy::default());

        r.phase = RoundPhase::Running;
        queue.enqueue(PersistOp::UpdateRound(r.clone()));
        r.phase = RoundPhase::Crashed;
        queue.write(PersistOp::UpdateRound(r.clone())).await.unwrap();
        assert_eq!(store.raw_round(1).await.unwrap().phase, RoundPhase::Crashed);

        drop(queue);
        handle.await.unwrap();
        assert_eq!(store.raw_round(1).await.unwrap().phase, RoundPhase::Crashed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_reports_exhausted_retries() {
        let store = Arc::new(InMemoryStore::new());
        store.create_round(&record(1, RoundPhase::Waiting)).await.unwrap();
        store.fail_next_writes(10);
        let policy = RetryPolicy { max_attempts: 2, ..RetryPolicy::default() };
        let (queue, _handle) = PersistenceQueue::spawn(store, policy);

        let result = queue.write(PersistOp::UpdateRound(record(1, RoundPhase::Crashed))).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
