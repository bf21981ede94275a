//! Round Runtime
//!
//! Single tokio task that owns the [`RoundScheduler`]. Bets, cash-outs and
//! state requests arrive as commands on one channel and timer deadlines
//! come from the injected [`Clock`]; the loop handles one at a time, which
//! is the serialization point for everything that touches the active round.
//!
//! ```text
//!  connections ──RoundHandle──▶ mpsc ──┐
//!                                     ▼
//!  Clock ── deadline ──────────▶ RoundRuntime ──▶ BroadcastChannel
//!                                     │
//!                       awaited ◀─────┴─────▶ PersistenceQueue
//!                        (open record)     (bets, txs, round updates)
//! ```
//!
//! Commands are handled first, but never more than
//! [`MAX_COMMANDS_PER_DEADLINE`] in a row while a deadline is due, so a busy
//! command channel cannot hold back ticks or the crash.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::core::clock::Clock;
use crate::fairness::{FairnessEngine, FairnessError};
use crate::network::broadcast::BroadcastChannel;
use crate::round::error::RoundError;
use crate::round::events::RoundEvent;
use crate::round::ledger::{BetRequest, LedgerWrites, Settlement};
use crate::round::scheduler::{CrashReport, RoundScheduler, SchedulerConfig, TickOutcome};
use crate::round::state::{Bet, RoundPhase, RoundSnapshot, UserId};
use crate::services::persistence::{
    with_retry, PersistOp, PersistenceQueue, PersistenceStore, RetryPolicy, StoreError,
};

/// Commands handled back to back before a due deadline is checked.
pub const MAX_COMMANDS_PER_DEADLINE: usize = 32;
use crate::services::wallet::Wallet;

// =============================================================================
// CONFIG & ERRORS
// =============================================================================

/// Runtime configuration.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Lifecycle timing.
    pub scheduler: SchedulerConfig,
    /// Retry policy for awaited store writes and the write-behind queue.
    pub retry: RetryPolicy,
    /// Command channel capacity.
    pub command_buffer: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            retry: RetryPolicy::default(),
            command_buffer: 1024,
        }
    }
}

impl RuntimeConfig {
    /// Load from environment variables (`CRASH_*`).
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            scheduler: SchedulerConfig::from_env(),
            retry: RetryPolicy {
                max_attempts: std::env::var("CRASH_STORE_RETRIES")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .filter(|n: &u32| *n > 0)
                    .unwrap_or(defaults.retry.max_attempts),
                ..defaults.retry
            },
            command_buffer: std::env::var("CRASH_COMMAND_BUFFER")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.command_buffer),
        }
    }
}

/// Runtime errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Could not read the latest round id at startup.
    #[error("failed to load round history: {0}")]
    Store(#[from] StoreError),

    /// The fairness engine failed; the runtime stopped opening rounds.
    #[error("fairness engine failed: {0}")]
    Fairness(FairnessError),
}

// =============================================================================
// HANDLE
// =============================================================================

enum Command {
    PlaceBet {
        request: BetRequest,
        reply: oneshot::Sender<Result<Bet, RoundError>>,
    },
    CashOut {
        user_id: UserId,
        reply: oneshot::Sender<Result<Settlement, RoundError>>,
    },
    GetState {
        reply: oneshot::Sender<RoundSnapshot>,
    },
    Shutdown,
}

/// Cloneable client of the round runtime.
#[derive(Clone, Debug)]
pub struct RoundHandle {
    tx: mpsc::Sender<Command>,
}

impl RoundHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, RoundError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(build(reply)).await.map_err(|_| RoundError::EngineStopped)?;
        rx.await.map_err(|_| RoundError::EngineStopped)
    }

    /// Place a bet in the current betting window.
    pub async fn place_bet(&self, request: BetRequest) -> Result<Bet, RoundError> {
        self.request(|reply| Command::PlaceBet { request, reply }).await?
    }

    /// Cash out the caller's bet at the current multiplier.
    pub async fn cash_out(&self, user_id: UserId) -> Result<Settlement, RoundError> {
        self.request(|reply| Command::CashOut { user_id, reply }).await?
    }

    /// Snapshot of the active round.
    pub async fn get_state(&self) -> Result<RoundSnapshot, RoundError> {
        self.request(|reply| Command::GetState { reply }).await
    }

    /// Ask the runtime to settle the active round and stop.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }

    /// True once the runtime has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// =============================================================================
// RUNTIME
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq)]
enum Stage {
    Opening { at: Duration },
    Waiting { until: Duration },
    Running { next_tick: Duration },
    Cooldown { until: Duration },
    Halted,
}

impl Stage {
    fn deadline(self) -> Option<Duration> {
        match self {
            Stage::Opening { at } => Some(at),
            Stage::Waiting { until } | Stage::Cooldown { until } => Some(until),
            Stage::Running { next_tick } => Some(next_tick),
            Stage::Halted => None,
        }
    }
}

/// The round loop.
pub struct RoundRuntime {
    config: RuntimeConfig,
    scheduler: RoundScheduler,
    clock: Arc<dyn Clock>,
    store: Arc<dyn PersistenceStore>,
    queue: PersistenceQueue,
    queue_task: JoinHandle<()>,
    events: Arc<BroadcastChannel>,
    /// Why the pending round is not open yet, while its create is failing.
    open_failure: Option<RoundError>,
}

impl RoundRuntime {
    /// Build a runtime that resumes after the latest stored round.
    pub async fn new(
        config: RuntimeConfig,
        fairness: FairnessEngine,
        wallet: Arc<dyn Wallet>,
        store: Arc<dyn PersistenceStore>,
        clock: Arc<dyn Clock>,
        events: Arc<BroadcastChannel>,
    ) -> Result<Self, RuntimeError> {
        let latest = store.find_latest_round_id().await?;
        let next_round_id = latest.map_or(1, |id| id + 1);
        info!(next_round_id, "resuming round sequence");

        let scheduler = RoundScheduler::new(config.scheduler.clone(), fairness, wallet, next_round_id);
        let (queue, queue_task) = PersistenceQueue::spawn(store.clone(), config.retry.clone());
        Ok(Self { config, scheduler, clock, store, queue, queue_task, events, open_failure: None })
    }

    /// Spawn the loop on the current tokio runtime.
    pub fn spawn(self) -> (RoundHandle, JoinHandle<Result<(), RuntimeError>>) {
        let (tx, rx) = mpsc::channel(self.config.command_buffer.max(1));
        let task = tokio::spawn(self.run(rx));
        (RoundHandle { tx }, task)
    }

    /// Drive rounds until shutdown or until every handle is dropped.
    #[instrument(skip_all, name = "round_runtime")]
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) -> Result<(), RuntimeError> {
        let clock = self.clock.clone();
        let mut stage = Stage::Opening { at: clock.now() };
        let mut burst = 0;

        loop {
            let deadline = stage.deadline();
            if burst >= MAX_COMMANDS_PER_DEADLINE {
                burst = 0;
                if deadline.is_some_and(|d| clock.now() >= d) {
                    stage = self.advance(stage).await;
                    continue;
                }
            }

            tokio::select! {
                biased;

                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => {
                        burst += 1;
                        self.handle_command(cmd).await;
                    }
                },

                _ = async {
                    match deadline {
                        Some(d) => clock.sleep_until(d).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    burst = 0;
                    stage = self.advance(stage).await;
                }
            }
        }

        self.shutdown().await
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::PlaceBet { request, reply } => {
                let result = self.place_bet(request).await;
                let _ = reply.send(result);
            }
            Command::CashOut { user_id, reply } => {
                let result = self.cash_out(&user_id).await;
                let _ = reply.send(result);
            }
            Command::GetState { reply } => {
                let _ = reply.send(self.scheduler.snapshot());
            }
            Command::Shutdown => {}
        }
    }

    async fn place_bet(&mut self, request: BetRequest) -> Result<Bet, RoundError> {
        if let Some(err) = self.scheduler.fatal_error() {
            return Err(RoundError::FairnessUnavailable(err.clone()));
        }
        if let Some(err) = &self.open_failure {
            return Err(err.clone());
        }
        let (bet, writes) = self.scheduler.place_bet(request, self.clock.wall_time()).await?;
        self.persist(writes);
        self.events.publish(RoundEvent::bet_placed(&bet));
        Ok(bet)
    }

    async fn cash_out(&mut self, user_id: &UserId) -> Result<Settlement, RoundError> {
        let (settlement, writes) = self.scheduler.cash_out(user_id, self.clock.wall_time()).await?;
        self.persist(writes);
        self.events.publish(RoundEvent::cashout(&settlement));
        Ok(settlement)
    }

    fn persist(&self, writes: LedgerWrites) {
        for bet in writes.new_bets {
            self.queue.enqueue(PersistOp::AppendBet(bet));
        }
        for bet in writes.updated_bets {
            self.queue.enqueue(PersistOp::UpdateBet(bet));
        }
        for tx in writes.transactions {
            self.queue.enqueue(PersistOp::AppendTransaction(tx));
        }
    }

    async fn advance(&mut self, stage: Stage) -> Stage {
        let now = self.clock.now();
        match stage {
            Stage::Opening { .. } => self.open_round(now).await,
            Stage::Waiting { .. } => match self.scheduler.start(now, self.clock.wall_time()) {
                Ok(started) => {
                    self.queue.enqueue(PersistOp::UpdateRound(started.record.clone()));
                    self.events.publish(RoundEvent::round_started(&started));
                    Stage::Running { next_tick: now + self.config.scheduler.tick }
                }
                Err(e) => {
                    error!(error = %e, "cannot start round");
                    self.force_close(now).await
                }
            },
            Stage::Running { next_tick } => match self.scheduler.tick(now, self.clock.wall_time()).await {
                Ok(TickOutcome::Update { round_id, multiplier, elapsed_ms }) => {
                    self.events.publish(RoundEvent::MultiplierUpdate {
                        round_id,
                        multiplier: multiplier.to_f64(),
                        elapsed_ms,
                    });
                    Stage::Running { next_tick: next_tick + self.config.scheduler.tick }
                }
                Ok(TickOutcome::Crashed(report)) => self.finish_round(*report).await,
                Err(e) => {
                    error!(error = %e, "tick failed, force-settling round");
                    self.force_close(now).await
                }
            },
            Stage::Cooldown { .. } => Stage::Opening { at: now },
            Stage::Halted => Stage::Halted,
        }
    }

    async fn open_round(&mut self, now: Duration) -> Stage {
        let record = match self.scheduler.open_round(self.clock.wall_time()) {
            Ok(record) => record,
            Err(RoundError::FairnessUnavailable(e)) => {
                error!(error = %e, "no further rounds will open");
                return Stage::Halted;
            }
            Err(e) => {
                error!(error = %e, "cannot open round");
                return Stage::Opening { at: now + self.config.scheduler.open_retry_backoff };
            }
        };

        let store = self.store.clone();
        if let Err(e) = with_retry(&self.config.retry, "create_round", || store.create_round(&record)).await {
            warn!(
                round_id = record.id,
                error = %e,
                backoff = ?self.config.scheduler.open_retry_backoff,
                "round not persisted, retrying later"
            );
            self.open_failure = Some(e.into());
            return Stage::Opening { at: now + self.config.scheduler.open_retry_backoff };
        }
        self.open_failure = None;

        match self.scheduler.confirm_open() {
            Ok(opened) => {
                self.events.publish(RoundEvent::new_round(&opened));
                Stage::Waiting { until: self.clock.now() + opened.wait }
            }
            Err(e) => {
                error!(error = %e, "cannot confirm round");
                Stage::Opening { at: now + self.config.scheduler.open_retry_backoff }
            }
        }
    }

    async fn force_close(&mut self, now: Duration) -> Stage {
        match self.scheduler.force_crash(now, self.clock.wall_time()).await {
            Ok(report) => self.finish_round(report).await,
            Err(RoundError::RoundNotRunning) => Stage::Cooldown { until: now + self.config.scheduler.cooldown },
            Err(e) => {
                error!(error = %e, "cannot settle round, halting");
                Stage::Halted
            }
        }
    }

    async fn finish_round(&mut self, report: CrashReport) -> Stage {
        let CrashReport { record, writes, refunds, .. } = &report;
        self.persist(writes.clone());

        // Queued behind the round's earlier updates so it is the last one applied.
        if let Err(e) = self.queue.write(PersistOp::UpdateRound(record.clone())).await {
            error!(round_id = record.id, error = %e, "crashed round not persisted");
        }

        for refund in refunds {
            self.events.publish(RoundEvent::cashout(refund));
        }
        self.events.publish(RoundEvent::round_crashed(&report));

        if let Some(err) = self.scheduler.fatal_error() {
            error!(error = %err, "fairness check failed, halting");
            return Stage::Halted;
        }
        Stage::Cooldown { until: self.clock.now() + self.config.scheduler.cooldown }
    }

    async fn shutdown(mut self) -> Result<(), RuntimeError> {
        info!("round runtime shutting down");
        let now = self.clock.now();
        if self.scheduler.has_open_round() {
            self.force_close(now).await;
        }

        let fatal = self.scheduler.fatal_error().cloned();
        let RoundRuntime { queue, queue_task, .. } = self;
        drop(queue);
        if let Err(e) = queue_task.await {
            error!(error = %e, "persistence queue task failed");
        }
        debug!("persistence queue flushed");

        match fatal {
            Some(e) => Err(RuntimeError::Fairness(e)),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for RoundRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoundRuntime").field("scheduler", &self.scheduler).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::money::{CryptoAmount, Usd};
    use crate::fairness::{DeterministicEntropy, EntropySource, Seed};
    use crate::network::broadcast::{Observed, Observer};
    use crate::round::state::{BetStatus, Currency, RoundRecord};
    use crate::services::persistence::InMemoryStore;
    use crate::services::wallet::InMemoryWallet;
    use chrono::Utc;

    const ALICE: UserId = UserId::new([1; 16]);

    fn config() -> RuntimeConfig {
        RuntimeConfig {
            scheduler: SchedulerConfig { growth_per_ms: 0.01, ..SchedulerConfig::default() },
            ..RuntimeConfig::default()
        }
    }

    async fn wallet() -> Arc<InMemoryWallet> {
        let wallet = Arc::new(InMemoryWallet::new());
        wallet.deposit(ALICE, Currency::Btc, CryptoAmount(100_000_000)).await;
        wallet
    }

    async fn start(
        store: Arc<dyn PersistenceStore>,
        wallet: Arc<InMemoryWallet>,
        entropy: Arc<dyn EntropySource>,
    ) -> (RoundHandle, JoinHandle<Result<(), RuntimeError>>, Observer) {
        start_with(config(), Arc::new(ManualClock::new()), store, wallet, entropy).await
    }

    async fn start_with(
        config: RuntimeConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn PersistenceStore>,
        wallet: Arc<InMemoryWallet>,
        entropy: Arc<dyn EntropySource>,
    ) -> (RoundHandle, JoinHandle<Result<(), RuntimeError>>, Observer) {
        let events = Arc::new(BroadcastChannel::new(100_000));
        let observer = events.subscribe();
        let runtime = RoundRuntime::new(config, FairnessEngine::new(entropy), wallet, store, clock, events)
        .await
        .unwrap();
        let (handle, task) = runtime.spawn();
        (handle, task, observer)
    }

    async fn next_event(observer: &mut Observer) -> RoundEvent {
        match observer.next().await {
            Some(Observed::Event(e)) => e.event,
            other => panic!("unexpected {other:?}"),
        }
    }

    fn bet(dollars: u64) -> BetRequest {
        BetRequest {
            user_id: ALICE,
            username: "alice".into(),
            usd_amount: Usd::from_dollars(dollars),
            currency: Currency::Btc,
            price: 50_000.0,
        }
    }

    #[tokio::test]
    async fn test_resumes_after_latest_round() {
        let store = Arc::new(InMemoryStore::new());
        store
            .create_round(&RoundRecord {
                id: 41,
                seed: String::new(),
                commit_hash: String::new(),
                crash_point: Some(crate::core::money::Multiplier(200)),
                phase: RoundPhase::Crashed,
                created_at: Utc::now(),
                started_at: None,
                ended_at: None,
                final_multiplier: None,
            })
            .await
            .unwrap();

        let (handle, task, mut observer) =
            start(store, wallet().await, Arc::new(DeterministicEntropy::new(1))).await;
        match next_event(&mut observer).await {
            RoundEvent::NewRound { round_id, .. } => assert_eq!(round_id, 42),
            other => panic!("unexpected {other:?}"),
        }
        handle.shutdown().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bet_then_crash_settles_and_persists() {
        let store = Arc::new(InMemoryStore::new());
        let wallet = wallet().await;
        let (handle, task, mut observer) =
            start(store.clone(), wallet.clone(), Arc::new(DeterministicEntropy::new(7))).await;

        assert!(matches!(next_event(&mut observer).await, RoundEvent::NewRound { round_id: 1, .. }));
        let placed = handle.place_bet(bet(100)).await.unwrap();
        assert_eq!(placed.status, BetStatus::Active);
        assert_eq!(handle.place_bet(bet(100)).await.unwrap_err(), RoundError::DuplicateBet(1));

        let snapshot = handle.get_state().await.unwrap();
        assert_eq!(snapshot.round_id, Some(1));
        assert_eq!(snapshot.bets.len(), 1);

        // Walk the event stream until round 1 crashes.
        let mut last_multiplier = 1.0;
        let crash_point = loop {
            match next_event(&mut observer).await {
                RoundEvent::MultiplierUpdate { multiplier, .. } => {
                    assert!(multiplier >= last_multiplier);
                    last_multiplier = multiplier;
                }
                RoundEvent::RoundCrashed { round_id, crash_point, final_multiplier, seed, .. } => {
                    assert_eq!(round_id, 1);
                    assert!(final_multiplier >= crash_point);
                    assert!(crate::fairness::verify(&seed, 1, crash_point));
                    break crash_point;
                }
                _ => {}
            }
        };
        assert!(crash_point >= 1.01);

        handle.shutdown().await;
        task.await.unwrap().unwrap();

        let bets = store.bets_for_round(1).await;
        assert_eq!(bets.len(), 1);
        assert_eq!(bets[0].status, BetStatus::Lost);
        let kinds: Vec<_> = store.transactions_for_round(1).await.iter().map(|t| t.kind).collect();
        assert_eq!(kinds.len(), 2);
        assert_eq!(store.raw_round(1).await.unwrap().phase, RoundPhase::Crashed);
        // $100 at $50k = 0.002 BTC, still debited
        assert_eq!(wallet.balance(&ALICE, Currency::Btc).await.unwrap(), CryptoAmount(99_800_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_outage_delays_round_without_skipping_ids() {
        let store = Arc::new(InMemoryStore::new());
        // Enough failures to exhaust the first retry batch.
        store.fail_next_writes(RetryPolicy::default().max_attempts);
        let (handle, task, mut observer) =
            start(store.clone(), wallet().await, Arc::new(DeterministicEntropy::new(3))).await;

        // While the round can't be stored, bets get a retryable error.
        let err = loop {
            match handle.place_bet(bet(10)).await {
                Err(RoundError::PersistenceFailure(reason)) => break reason,
                Err(RoundError::RoundNotAcceptingBets) => tokio::time::sleep(Duration::from_millis(10)).await,
                other => panic!("unexpected {other:?}"),
            }
        };
        assert!(err.contains("unavailable"));
        assert!(RoundError::PersistenceFailure(err).is_retryable());

        match next_event(&mut observer).await {
            RoundEvent::NewRound { round_id, .. } => assert_eq!(round_id, 1),
            other => panic!("unexpected {other:?}"),
        }
        handle.place_bet(bet(10)).await.unwrap();
        handle.shutdown().await;
        task.await.unwrap().unwrap();
    }

    /// Holds back "round started" writes so they are still in flight at the crash.
    struct SlowStartStore(Arc<InMemoryStore>);

    #[async_trait::async_trait]
    impl PersistenceStore for SlowStartStore {
        async fn create_round(&self, round: &RoundRecord) -> Result<(), StoreError> {
            self.0.create_round(round).await
        }
        async fn update_round(&self, round: &RoundRecord) -> Result<(), StoreError> {
            if round.phase == RoundPhase::Running {
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
            self.0.update_round(round).await
        }
        async fn append_bet(&self, bet: &Bet) -> Result<(), StoreError> {
            self.0.append_bet(bet).await
        }
        async fn update_bet(&self, bet: &Bet) -> Result<(), StoreError> {
            self.0.update_bet(bet).await
        }
        async fn append_transaction(&self, tx: &crate::round::state::Transaction) -> Result<(), StoreError> {
            self.0.append_transaction(tx).await
        }
        async fn find_latest_round_id(&self) -> Result<Option<crate::round::state::RoundId>, StoreError> {
            self.0.find_latest_round_id().await
        }
        async fn find_round(&self, round_id: crate::round::state::RoundId) -> Result<Option<RoundRecord>, StoreError> {
            self.0.find_round(round_id).await
        }
        async fn list_crashed_rounds(&self, limit: usize) -> Result<Vec<RoundRecord>, StoreError> {
            self.0.list_crashed_rounds(limit).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_start_write_never_overwrites_crash() {
        let inner = Arc::new(InMemoryStore::new());
        let store = Arc::new(SlowStartStore(inner.clone()));
        let (handle, task, mut observer) =
            start(store, wallet().await, Arc::new(DeterministicEntropy::new(7))).await;

        loop {
            if let RoundEvent::RoundCrashed { round_id: 1, .. } = next_event(&mut observer).await {
                break;
            }
        }
        assert_eq!(inner.raw_round(1).await.unwrap().phase, RoundPhase::Crashed);

        handle.shutdown().await;
        task.await.unwrap().unwrap();

        let record = inner.find_round(1).await.unwrap().unwrap();
        assert_eq!(record.phase, RoundPhase::Crashed);
        assert!(!record.seed.is_empty());
        let crashed: Vec<_> = inner.list_crashed_rounds(10).await.unwrap().iter().map(|r| r.id).collect();
        assert!(crashed.contains(&1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_command_flood_does_not_stall_ticks() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let config = RuntimeConfig {
            scheduler: SchedulerConfig {
                wait: Duration::from_millis(20),
                tick: Duration::from_millis(5),
                growth_per_ms: 0.0001,
                cooldown: Duration::from_millis(20),
                ..SchedulerConfig::default()
            },
            ..RuntimeConfig::default()
        };
        let (handle, task, mut observer) = start_with(
            config,
            Arc::new(crate::core::clock::SystemClock::new()),
            Arc::new(InMemoryStore::new()),
            wallet().await,
            Arc::new(DeterministicEntropy::new(9)),
        )
        .await;

        let stop = Arc::new(AtomicBool::new(false));
        let flooders: Vec<_> = (0..8)
            .map(|_| {
                let handle = handle.clone();
                let stop = stop.clone();
                tokio::spawn(async move {
                    while !stop.load(Ordering::Relaxed) {
                        if handle.get_state().await.is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();

        let lifecycle = tokio::time::timeout(Duration::from_secs(10), async {
            let mut seen = 0;
            while seen < 20 {
                match observer.next().await {
                    Some(Observed::Event(e)) => {
                        if !matches!(e.event, RoundEvent::BetPlaced { .. } | RoundEvent::Cashout { .. }) {
                            seen += 1;
                        }
                    }
                    Some(Observed::Lagged(_)) => {}
                    None => break,
                }
            }
            seen
        })
        .await;

        stop.store(true, Ordering::Relaxed);
        for flooder in flooders {
            flooder.await.unwrap();
        }
        handle.shutdown().await;
        task.await.unwrap().unwrap();
        assert_eq!(lifecycle.expect("round loop stalled under command load"), 20);
    }

    struct OneShotEntropy(std::sync::atomic::AtomicBool);

    impl EntropySource for OneShotEntropy {
        fn fill_seed(&self, out: &mut [u8; Seed::LEN]) -> Result<(), FairnessError> {
            if self.0.swap(true, std::sync::atomic::Ordering::SeqCst) {
                return Err(FairnessError::EntropyUnavailable("exhausted".into()));
            }
            *out = [0x11; Seed::LEN];
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_entropy_failure_halts_runtime() {
        let store = Arc::new(InMemoryStore::new());
        let entropy = Arc::new(OneShotEntropy(std::sync::atomic::AtomicBool::new(false)));
        let (handle, task, mut observer) = start(store, wallet().await, entropy).await;

        // First round runs to completion.
        loop {
            if let RoundEvent::RoundCrashed { .. } = next_event(&mut observer).await {
                break;
            }
        }
        // Second round can't open; bets are refused with the fatal error.
        let err = loop {
            match handle.place_bet(bet(10)).await {
                Err(RoundError::FairnessUnavailable(e)) => break e,
                _ => tokio::task::yield_now().await,
            }
        };
        assert!(matches!(err, FairnessError::EntropyUnavailable(_)));

        handle.shutdown().await;
        assert!(matches!(task.await.unwrap(), Err(RuntimeError::Fairness(_))));
    }

    #[tokio::test]
    async fn test_dropping_handles_stops_runtime() {
        let store = Arc::new(InMemoryStore::new());
        let (handle, task, _observer) =
            start(store, wallet().await, Arc::new(DeterministicEntropy::new(5))).await;
        drop(handle);
        task.await.unwrap().unwrap();
    }
}
