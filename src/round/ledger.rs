//! Bet Ledger
//!
//! Bookkeeping for the bets of one round. Owned by the scheduler and only
//! mutated from inside the round loop, so every operation here is already
//! serialized against ticks.
//!
//! ```text
//!   place_bet ──▶ validate ──▶ wallet.debit(tx) ──▶ Bet(Active) + bet tx
//!   cash_out  ──▶ validate ──▶ wallet.credit(tx) ─▶ Bet(CashedOut) + cashout tx
//!   settle    ──▶ every Active bet ──▶ Bet(Lost) + loss tx      (once)
//! ```
//!
//! Wallet calls use the deterministic transaction hash as idempotency key.
//! When a wallet call fails its parameters are parked, and the retry (or
//! settlement) reuses them, so the wallet never sees two different amounts
//! under one key.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::core::money::{CryptoAmount, Multiplier, Usd};
use crate::round::error::RoundError;
use crate::round::state::{
    transaction_hash, Bet, BetStatus, Currency, Round, RoundId, RoundPhase, Transaction, TransactionKind,
    UserId,
};
use crate::services::oracle::is_valid_price;
use crate::services::wallet::{Wallet, WalletError};

/// Smallest accepted stake.
pub const MIN_BET: Usd = Usd::from_dollars(1);

/// A bet request with its price snapshot already taken.
#[derive(Clone, Debug, PartialEq)]
pub struct BetRequest {
    /// Bettor.
    pub user_id: UserId,
    /// Display name.
    pub username: String,
    /// Stake.
    pub usd_amount: Usd,
    /// Quote currency.
    pub currency: Currency,
    /// USD per coin at request time.
    pub price: f64,
}

/// Result of a successful cash-out.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    /// Round.
    pub round_id: RoundId,
    /// User.
    pub user_id: UserId,
    /// Display name.
    pub username: String,
    /// Currency paid.
    pub currency: Currency,
    /// Multiplier applied.
    pub cashout_multiplier: Multiplier,
    /// USD payout.
    pub usd_payout: Usd,
    /// Crypto payout.
    pub crypto_payout: CryptoAmount,
    /// Ledger entry id.
    pub transaction_hash: String,
}

/// Everything produced by one state change, for persistence.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LedgerWrites {
    /// Bets created.
    pub new_bets: Vec<Bet>,
    /// Bets whose status changed.
    pub updated_bets: Vec<Bet>,
    /// Ledger entries appended.
    pub transactions: Vec<Transaction>,
}

impl LedgerWrites {
    /// True when nothing changed.
    pub fn is_empty(&self) -> bool {
        self.new_bets.is_empty() && self.updated_bets.is_empty() && self.transactions.is_empty()
    }

    /// Append another batch, keeping order.
    pub fn extend(&mut self, other: LedgerWrites) {
        self.new_bets.extend(other.new_bets);
        self.updated_bets.extend(other.updated_bets);
        self.transactions.extend(other.transactions);
    }
}

#[derive(Clone, Debug)]
struct PendingDebit {
    request: BetRequest,
    crypto_amount: CryptoAmount,
    tx_id: String,
}

#[derive(Clone, Copy, Debug)]
struct PendingCredit {
    multiplier: Multiplier,
}

/// Bets of a single round.
pub struct BetLedger {
    round_id: RoundId,
    wallet: Arc<dyn Wallet>,
    wallet_timeout: Duration,
    bets: BTreeMap<UserId, Bet>,
    transactions: Vec<Transaction>,
    pending_debits: BTreeMap<UserId, PendingDebit>,
    pending_credits: BTreeMap<UserId, PendingCredit>,
    settled: bool,
}

impl BetLedger {
    /// Empty ledger for `round_id`.
    pub fn new(round_id: RoundId, wallet: Arc<dyn Wallet>, wallet_timeout: Duration) -> Self {
        Self {
            round_id,
            wallet,
            wallet_timeout,
            bets: BTreeMap::new(),
            transactions: Vec::new(),
            pending_debits: BTreeMap::new(),
            pending_credits: BTreeMap::new(),
            settled: false,
        }
    }

    /// Round this ledger belongs to.
    pub fn round_id(&self) -> RoundId {
        self.round_id
    }

    /// Bets in placement-key order.
    pub fn bets(&self) -> impl Iterator<Item = &Bet> {
        self.bets.values()
    }

    /// Bet of one user.
    pub fn bet(&self, user_id: &UserId) -> Option<&Bet> {
        self.bets.get(user_id)
    }

    /// Ledger entries in append order.
    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    /// Whether `settle` has run.
    pub fn is_settled(&self) -> bool {
        self.settled
    }

    async fn debit(&self, pending: &PendingDebit) -> Result<(), RoundError> {
        let call = self.wallet.debit(
            &pending.request.user_id,
            pending.request.currency,
            pending.crypto_amount,
            &pending.tx_id,
        );
        match tokio::time::timeout(self.wallet_timeout, call).await {
            Ok(result) => result.map(|_| ()).map_err(RoundError::from),
            Err(_) => Err(RoundError::WalletUnavailable("debit timed out".into())),
        }
    }

    async fn credit(&self, user_id: &UserId, currency: Currency, amount: CryptoAmount, tx_id: &str) -> Result<(), RoundError> {
        let call = self.wallet.credit(user_id, currency, amount, tx_id);
        match tokio::time::timeout(self.wallet_timeout, call).await {
            Ok(result) => result.map(|_| ()).map_err(RoundError::from),
            Err(_) => Err(RoundError::WalletUnavailable("credit timed out".into())),
        }
    }

    fn record_bet(&mut self, pending: PendingDebit, now: DateTime<Utc>, writes: &mut LedgerWrites) -> Bet {
        let PendingDebit { request, crypto_amount, tx_id } = pending;
        let bet = Bet {
            round_id: self.round_id,
            user_id: request.user_id,
            username: request.username,
            usd_amount: request.usd_amount,
            crypto_amount,
            currency: request.currency,
            price_at_bet: request.price,
            status: BetStatus::Active,
            cashout_multiplier: None,
            usd_payout: None,
            crypto_payout: None,
            placed_at: now,
        };
        let tx = Transaction {
            user_id: bet.user_id,
            round_id: self.round_id,
            usd_amount: bet.usd_amount,
            crypto_amount,
            currency: bet.currency,
            price_at_time: bet.price_at_bet,
            kind: TransactionKind::Bet,
            multiplier: None,
            transaction_hash: tx_id,
            timestamp: now,
        };

        self.bets.insert(bet.user_id, bet.clone());
        self.transactions.push(tx.clone());
        writes.new_bets.push(bet.clone());
        writes.transactions.push(tx);
        bet
    }

    /// Accept a bet while the round is waiting.
    ///
    /// The stake is debited before anything is recorded. If the wallet
    /// fails, nothing is recorded and the same request can be retried.
    pub async fn place_bet(
        &mut self,
        round: &Round,
        request: BetRequest,
        now: DateTime<Utc>,
    ) -> Result<(Bet, LedgerWrites), RoundError> {
        if round.id != self.round_id || round.phase != RoundPhase::Waiting || self.settled {
            return Err(RoundError::RoundNotAcceptingBets);
        }
        if request.usd_amount < MIN_BET {
            return Err(RoundError::InvalidBetAmount);
        }
        if self.bets.contains_key(&request.user_id) {
            return Err(RoundError::DuplicateBet(self.round_id));
        }

        // A parked debit for this user wins over the new request.
        let pending = match self.pending_debits.get(&request.user_id) {
            Some(parked) => parked.clone(),
            None => {
                if !is_valid_price(request.price) {
                    return Err(RoundError::InvalidPrice(request.currency.to_string()));
                }
                let crypto_amount = CryptoAmount::from_usd(request.usd_amount, request.price)
                    .ok_or_else(|| RoundError::InvalidPrice(request.currency.to_string()))?;
                if crypto_amount == CryptoAmount::ZERO {
                    return Err(RoundError::InvalidBetAmount);
                }
                let tx_id = transaction_hash(TransactionKind::Bet, self.round_id, &request.user_id);
                PendingDebit { request, crypto_amount, tx_id }
            }
        };

        match self.debit(&pending).await {
            Ok(()) => {}
            Err(e @ RoundError::WalletUnavailable(_)) => {
                warn!(round_id = self.round_id, user = %pending.request.user_id, error = %e, "debit failed, parked for retry");
                self.pending_debits.insert(pending.request.user_id, pending);
                return Err(e);
            }
            Err(e) => {
                self.pending_debits.remove(&pending.request.user_id);
                return Err(e);
            }
        }

        self.pending_debits.remove(&pending.request.user_id);
        let mut writes = LedgerWrites::default();
        let bet = self.record_bet(pending, now, &mut writes);
        info!(
            round_id = self.round_id,
            user = %bet.user_id,
            usd = %bet.usd_amount,
            crypto = %bet.crypto_amount,
            currency = %bet.currency,
            "bet placed"
        );
        Ok((bet, writes))
    }

    fn apply_cashout(
        &mut self,
        user_id: &UserId,
        multiplier: Multiplier,
        now: DateTime<Utc>,
        writes: &mut LedgerWrites,
    ) -> Result<Settlement, RoundError> {
        let round_id = self.round_id;
        let bet = self.bets.get_mut(user_id).ok_or(RoundError::NoActiveBet)?;
        let usd_payout = bet.usd_amount.mul_multiplier(multiplier);
        let crypto_payout = bet.crypto_amount.mul_multiplier(multiplier);
        let tx_hash = transaction_hash(TransactionKind::Cashout, round_id, user_id);

        bet.status = BetStatus::CashedOut;
        bet.cashout_multiplier = Some(multiplier);
        bet.usd_payout = Some(usd_payout);
        bet.crypto_payout = Some(crypto_payout);

        let tx = Transaction {
            user_id: *user_id,
            round_id,
            usd_amount: usd_payout,
            crypto_amount: crypto_payout,
            currency: bet.currency,
            price_at_time: bet.price_at_bet,
            kind: TransactionKind::Cashout,
            multiplier: Some(multiplier),
            transaction_hash: tx_hash.clone(),
            timestamp: now,
        };
        let settlement = Settlement {
            round_id,
            user_id: *user_id,
            username: bet.username.clone(),
            currency: bet.currency,
            cashout_multiplier: multiplier,
            usd_payout,
            crypto_payout,
            transaction_hash: tx_hash,
        };

        writes.updated_bets.push(bet.clone());
        self.transactions.push(tx.clone());
        writes.transactions.push(tx);
        Ok(settlement)
    }

    /// Cash out at the scheduler's last computed multiplier.
    ///
    /// The payout is credited before the bet is marked, so a wallet failure
    /// leaves the bet active and the request retryable at the same
    /// multiplier.
    pub async fn cash_out(
        &mut self,
        round: &Round,
        user_id: &UserId,
        current_multiplier: Multiplier,
        now: DateTime<Utc>,
    ) -> Result<(Settlement, LedgerWrites), RoundError> {
        if round.id != self.round_id || round.phase != RoundPhase::Running || self.settled {
            return Err(RoundError::RoundNotRunning);
        }
        let bet = self.bets.get(user_id).ok_or(RoundError::NoActiveBet)?;
        match bet.status {
            BetStatus::Active => {}
            BetStatus::CashedOut => return Err(RoundError::AlreadyCashedOut),
            BetStatus::Lost => return Err(RoundError::NoActiveBet),
        }

        let multiplier = self
            .pending_credits
            .get(user_id)
            .map(|p| p.multiplier)
            .unwrap_or(current_multiplier);
        let currency = bet.currency;
        let crypto_payout = bet.crypto_amount.mul_multiplier(multiplier);
        let tx_id = transaction_hash(TransactionKind::Cashout, self.round_id, user_id);

        if let Err(e) = self.credit(user_id, currency, crypto_payout, &tx_id).await {
            warn!(round_id = self.round_id, user = %user_id, error = %e, "credit failed, parked for retry");
            self.pending_credits.insert(*user_id, PendingCredit { multiplier });
            return Err(e);
        }
        self.pending_credits.remove(user_id);

        let mut writes = LedgerWrites::default();
        let settlement = self.apply_cashout(user_id, multiplier, now, &mut writes)?;
        info!(
            round_id = self.round_id,
            user = %user_id,
            multiplier = %multiplier,
            payout = %settlement.usd_payout,
            "cashed out"
        );
        Ok((settlement, writes))
    }

    /// Resolve every unresolved bet after the crash. Runs once; later calls
    /// return no writes.
    ///
    /// Parked wallet calls are resolved against the wallet's receipts first:
    /// an applied debit becomes a (lost) bet, an applied credit becomes a
    /// cash-out.
    pub async fn settle(&mut self, now: DateTime<Utc>) -> LedgerWrites {
        let mut writes = LedgerWrites::default();
        if self.settled {
            debug!(round_id = self.round_id, "settle called again, ignoring");
            return writes;
        }
        self.settled = true;

        let pending_debits = std::mem::take(&mut self.pending_debits);
        for (user_id, pending) in pending_debits {
            match self.wallet.find_receipt(&pending.tx_id).await {
                Ok(Some(_)) => {
                    warn!(round_id = self.round_id, user = %user_id, "parked debit was applied, recording bet");
                    self.record_bet(pending, now, &mut writes);
                }
                Ok(None) => {}
                Err(e) => reconcile_error(self.round_id, &user_id, &pending.tx_id, &e),
            }
        }

        let pending_credits = std::mem::take(&mut self.pending_credits);
        for (user_id, pending) in pending_credits {
            let tx_id = transaction_hash(TransactionKind::Cashout, self.round_id, &user_id);
            match self.wallet.find_receipt(&tx_id).await {
                Ok(Some(_)) => {
                    warn!(round_id = self.round_id, user = %user_id, "parked credit was applied, recording cash-out");
                    if let Err(e) = self.apply_cashout(&user_id, pending.multiplier, now, &mut writes) {
                        error!(round_id = self.round_id, user = %user_id, error = %e, "cannot record parked cash-out");
                    }
                }
                Ok(None) => {}
                Err(e) => reconcile_error(self.round_id, &user_id, &tx_id, &e),
            }
        }

        let round_id = self.round_id;
        for bet in self.bets.values_mut().filter(|b| b.status == BetStatus::Active) {
            bet.status = BetStatus::Lost;
            let tx = Transaction {
                user_id: bet.user_id,
                round_id,
                usd_amount: bet.usd_amount,
                crypto_amount: bet.crypto_amount,
                currency: bet.currency,
                price_at_time: bet.price_at_bet,
                kind: TransactionKind::Loss,
                multiplier: None,
                transaction_hash: transaction_hash(TransactionKind::Loss, round_id, &bet.user_id),
                timestamp: now,
            };
            writes.updated_bets.push(bet.clone());
            self.transactions.push(tx.clone());
            writes.transactions.push(tx);
        }

        info!(
            round_id,
            bets = self.bets.len(),
            lost = writes.updated_bets.iter().filter(|b| b.status == BetStatus::Lost).count(),
            "round settled"
        );
        writes
    }
}

fn reconcile_error(round_id: RoundId, user_id: &UserId, tx_id: &str, e: &WalletError) {
    error!(round_id, user = %user_id, tx_id, error = %e, "cannot reconcile parked wallet call");
}

impl std::fmt::Debug for BetLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BetLedger")
            .field("round_id", &self.round_id)
            .field("bets", &self.bets.len())
            .field("settled", &self.settled)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fairness::{derive, RoundFairness, Seed};
    use crate::services::wallet::{InMemoryWallet, WalletReceipt};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    const ALICE: UserId = UserId::new([1; 16]);
    const BOB: UserId = UserId::new([2; 16]);
    const TIMEOUT: Duration = Duration::from_secs(1);

    fn round(phase: RoundPhase) -> Round {
        let seed = Seed::new([9; 32]);
        let (hash, crash_point) = derive(&seed, 1);
        let mut round = Round::open(
            RoundFairness { round_id: 1, seed, commit_hash: hex::encode(hash), crash_point },
            Utc::now(),
        );
        round.phase = phase;
        round
    }

    fn request(user_id: UserId, dollars: u64) -> BetRequest {
        BetRequest {
            user_id,
            username: "player".into(),
            usd_amount: Usd::from_dollars(dollars),
            currency: Currency::Btc,
            price: 25_000.0,
        }
    }

    async fn funded_wallet() -> Arc<InMemoryWallet> {
        let wallet = Arc::new(InMemoryWallet::new());
        wallet.deposit(ALICE, Currency::Btc, CryptoAmount(100_000_000)).await;
        wallet.deposit(BOB, Currency::Btc, CryptoAmount(100_000_000)).await;
        wallet
    }

    #[tokio::test]
    async fn test_place_bet_debits_stake() {
        let wallet = funded_wallet().await;
        let mut ledger = BetLedger::new(1, wallet.clone(), TIMEOUT);

        let (bet, writes) = ledger.place_bet(&round(RoundPhase::Waiting), request(ALICE, 100), Utc::now()).await.unwrap();
        assert_eq!(bet.status, BetStatus::Active);
        assert!(!bet.is_cashed_out());
        // $100 at $25k = 0.004 BTC
        assert_eq!(bet.crypto_amount, CryptoAmount(400_000));
        assert_eq!(wallet.balance(&ALICE, Currency::Btc).await.unwrap(), CryptoAmount(99_600_000));

        assert_eq!(writes.new_bets.len(), 1);
        assert_eq!(writes.transactions[0].kind, TransactionKind::Bet);
        assert_eq!(writes.transactions[0].transaction_hash, transaction_hash(TransactionKind::Bet, 1, &ALICE));
    }

    #[tokio::test]
    async fn test_place_bet_validation() {
        let wallet = funded_wallet().await;
        let mut ledger = BetLedger::new(1, wallet.clone(), TIMEOUT);
        let waiting = round(RoundPhase::Waiting);

        let r = ledger.place_bet(&round(RoundPhase::Running), request(ALICE, 10), Utc::now()).await;
        assert_eq!(r.unwrap_err(), RoundError::RoundNotAcceptingBets);

        let mut small = request(ALICE, 0);
        small.usd_amount = Usd::from_cents(99);
        assert_eq!(ledger.place_bet(&waiting, small, Utc::now()).await.unwrap_err(), RoundError::InvalidBetAmount);

        let mut bad_price = request(ALICE, 10);
        bad_price.price = f64::NAN;
        assert!(matches!(
            ledger.place_bet(&waiting, bad_price, Utc::now()).await,
            Err(RoundError::InvalidPrice(_))
        ));

        ledger.place_bet(&waiting, request(ALICE, 10), Utc::now()).await.unwrap();
        assert_eq!(
            ledger.place_bet(&waiting, request(ALICE, 10), Utc::now()).await.unwrap_err(),
            RoundError::DuplicateBet(1)
        );
        assert_eq!(ledger.bets().count(), 1);
        assert_eq!(wallet.receipt_count().await, 1);
    }

    #[tokio::test]
    async fn test_insufficient_balance_leaves_no_bet() {
        let wallet = Arc::new(InMemoryWallet::new());
        wallet.deposit(ALICE, Currency::Btc, CryptoAmount(100)).await;
        let mut ledger = BetLedger::new(1, wallet.clone(), TIMEOUT);

        let r = ledger.place_bet(&round(RoundPhase::Waiting), request(ALICE, 100), Utc::now()).await;
        assert_eq!(r.unwrap_err(), RoundError::InsufficientBalance);
        assert!(ledger.bet(&ALICE).is_none());
        assert!(ledger.transactions().is_empty());
    }

    #[tokio::test]
    async fn test_cash_out_at_current_multiplier() {
        let wallet = funded_wallet().await;
        let mut ledger = BetLedger::new(1, wallet.clone(), TIMEOUT);
        ledger.place_bet(&round(RoundPhase::Waiting), request(ALICE, 100), Utc::now()).await.unwrap();

        let running = round(RoundPhase::Running);
        let (settlement, writes) = ledger.cash_out(&running, &ALICE, Multiplier(150), Utc::now()).await.unwrap();
        assert_eq!(settlement.usd_payout, Usd::from_dollars(150));
        assert_eq!(settlement.crypto_payout, CryptoAmount(600_000));
        assert_eq!(writes.updated_bets[0].status, BetStatus::CashedOut);
        assert_eq!(wallet.balance(&ALICE, Currency::Btc).await.unwrap(), CryptoAmount(100_200_000));

        let again = ledger.cash_out(&running, &ALICE, Multiplier(200), Utc::now()).await;
        assert_eq!(again.unwrap_err(), RoundError::AlreadyCashedOut);
        assert_eq!(wallet.balance(&ALICE, Currency::Btc).await.unwrap(), CryptoAmount(100_200_000));
    }

    #[tokio::test]
    async fn test_cash_out_preconditions() {
        let wallet = funded_wallet().await;
        let mut ledger = BetLedger::new(1, wallet, TIMEOUT);
        ledger.place_bet(&round(RoundPhase::Waiting), request(ALICE, 10), Utc::now()).await.unwrap();

        let r = ledger.cash_out(&round(RoundPhase::Waiting), &ALICE, Multiplier::ONE, Utc::now()).await;
        assert_eq!(r.unwrap_err(), RoundError::RoundNotRunning);

        let r = ledger.cash_out(&round(RoundPhase::Running), &BOB, Multiplier(120), Utc::now()).await;
        assert_eq!(r.unwrap_err(), RoundError::NoActiveBet);

        let r = ledger.cash_out(&round(RoundPhase::Crashed), &ALICE, Multiplier(120), Utc::now()).await;
        assert_eq!(r.unwrap_err(), RoundError::RoundNotRunning);
    }

    #[tokio::test]
    async fn test_settle_marks_uncashed_lost_once() {
        let wallet = funded_wallet().await;
        let mut ledger = BetLedger::new(1, wallet.clone(), TIMEOUT);
        let waiting = round(RoundPhase::Waiting);
        ledger.place_bet(&waiting, request(ALICE, 100), Utc::now()).await.unwrap();
        ledger.place_bet(&waiting, request(BOB, 100), Utc::now()).await.unwrap();
        ledger.cash_out(&round(RoundPhase::Running), &BOB, Multiplier(120), Utc::now()).await.unwrap();

        let writes = ledger.settle(Utc::now()).await;
        assert_eq!(writes.updated_bets.len(), 1);
        assert_eq!(writes.updated_bets[0].user_id, ALICE);
        assert_eq!(writes.updated_bets[0].status, BetStatus::Lost);
        assert_eq!(writes.transactions[0].kind, TransactionKind::Loss);
        assert_eq!(ledger.bet(&ALICE).unwrap().usd_payout, None);
        // stake stays debited
        assert_eq!(wallet.balance(&ALICE, Currency::Btc).await.unwrap(), CryptoAmount(99_600_000));

        assert!(ledger.settle(Utc::now()).await.is_empty());
        assert!(ledger.bets().all(|b| b.is_settled()));
        let kinds: Vec<_> = ledger.transactions().iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![TransactionKind::Bet, TransactionKind::Bet, TransactionKind::Cashout, TransactionKind::Loss]
        );
    }

    /// Wallet that applies calls but can report failure afterwards.
    struct FlakyWallet {
        inner: InMemoryWallet,
        fail_after_apply: AtomicBool,
    }

    #[async_trait]
    impl Wallet for FlakyWallet {
        async fn balance(&self, user_id: &UserId, currency: Currency) -> Result<CryptoAmount, WalletError> {
            self.inner.balance(user_id, currency).await
        }

        async fn debit(&self, user_id: &UserId, currency: Currency, amount: CryptoAmount, tx_id: &str) -> Result<WalletReceipt, WalletError> {
            let receipt = self.inner.debit(user_id, currency, amount, tx_id).await?;
            if self.fail_after_apply.load(Ordering::SeqCst) {
                return Err(WalletError::Unavailable("connection reset".into()));
            }
            Ok(receipt)
        }

        async fn credit(&self, user_id: &UserId, currency: Currency, amount: CryptoAmount, tx_id: &str) -> Result<WalletReceipt, WalletError> {
            let receipt = self.inner.credit(user_id, currency, amount, tx_id).await?;
            if self.fail_after_apply.load(Ordering::SeqCst) {
                return Err(WalletError::Unavailable("connection reset".into()));
            }
            Ok(receipt)
        }

        async fn find_receipt(&self, tx_id: &str) -> Result<Option<WalletReceipt>, WalletError> {
            self.inner.find_receipt(tx_id).await
        }
    }

    #[tokio::test]
    async fn test_retried_cash_out_reuses_parked_multiplier() {
        let wallet = Arc::new(FlakyWallet { inner: InMemoryWallet::new(), fail_after_apply: AtomicBool::new(false) });
        wallet.inner.deposit(ALICE, Currency::Btc, CryptoAmount(100_000_000)).await;
        let mut ledger = BetLedger::new(1, wallet.clone(), TIMEOUT);
        ledger.place_bet(&round(RoundPhase::Waiting), request(ALICE, 100), Utc::now()).await.unwrap();

        let running = round(RoundPhase::Running);
        wallet.fail_after_apply.store(true, Ordering::SeqCst);
        let r = ledger.cash_out(&running, &ALICE, Multiplier(150), Utc::now()).await;
        assert!(matches!(r, Err(RoundError::WalletUnavailable(_))));
        assert_eq!(ledger.bet(&ALICE).unwrap().status, BetStatus::Active);

        wallet.fail_after_apply.store(false, Ordering::SeqCst);
        let (settlement, _) = ledger.cash_out(&running, &ALICE, Multiplier(300), Utc::now()).await.unwrap();
        assert_eq!(settlement.cashout_multiplier, Multiplier(150));
        // credited exactly once
        assert_eq!(wallet.balance(&ALICE, Currency::Btc).await.unwrap(), CryptoAmount(100_200_000));
    }

    #[tokio::test]
    async fn test_settle_reconciles_parked_wallet_calls() {
        let wallet = Arc::new(FlakyWallet { inner: InMemoryWallet::new(), fail_after_apply: AtomicBool::new(false) });
        wallet.inner.deposit(ALICE, Currency::Btc, CryptoAmount(100_000_000)).await;
        wallet.inner.deposit(BOB, Currency::Btc, CryptoAmount(100_000_000)).await;
        let mut ledger = BetLedger::new(1, wallet.clone(), TIMEOUT);

        ledger.place_bet(&round(RoundPhase::Waiting), request(ALICE, 100), Utc::now()).await.unwrap();
        wallet.fail_after_apply.store(true, Ordering::SeqCst);
        assert!(ledger.place_bet(&round(RoundPhase::Waiting), request(BOB, 100), Utc::now()).await.is_err());
        assert!(ledger.cash_out(&round(RoundPhase::Running), &ALICE, Multiplier(200), Utc::now()).await.is_err());

        let writes = ledger.settle(Utc::now()).await;
        assert_eq!(writes.new_bets.len(), 1);
        assert_eq!(ledger.bet(&ALICE).unwrap().status, BetStatus::CashedOut);
        assert_eq!(ledger.bet(&ALICE).unwrap().cashout_multiplier, Some(Multiplier(200)));
        assert_eq!(ledger.bet(&BOB).unwrap().status, BetStatus::Lost);
        assert!(ledger.bets().all(|b| b.is_settled()));
    }
}
