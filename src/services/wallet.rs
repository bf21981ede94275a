//! Wallet Collaborator
//!
//! Per-user balance authority. Every debit and credit carries the caller's
//! transaction id; applying the same id twice returns the original receipt
//! without moving funds again.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::core::money::CryptoAmount;
use crate::round::state::{Currency, UserId};

/// Wallet errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WalletError {
    /// Balance does not cover the debit.
    #[error("insufficient balance: needed {needed}, available {available}")]
    InsufficientBalance {
        /// Requested amount.
        needed: CryptoAmount,
        /// Current balance.
        available: CryptoAmount,
    },

    /// Transaction id reused for a different operation.
    #[error("transaction id {0} already used for a different operation")]
    TransactionConflict(String),

    /// Backend unreachable.
    #[error("wallet backend unavailable: {0}")]
    Unavailable(String),
}

/// Direction of a wallet movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletOp {
    /// Funds removed.
    Debit,
    /// Funds added.
    Credit,
}

/// Result of an applied debit or credit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletReceipt {
    /// Caller's transaction id.
    pub tx_id: String,
    /// Account owner.
    pub user_id: UserId,
    /// Currency moved.
    pub currency: Currency,
    /// Debit or credit.
    pub op: WalletOp,
    /// Amount moved.
    pub amount: CryptoAmount,
    /// Balance after the movement.
    pub balance_after: CryptoAmount,
}

/// Per-user balance authority.
#[async_trait]
pub trait Wallet: Send + Sync {
    /// Current balance.
    async fn balance(&self, user_id: &UserId, currency: Currency) -> Result<CryptoAmount, WalletError>;

    /// Atomically remove funds. Fails without effect if the balance is short.
    async fn debit(
        &self,
        user_id: &UserId,
        currency: Currency,
        amount: CryptoAmount,
        tx_id: &str,
    ) -> Result<WalletReceipt, WalletError>;

    /// Atomically add funds.
    async fn credit(
        &self,
        user_id: &UserId,
        currency: Currency,
        amount: CryptoAmount,
        tx_id: &str,
    ) -> Result<WalletReceipt, WalletError>;

    /// Receipt for a previously applied transaction id, if any.
    async fn find_receipt(&self, tx_id: &str) -> Result<Option<WalletReceipt>, WalletError>;
}

#[derive(Default)]
struct WalletBook {
    balances: BTreeMap<(UserId, Currency), CryptoAmount>,
    receipts: BTreeMap<String, WalletReceipt>,
}

impl WalletBook {
    fn balance(&self, user_id: &UserId, currency: Currency, starting: &BTreeMap<Currency, CryptoAmount>) -> CryptoAmount {
        self.balances
            .get(&(*user_id, currency))
            .copied()
            .or_else(|| starting.get(&currency).copied())
            .unwrap_or(CryptoAmount::ZERO)
    }

    fn replay(
        &self,
        tx_id: &str,
        user_id: &UserId,
        currency: Currency,
        op: WalletOp,
        amount: CryptoAmount,
    ) -> Option<Result<WalletReceipt, WalletError>> {
        let receipt = self.receipts.get(tx_id)?;
        if receipt.user_id == *user_id && receipt.currency == currency && receipt.op == op && receipt.amount == amount {
            Some(Ok(receipt.clone()))
        } else {
            Some(Err(WalletError::TransactionConflict(tx_id.to_string())))
        }
    }
}

/// In-process wallet.
///
/// Accounts that have never been touched start at the configured demo
/// balance for their currency (zero by default).
#[derive(Default)]
pub struct InMemoryWallet {
    book: Mutex<WalletBook>,
    starting_balances: BTreeMap<Currency, CryptoAmount>,
}

impl InMemoryWallet {
    /// Empty wallet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wallet that seeds new accounts with a demo balance.
    pub fn with_demo_balances(starting_balances: BTreeMap<Currency, CryptoAmount>) -> Self {
        Self { book: Mutex::new(WalletBook::default()), starting_balances }
    }

    /// Fund an account directly (no receipt).
    pub async fn deposit(&self, user_id: UserId, currency: Currency, amount: CryptoAmount) {
        let mut book = self.book.lock().await;
        let current = book.balance(&user_id, currency, &self.starting_balances);
        book.balances.insert((user_id, currency), current.saturating_add(amount));
    }

    /// Number of applied receipts.
    pub async fn receipt_count(&self) -> usize {
        self.book.lock().await.receipts.len()
    }
}

#[async_trait]
impl Wallet for InMemoryWallet {
    async fn balance(&self, user_id: &UserId, currency: Currency) -> Result<CryptoAmount, WalletError> {
        let book = self.book.lock().await;
        Ok(book.balance(user_id, currency, &self.starting_balances))
    }

    async fn debit(
        &self,
        user_id: &UserId,
        currency: Currency,
        amount: CryptoAmount,
        tx_id: &str,
    ) -> Result<WalletReceipt, WalletError> {
        let mut book = self.book.lock().await;
        if let Some(replayed) = book.replay(tx_id, user_id, currency, WalletOp::Debit, amount) {
            debug!(tx_id, "debit replayed");
            return replayed;
        }

        let available = book.balance(user_id, currency, &self.starting_balances);
        let balance_after = available
            .checked_sub(amount)
            .ok_or(WalletError::InsufficientBalance { needed: amount, available })?;

        book.balances.insert((*user_id, currency), balance_after);
        let receipt = WalletReceipt {
            tx_id: tx_id.to_string(),
            user_id: *user_id,
            currency,
            op: WalletOp::Debit,
            amount,
            balance_after,
        };
        book.receipts.insert(tx_id.to_string(), receipt.clone());
        Ok(receipt)
    }

    async fn credit(
        &self,
        user_id: &UserId,
        currency: Currency,
        amount: CryptoAmount,
        tx_id: &str,
    ) -> Result<WalletReceipt, WalletError> {
        let mut book = self.book.lock().await;
        if let Some(replayed) = book.replay(tx_id, user_id, currency, WalletOp::Credit, amount) {
            debug!(tx_id, "credit replayed");
            return replayed;
        }

        let balance_after = book
            .balance(user_id, currency, &self.starting_balances)
            .saturating_add(amount);
        book.balances.insert((*user_id, currency), balance_after);
        let receipt = WalletReceipt {
            tx_id: tx_id.to_string(),
            user_id: *user_id,
            currency,
            op: WalletOp::Credit,
            amount,
            balance_after,
        };
        book.receipts.insert(tx_id.to_string(), receipt.clone());
        Ok(receipt)
    }

    async fn find_receipt(&self, tx_id: &str) -> Result<Option<WalletReceipt>, WalletError> {
        Ok(self.book.lock().await.receipts.get(tx_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: UserId = UserId::new([1; 16]);

    #[tokio::test]
    async fn test_debit_and_credit() {
        let wallet = InMemoryWallet::new();
        wallet.deposit(ALICE, Currency::Btc, CryptoAmount(1_000)).await;

        let r = wallet.debit(&ALICE, Currency::Btc, CryptoAmount(400), "tx-1").await.unwrap();
        assert_eq!(r.balance_after, CryptoAmount(600));

        let r = wallet.credit(&ALICE, Currency::Btc, CryptoAmount(100), "tx-2").await.unwrap();
        assert_eq!(r.balance_after, CryptoAmount(700));
        assert_eq!(wallet.balance(&ALICE, Currency::Btc).await.unwrap(), CryptoAmount(700));
        assert_eq!(wallet.balance(&ALICE, Currency::Eth).await.unwrap(), CryptoAmount::ZERO);
    }

    #[tokio::test]
    async fn test_insufficient_balance_has_no_effect() {
        let wallet = InMemoryWallet::new();
        wallet.deposit(ALICE, Currency::Eth, CryptoAmount(50)).await;

        let result = wallet.debit(&ALICE, Currency::Eth, CryptoAmount(51), "tx-1").await;
        assert!(matches!(result, Err(WalletError::InsufficientBalance { .. })));
        assert_eq!(wallet.balance(&ALICE, Currency::Eth).await.unwrap(), CryptoAmount(50));
        assert!(wallet.find_receipt("tx-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_same_tx_id_applies_once() {
        let wallet = InMemoryWallet::new();
        let first = wallet.credit(&ALICE, Currency::Btc, CryptoAmount(10), "tx-1").await.unwrap();
        let second = wallet.credit(&ALICE, Currency::Btc, CryptoAmount(10), "tx-1").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(wallet.balance(&ALICE, Currency::Btc).await.unwrap(), CryptoAmount(10));
        assert_eq!(wallet.receipt_count().await, 1);

        let conflict = wallet.credit(&ALICE, Currency::Btc, CryptoAmount(99), "tx-1").await;
        assert!(matches!(conflict, Err(WalletError::TransactionConflict(_))));
    }

    #[tokio::test]
    async fn test_demo_balances_seed_new_accounts() {
        let mut demo = BTreeMap::new();
        demo.insert(Currency::Btc, CryptoAmount(5_000));
        let wallet = InMemoryWallet::with_demo_balances(demo);

        assert_eq!(wallet.balance(&ALICE, Currency::Btc).await.unwrap(), CryptoAmount(5_000));
        wallet.debit(&ALICE, Currency::Btc, CryptoAmount(5_000), "tx-1").await.unwrap();
        assert_eq!(wallet.balance(&ALICE, Currency::Btc).await.unwrap(), CryptoAmount::ZERO);
    }
}
