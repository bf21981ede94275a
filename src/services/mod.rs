//! External collaborators of the round engine: wallet, price oracle and
//! persistence. Each sits behind an async trait with an in-process
//! implementation.

pub mod oracle;
pub mod persistence;
pub mod wallet;

pub use oracle::{
    snapshot_price, CachedPriceOracle, OracleConfig, OracleError, PriceOracle, StaticPriceOracle,
};
pub use persistence::{
    with_retry, InMemoryStore, PersistOp, PersistenceQueue, PersistenceStore, RetryPolicy, StoreError,
};
pub use wallet::{InMemoryWallet, Wallet, WalletError, WalletOp, WalletReceipt};
