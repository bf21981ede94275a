//! Price Oracle
//!
//! USD prices for supported currencies. Connection handlers take one price
//! snapshot per bet, bounded by a timeout, before the request reaches the
//! round loop.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::round::state::Currency;

/// Oracle errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OracleError {
    /// No price source answered.
    #[error("price unavailable for {0}")]
    Unavailable(Currency),

    /// A price source answered with garbage.
    #[error("invalid price for {currency}: {price}")]
    InvalidPrice {
        /// Currency.
        currency: Currency,
        /// Rejected value.
        price: f64,
    },
}

/// Oracle configuration.
#[derive(Clone, Debug)]
pub struct OracleConfig {
    /// How long a fetched price stays fresh.
    pub cache_ttl: Duration,
    /// Upper bound on a bet's price snapshot.
    pub snapshot_timeout: Duration,
    /// Price used before any update arrives.
    pub default_prices: BTreeMap<Currency, f64>,
}

impl Default for OracleConfig {
    fn default() -> Self {
        let mut default_prices = BTreeMap::new();
        default_prices.insert(Currency::Btc, 30_000.0);
        default_prices.insert(Currency::Eth, 2_000.0);
        Self {
            cache_ttl: Duration::from_secs(30),
            snapshot_timeout: Duration::from_millis(500),
            default_prices,
        }
    }
}

impl OracleConfig {
    /// Load from environment variables, falling back to defaults.
    ///
    /// `CRASH_PRICE_CACHE_SECS`, `CRASH_PRICE_TIMEOUT_MS`,
    /// `CRASH_DEFAULT_BTC_PRICE`, `CRASH_DEFAULT_ETH_PRICE`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(secs) = std::env::var("CRASH_PRICE_CACHE_SECS").ok().and_then(|v| v.parse().ok()) {
            config.cache_ttl = Duration::from_secs(secs);
        }
        if let Some(ms) = std::env::var("CRASH_PRICE_TIMEOUT_MS").ok().and_then(|v| v.parse().ok()) {
            config.snapshot_timeout = Duration::from_millis(ms);
        }
        for currency in Currency::ALL {
            let key = format!("CRASH_DEFAULT_{}_PRICE", currency.as_str().to_ascii_uppercase());
            let parsed = std::env::var(key).ok().and_then(|v| v.parse::<f64>().ok());
            if let Some(price) = parsed.filter(|p| is_valid_price(*p)) {
                config.default_prices.insert(currency, price);
            }
        }
        config
    }

    /// Configured default for a currency.
    pub fn default_price(&self, currency: Currency) -> Option<f64> {
        self.default_prices.get(&currency).copied()
    }
}

/// Positive and finite.
pub fn is_valid_price(price: f64) -> bool {
    price.is_finite() && price > 0.0
}

/// USD price source.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// Current USD price of one coin.
    async fn get_price(&self, currency: Currency) -> Result<f64, OracleError>;

    /// Last value seen, regardless of age. Used when `get_price` times out.
    fn last_known(&self, _currency: Currency) -> Option<f64> {
        None
    }
}

#[derive(Clone, Copy, Debug)]
struct CachedPrice {
    price: f64,
    updated_at: Instant,
}

/// Oracle fed by an external price stream.
///
/// Fresh prices are served directly. A stale price is still served with a
/// warning; a currency that has never been updated gets the configured
/// default.
pub struct CachedPriceOracle {
    config: OracleConfig,
    prices: RwLock<BTreeMap<Currency, CachedPrice>>,
    last_known: std::sync::RwLock<BTreeMap<Currency, f64>>,
}

impl CachedPriceOracle {
    /// Create an empty cache.
    pub fn new(config: OracleConfig) -> Self {
        let seeded = config.default_prices.clone();
        Self {
            config,
            prices: RwLock::new(BTreeMap::new()),
            last_known: std::sync::RwLock::new(seeded),
        }
    }

    /// Record a new price from the feed.
    pub async fn update_price(&self, currency: Currency, price: f64) -> Result<(), OracleError> {
        if !is_valid_price(price) {
            return Err(OracleError::InvalidPrice { currency, price });
        }
        self.prices
            .write()
            .await
            .insert(currency, CachedPrice { price, updated_at: Instant::now() });
        if let Ok(mut last) = self.last_known.write() {
            last.insert(currency, price);
        }
        debug!(%currency, price, "price updated");
        Ok(())
    }
}

#[async_trait]
impl PriceOracle for CachedPriceOracle {
    async fn get_price(&self, currency: Currency) -> Result<f64, OracleError> {
        let cached = self.prices.read().await.get(&currency).copied();
        match cached {
            Some(entry) if entry.updated_at.elapsed() <= self.config.cache_ttl => Ok(entry.price),
            Some(entry) => {
                warn!(%currency, age = ?entry.updated_at.elapsed(), "serving stale price");
                Ok(entry.price)
            }
            None => self
                .config
                .default_price(currency)
                .ok_or(OracleError::Unavailable(currency)),
        }
    }

    fn last_known(&self, currency: Currency) -> Option<f64> {
        self.last_known.read().ok().and_then(|m| m.get(&currency).copied())
    }
}

/// Fixed prices, for tests and simulations.
#[derive(Clone, Debug, Default)]
pub struct StaticPriceOracle {
    prices: BTreeMap<Currency, f64>,
}

impl StaticPriceOracle {
    /// Oracle with one price per currency.
    pub fn new(prices: impl IntoIterator<Item = (Currency, f64)>) -> Self {
        Self { prices: prices.into_iter().collect() }
    }
}

#[async_trait]
impl PriceOracle for StaticPriceOracle {
    async fn get_price(&self, currency: Currency) -> Result<f64, OracleError> {
        self.prices.get(&currency).copied().ok_or(OracleError::Unavailable(currency))
    }

    fn last_known(&self, currency: Currency) -> Option<f64> {
        self.prices.get(&currency).copied()
    }
}

/// Take the price snapshot for one bet.
///
/// Falls back to the oracle's last known value, then to the configured
/// default, when the oracle errors or exceeds `snapshot_timeout`.
pub async fn snapshot_price(
    oracle: &dyn PriceOracle,
    currency: Currency,
    config: &OracleConfig,
) -> Result<f64, OracleError> {
    let live = tokio::time::timeout(config.snapshot_timeout, oracle.get_price(currency)).await;
    let fallback = || {
        oracle
            .last_known(currency)
            .or_else(|| config.default_price(currency))
            .ok_or(OracleError::Unavailable(currency))
    };

    let price = match live {
        Ok(Ok(price)) => price,
        Ok(Err(e)) => {
            warn!(%currency, error = %e, "price lookup failed, using fallback");
            fallback()?
        }
        Err(_) => {
            warn!(%currency, timeout = ?config.snapshot_timeout, "price lookup timed out, using fallback");
            fallback()?
        }
    };

    if is_valid_price(price) {
        Ok(price)
    } else {
        Err(OracleError::InvalidPrice { currency, price })
    }
}
