//! Fixed-Point Money and Multipliers
//!
//! All settlement math is integer arithmetic. Floats only appear at the
//! edges (wire input, display) and inside the documented derivation formulas.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Usd          u64 micro-dollars   1 USD   = 1_000_000        │
//! │  CryptoAmount u64 base units      1 coin  = 100_000_000      │
//! │  Multiplier   u32 hundredths      1.00x   = 100              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Bet stakes are accepted at cent precision, so a stake in micro-dollars is
//! always a multiple of 10_000 and `stake × multiplier` is exact.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Micro-dollars per dollar.
pub const USD_SCALE: u64 = 1_000_000;

/// Micro-dollars per cent.
pub const MICROS_PER_CENT: u64 = 10_000;

/// Base units per coin (satoshi-style, 8 decimals).
pub const CRYPTO_SCALE: u64 = 100_000_000;

/// Hundredths per 1.00x.
pub const MULTIPLIER_SCALE: u32 = 100;

// =============================================================================
// USD
// =============================================================================

/// A USD amount in micro-dollars.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Usd(pub u64);

impl Usd {
    /// Zero dollars.
    pub const ZERO: Usd = Usd(0);

    /// Whole dollars.
    pub const fn from_dollars(dollars: u64) -> Self {
        Self(dollars * USD_SCALE)
    }

    /// Whole cents.
    pub const fn from_cents(cents: u64) -> Self {
        Self(cents * MICROS_PER_CENT)
    }

    /// Parse a wire amount, rounding to the nearest cent.
    ///
    /// Returns `None` for NaN, infinite, negative or absurdly large input.
    pub fn from_f64_cents(dollars: f64) -> Option<Self> {
        if !dollars.is_finite() || dollars < 0.0 {
            return None;
        }
        let cents = (dollars * 100.0).round();
        if cents > (u64::MAX / MICROS_PER_CENT) as f64 {
            return None;
        }
        Some(Self::from_cents(cents as u64))
    }

    /// Raw micro-dollars.
    pub const fn micros(self) -> u64 {
        self.0
    }

    /// Dollars as a float (display only).
    pub fn to_f64(self) -> f64 {
        self.0 as f64 / USD_SCALE as f64
    }

    /// Multiply by a multiplier. Exact for cent-precision amounts.
    pub fn mul_multiplier(self, m: Multiplier) -> Self {
        let micros = self.0 as u128 * m.0 as u128 / MULTIPLIER_SCALE as u128;
        Self(micros.min(u64::MAX as u128) as u64)
    }

    /// Checked subtraction.
    pub fn checked_sub(self, other: Usd) -> Option<Usd> {
        self.0.checked_sub(other.0).map(Usd)
    }

    /// Saturating addition.
    pub fn saturating_add(self, other: Usd) -> Usd {
        Usd(self.0.saturating_add(other.0))
    }
}

impl fmt::Display for Usd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}.{:06}", self.0 / USD_SCALE, self.0 % USD_SCALE)
    }
}

// =============================================================================
// CRYPTO
// =============================================================================

/// A crypto quantity in 1e-8 base units.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CryptoAmount(pub u64);

impl CryptoAmount {
    /// Zero units.
    pub const ZERO: CryptoAmount = CryptoAmount(0);

    /// Convert a USD amount at `price` (USD per coin), rounding down.
    ///
    /// Returns `None` if the price is not a positive finite number.
    pub fn from_usd(usd: Usd, price: f64) -> Option<Self> {
        if !price.is_finite() || price <= 0.0 {
            return None;
        }
        // micros / 1e6 / price * 1e8
        let units = (usd.0 as f64 * (CRYPTO_SCALE as f64 / USD_SCALE as f64) / price).floor();
        if !units.is_finite() || units > u64::MAX as f64 {
            return None;
        }
        Some(Self(units as u64))
    }

    /// Raw base units.
    pub const fn units(self) -> u64 {
        self.0
    }

    /// Coins as a float (display only).
    pub fn to_f64(self) -> f64 {
        self.0 as f64 / CRYPTO_SCALE as f64
    }

    /// Multiply by a multiplier, rounding down.
    pub fn mul_multiplier(self, m: Multiplier) -> Self {
        let units = self.0 as u128 * m.0 as u128 / MULTIPLIER_SCALE as u128;
        Self(units.min(u64::MAX as u128) as u64)
    }

    /// Checked subtraction.
    pub fn checked_sub(self, other: CryptoAmount) -> Option<CryptoAmount> {
        self.0.checked_sub(other.0).map(CryptoAmount)
    }

    /// Saturating addition.
    pub fn saturating_add(self, other: CryptoAmount) -> CryptoAmount {
        CryptoAmount(self.0.saturating_add(other.0))
    }
}

impl fmt::Display for CryptoAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:08}", self.0 / CRYPTO_SCALE, self.0 % CRYPTO_SCALE)
    }
}

// =============================================================================
// MULTIPLIER
// =============================================================================

/// A payout multiplier in hundredths (`150` = 1.50x).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Multiplier(pub u32);

impl Multiplier {
    /// 1.00x
    pub const ONE: Multiplier = Multiplier(MULTIPLIER_SCALE);

    /// From hundredths.
    pub const fn from_hundredths(hundredths: u32) -> Self {
        Self(hundredths)
    }

    /// Hundredths.
    pub const fn hundredths(self) -> u32 {
        self.0
    }

    /// Floor a float to hundredths (`floor(x × 100) / 100`).
    ///
    /// Non-finite or negative input collapses to zero; huge input saturates.
    pub fn floor_from_f64(value: f64) -> Self {
        let scaled = (value * MULTIPLIER_SCALE as f64).floor();
        if !scaled.is_finite() || scaled <= 0.0 {
            return Self(0);
        }
        Self(scaled.min(u32::MAX as f64) as u32)
    }

    /// As a float (display and wire).
    pub fn to_f64(self) -> f64 {
        self.0 as f64 / MULTIPLIER_SCALE as f64
    }
}

impl Default for Multiplier {
    fn default() -> Self {
        Self::ONE
    }
}

impl fmt::Display for Multiplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}x", self.0 / MULTIPLIER_SCALE, self.0 % MULTIPLIER_SCALE)
    }
}

// =============================================================================
// TESTS
// =============================================================================
