//! Money and rate primitives
//!
//! Amounts are signed integer counts of the smallest currency unit (satoshis)
//! tagged with their base asset. Arithmetic across assets is refused rather than
//! coerced: a mismatch is a programming error, not a recoverable condition, and
//! must never produce a misleading accounting snapshot.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Number of smallest units per one base-asset unit (satoshis per coin).
pub const UNITS_PER_COIN: i128 = 100_000_000;

/// Base assets the gateway can account for.
///
/// A closed set: adding an asset means adding a variant and auditing every
/// `match` on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Asset {
    /// Bitcoin mainchain satoshis
    Bitcoin,
    /// Liquid sidechain L-BTC satoshis
    LiquidBitcoin,
}

impl Asset {
    /// Ticker used in logs and API payloads
    pub fn ticker(&self) -> &'static str {
        match self {
            Asset::Bitcoin => "BTC",
            Asset::LiquidBitcoin => "L-BTC",
        }
    }
}

impl std::fmt::Display for Asset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.ticker())
    }
}

/// Errors from money arithmetic
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MoneyError {
    /// Arithmetic attempted between two different assets
    #[error("asset mismatch: {left} vs {right}")]
    AssetMismatch {
        /// Asset of the left operand
        left: Asset,
        /// Asset of the right operand
        right: Asset,
    },

    /// Amount arithmetic overflowed
    #[error("amount overflow")]
    Overflow,

    /// A rate must be a positive decimal
    #[error("rate must be positive, got {0}")]
    NonPositiveRate(Decimal),

    /// Converted value does not fit in an amount
    #[error("converted value out of range: {0}")]
    OutOfRange(Decimal),
}

/// A signed amount of the smallest unit of one asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amount {
    units: i128,
    asset: Asset,
}

impl Amount {
    /// Amount from a count of smallest units
    pub fn from_units(units: i128, asset: Asset) -> Self {
        Self { units, asset }
    }

    /// Zero in the given asset
    pub fn zero(asset: Asset) -> Self {
        Self { units: 0, asset }
    }

    /// The raw unit count
    pub fn units(&self) -> i128 {
        self.units
    }

    /// The asset tag
    pub fn asset(&self) -> Asset {
        self.asset
    }

    /// Whether this amount is exactly zero
    pub fn is_zero(&self) -> bool {
        self.units == 0
    }

    /// Whether this amount is strictly positive
    pub fn is_positive(&self) -> bool {
        self.units > 0
    }

    fn require_same_asset(&self, other: &Amount) -> Result<(), MoneyError> {
        if self.asset != other.asset {
            return Err(MoneyError::AssetMismatch {
                left: self.asset,
                right: other.asset,
            });
        }
        Ok(())
    }

    /// Checked addition, refusing cross-asset operands
    pub fn checked_add(&self, other: Amount) -> Result<Amount, MoneyError> {
        self.require_same_asset(&other)?;
        let units = self
            .units
            .checked_add(other.units)
            .ok_or(MoneyError::Overflow)?;
        Ok(Amount { units, asset: self.asset })
    }

    /// Checked subtraction, refusing cross-asset operands
    pub fn checked_sub(&self, other: Amount) -> Result<Amount, MoneyError> {
        self.require_same_asset(&other)?;
        let units = self
            .units
            .checked_sub(other.units)
            .ok_or(MoneyError::Overflow)?;
        Ok(Amount { units, asset: self.asset })
    }

    /// This amount clamped to be non-negative
    pub fn max_zero(&self) -> Amount {
        Amount {
            units: self.units.max(0),
            asset: self.asset,
        }
    }

    /// Compare against another amount of the same asset
    pub fn checked_cmp(&self, other: &Amount) -> Result<std::cmp::Ordering, MoneyError> {
        self.require_same_asset(other)?;
        Ok(self.units.cmp(&other.units))
    }

    /// Decimal coin value (units / 10^8), for display and API payloads
    pub fn to_coins(&self) -> Decimal {
        Decimal::from_i128_with_scale(self.units, 8).normalize()
    }
}

impl std::fmt::Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.to_coins(), self.asset)
    }
}

/// A fiat exchange rate: quote-currency units per one base-asset coin.
///
/// Immutable once attached to a calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rate(Decimal);

impl Rate {
    /// Build a rate, rejecting zero and negative values
    pub fn new(quote_per_coin: Decimal) -> Result<Self, MoneyError> {
        if quote_per_coin <= Decimal::ZERO {
            return Err(MoneyError::NonPositiveRate(quote_per_coin));
        }
        Ok(Self(quote_per_coin))
    }

    /// The raw decimal multiplier
    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// Convert a fiat price into base-asset units, rounding up to the next
    /// smallest unit. The receiver never undercharges below face value.
    pub fn convert(&self, price: Decimal, asset: Asset) -> Result<Amount, MoneyError> {
        let coins = price
            .checked_div(self.0)
            .ok_or(MoneyError::OutOfRange(price))?;
        let units = coins
            .checked_mul(Decimal::from(UNITS_PER_COIN as i64))
            .ok_or(MoneyError::OutOfRange(coins))?;
        let units = units
            .ceil()
            .to_i128()
            .ok_or(MoneyError::OutOfRange(units))?;
        Ok(Amount::from_units(units, asset))
    }
}

impl std::fmt::Display for Rate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
