//! Exact two-decimal-place money arithmetic.
//!
//! Credit balances cross every boundary as strings with exactly two decimal
//! digits (e.g. `"1.00"`). Internally values are held at a fixed scale of two,
//! so the mantissa is an integer count of minor units (cents) and repeated
//! add/subtract cycles cannot accumulate binary floating-point drift:
//! `0.10 + 0.20` is `0.30`, never `0.30000000000000004`.

use std::fmt;
use std::ops::{Add, Sub};
use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// A malformed money string is a programmer error at the call site, not
/// something to coerce to zero.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed money value: {input:?}")]
pub struct MoneyError {
    pub input: String,
}

/// A money amount at a fixed scale of two decimal places.
///
/// May be negative: transaction amounts are signed (a grading charge is
/// `-1.00`, a refund `+1.00`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Money(Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);

    /// Parse a decimal string, rounding half-away-from-zero to two places.
    pub fn parse(input: &str) -> Result<Money, MoneyError> {
        let decimal = Decimal::from_str(input.trim()).map_err(|_| MoneyError {
            input: input.to_string(),
        })?;
        Ok(Money::from_decimal(decimal))
    }

    fn from_decimal(decimal: Decimal) -> Money {
        let mut rounded =
            decimal.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        rounded.rescale(2);
        Money(rounded)
    }

    /// The amount as a signed count of minor units (cents).
    pub fn minor_units(&self) -> i64 {
        (self.0 * Decimal::from(100)).to_i64().unwrap_or(i64::MAX)
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        !self.0.is_zero() && self.0.is_sign_positive()
    }

    pub fn is_negative(&self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    /// The additive inverse, used when recording charges as signed amounts.
    pub fn negate(&self) -> Money {
        Money::from_decimal(-self.0)
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money::from_decimal(self.0 + rhs.0)
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Money) -> Money {
        Money::from_decimal(self.0 - rhs.0)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Constructors rescale, but `Money::ZERO` starts at scale 0; pin the
        // printed form to two decimals unconditionally.
        let mut amount = self.0;
        amount.rescale(2);
        write!(f, "{amount}")
    }
}

impl FromStr for Money {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Money::parse(s)
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Money::parse(&raw).map_err(de::Error::custom)
    }
}
