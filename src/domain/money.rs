use crate::error::{Result, SettlementError};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

/// VAT applied to every receipt subtotal.
pub const TAX_RATE: Decimal = dec!(0.18);

/// A strictly positive monetary amount in integer minor units.
///
/// Escrow and payment amounts are always `Amount`s; derived figures such as
/// tax or fees use plain `i64` because they may legitimately be zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Amount(i64);

impl Amount {
    pub fn new(value: i64) -> Result<Self> {
        if value > 0 {
            Ok(Self(value))
        } else {
            Err(SettlementError::InvalidAmount(format!(
                "amount must be positive, got {}",
                value
            )))
        }
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl TryFrom<i64> for Amount {
    type Error = SettlementError;

    fn try_from(value: i64) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Amount> for i64 {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Applies `rate` to `base`, rounding half away from zero to whole minor units.
pub fn apply_rate(base: i64, rate: Decimal) -> Result<i64> {
    (Decimal::from(base) * rate)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| SettlementError::InvalidAmount(format!("{} * {} overflows", base, rate)))
}

/// `round(subtotal * 0.18)`.
pub fn tax_for(subtotal: i64) -> Result<i64> {
    apply_rate(subtotal, TAX_RATE)
}

/// Fee expressed in basis points of `base`.
pub fn fee_from_bps(base: i64, bps: u32) -> Result<i64> {
    apply_rate(base, Decimal::new(i64::from(bps), 4))
}

/// Renders minor units as a two-decimal figure with its currency code.
pub fn format_minor(value: i64, currency: &str) -> String {
    format!("{} {}", Decimal::new(value, 2), currency)
}
