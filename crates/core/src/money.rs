//! Monetary value objects.
//!
//! Amounts are held in the smallest currency unit (cents) so totals are exact.
//! The remote ERP speaks decimal amounts; conversion happens only at that edge.

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Marker trait for value objects (compared by value, immutable).
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}

/// Non-negative amount in cents.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(u64);

impl ValueObject for Money {}

impl Money {
    pub const ZERO: Money = Money(0);

    pub fn from_cents(cents: u64) -> Self {
        Self(cents)
    }

    pub fn cents(self) -> u64 {
        self.0
    }

    /// Convert a decimal amount (e.g. `550.0`) into cents, rounding half away from zero.
    pub fn from_decimal(amount: f64) -> Result<Self, DomainError> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(DomainError::validation(format!(
                "amount must be a finite, non-negative number (got {amount})"
            )));
        }
        Ok(Self((amount * 100.0).round() as u64))
    }

    pub fn to_decimal(self) -> f64 {
        self.0 as f64 / 100.0
    }

    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }

    pub fn checked_mul(self, quantity: u32) -> Option<Money> {
        self.0.checked_mul(u64::from(quantity)).map(Money)
    }
}

impl core::fmt::Display for Money {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

/// Tax rate in basis points (1000 = 10%).
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaxRate(u32);

impl ValueObject for TaxRate {}

impl TaxRate {
    pub fn from_basis_points(bps: u32) -> Result<Self, DomainError> {
        if bps > 10_000 {
            return Err(DomainError::validation("tax rate cannot exceed 100%"));
        }
        Ok(Self(bps))
    }

    pub fn basis_points(self) -> u32 {
        self.0
    }

    /// Tax owed on `base`, rounded half up to the nearest cent.
    pub fn apply(self, base: Money) -> Money {
        let raw = u128::from(base.cents()) * u128::from(self.0);
        Money(((raw + 5_000) / 10_000) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_conversion_rounds_to_cents() {
        assert_eq!(Money::from_decimal(550.0).unwrap().cents(), 55_000);
        assert_eq!(Money::from_decimal(0.105).unwrap().cents(), 11);
        assert!(Money::from_decimal(-1.0).is_err());
        assert!(Money::from_decimal(f64::NAN).is_err());
    }

    #[test]
    fn ten_percent_tax_on_five_hundred() {
        let rate = TaxRate::from_basis_points(1_000).unwrap();
        let tax = rate.apply(Money::from_cents(50_000));
        assert_eq!(tax, Money::from_cents(5_000));
        assert_eq!(tax.to_string(), "50.00");
    }

    #[test]
    fn tax_rate_is_bounded() {
        assert!(TaxRate::from_basis_points(10_001).is_err());
    }
}
