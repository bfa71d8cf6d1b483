//! Safe financial arithmetic using fixed-point decimal
//!
//! Plan prices are carried as `Amount` values in minor currency units
//! (cents). **Never use f64 for financial calculations!**
//!
//! - Uses `Decimal` internally (28-29 significant digits)
//! - All arithmetic is checked (no silent wrap-around)
//! - Serializes as string (preserves precision)

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Monetary amount in minor currency units with fixed-point precision.
///
/// # Examples
///
/// ```rust
/// use subscription_ledger::Amount;
///
/// let a = Amount::from_minor(999);
/// let b = Amount::from_minor(2999);
/// let total = a.checked_add(&b).unwrap();
/// assert_eq!(total.as_minor(), 3998);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount {
    value: Decimal,
}

impl Amount {
    /// Create from minor units (e.g. cents).
    pub fn from_minor(minor: i64) -> Self {
        Self {
            value: Decimal::from(minor),
        }
    }

    /// Get the value in minor units. Clamps to `i64::MAX` if it does not fit.
    pub fn as_minor(&self) -> i64 {
        self.value.try_into().unwrap_or(i64::MAX)
    }

    /// Zero amount.
    pub fn zero() -> Self {
        Self {
            value: Decimal::ZERO,
        }
    }

    /// Check if the amount is zero.
    pub fn is_zero(&self) -> bool {
        self.value.is_zero()
    }

    /// Checked addition (returns None on overflow).
    pub fn checked_add(&self, other: &Self) -> Option<Self> {
        self.value
            .checked_add(other.value)
            .map(|value| Self { value })
    }

    /// Checked subtraction (returns None on overflow).
    pub fn checked_sub(&self, other: &Self) -> Option<Self> {
        self.value
            .checked_sub(other.value)
            .map(|value| Self { value })
    }

    /// Parse from a decimal string (e.g. "999").
    pub fn from_str_checked(s: &str) -> Result<Self, String> {
        Decimal::from_str(s)
            .map(|value| Self { value })
            .map_err(|e| format!("invalid amount: {}", e))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl FromStr for Amount {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_checked(s)
    }
}
