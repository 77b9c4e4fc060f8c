//! Percentage type backed by rust_decimal.
//!
//! Used for fee rates and discount percentages. Values are stored as a
//! percentage (e.g. `9.9` for 9.9%) and applied to minor-unit amounts with
//! half-up rounding.

use crate::error::ValidationError;
use rust_decimal::Decimal as RustDecimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A percentage in the closed range `[0, 100]`.
///
/// Serializes as a decimal string so rates survive JSON without float drift.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "RustDecimal", into = "RustDecimal")]
pub struct Percent(RustDecimal);

impl Percent {
    /// Create a percentage in `[0, 100]`.
    pub fn new(value: RustDecimal) -> Result<Self, ValidationError> {
        if value.is_sign_negative() && !value.is_zero() || value > RustDecimal::ONE_HUNDRED {
            return Err(ValidationError::PercentOutOfRange {
                field: "percentage",
                min: "0".to_string(),
                max: "100".to_string(),
                value: value.normalize().to_string(),
            });
        }
        Ok(Percent(value))
    }

    /// Create a discount percentage in `(0, 100]`.
    pub fn discount(value: RustDecimal) -> Result<Self, ValidationError> {
        let pct = Self::new(value)?;
        if pct.is_zero() {
            return Err(ValidationError::PercentOutOfRange {
                field: "discount percentage",
                min: "0 (exclusive)".to_string(),
                max: "100".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(pct)
    }

    /// Parse a percentage from a decimal string such as `"9.9"`.
    pub fn from_str_canonical(s: &str) -> Result<Self, ValidationError> {
        let value = RustDecimal::from_str(s.trim())
            .map_err(|_| ValidationError::PercentOutOfRange {
                field: "percentage",
                min: "0".to_string(),
                max: "100".to_string(),
                value: s.to_string(),
            })?;
        Self::new(value)
    }

    /// Get the underlying RustDecimal.
    pub fn inner(&self) -> RustDecimal {
        self.0
    }

    pub fn zero() -> Self {
        Percent(RustDecimal::ZERO)
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// The share of `minor` units this percentage represents, rounded half-up
    /// to a whole minor unit. Returns None on overflow.
    pub fn of_minor(&self, minor: i64) -> Option<i64> {
        use rust_decimal::prelude::ToPrimitive;
        use rust_decimal::RoundingStrategy;

        let share = RustDecimal::from(minor)
            .checked_mul(self.0)?
            .checked_div(RustDecimal::ONE_HUNDRED)?;
        share
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
            .to_i64()
    }
}

impl fmt::Display for Percent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0.normalize())
    }
}

impl TryFrom<RustDecimal> for Percent {
    type Error = ValidationError;

    fn try_from(value: RustDecimal) -> Result<Self, Self::Error> {
        Percent::new(value)
    }
}

impl From<Percent> for RustDecimal {
    fn from(value: Percent) -> Self {
        value.0
    }
}

impl FromStr for Percent {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_canonical(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pct(s: &str) -> Percent {
        Percent::from_str_canonical(s).unwrap()
    }

    #[test]
    fn test_percent_bounds() {
        assert!(Percent::from_str_canonical("0").is_ok());
        assert!(Percent::from_str_canonical("100").is_ok());
        assert!(Percent::from_str_canonical("100.01").is_err());
        assert!(Percent::from_str_canonical("-1").is_err());
        assert!(Percent::from_str_canonical("abc").is_err());
    }

    #[test]
    fn test_discount_rejects_zero_and_above_hundred() {
        assert!(Percent::discount(RustDecimal::ZERO).is_err());
        assert!(Percent::discount(RustDecimal::from(150)).is_err());
        assert!(Percent::discount(RustDecimal::from(100)).is_ok());
    }

    #[test]
    fn test_of_minor_rounds_half_up() {
        assert_eq!(pct("9.9").of_minor(10_000), Some(990));
        assert_eq!(pct("50").of_minor(5), Some(3));
        assert_eq!(pct("50").of_minor(3), Some(2));
        assert_eq!(pct("33.3").of_minor(100), Some(33));
        assert_eq!(pct("0").of_minor(12_345), Some(0));
    }

    #[test]
    fn test_percent_json_is_string_and_validated() {
        let json = serde_json::to_string(&pct("9.9")).unwrap();
        assert_eq!(json, "\"9.9\"");

        let back: Percent = serde_json::from_str("\"2\"").unwrap();
        assert_eq!(back, pct("2"));

        assert!(serde_json::from_str::<Percent>("\"150\"").is_err());
    }

    #[test]
    fn test_percent_display() {
        assert_eq!(pct("9.90").to_string(), "9.9%");
    }
}
