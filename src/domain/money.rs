//! Fixed-point monetary amounts in integer minor units.

use crate::domain::Percent;
use crate::error::{FinancialInvariantError, ValidationError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// ISO-4217 currency code (three uppercase ASCII letters).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    /// Parse a currency code, normalizing to uppercase.
    pub fn new(code: &str) -> Result<Self, ValidationError> {
        let code = code.trim().to_ascii_uppercase();
        if code.len() != 3 || !code.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(ValidationError::InvalidCurrency(code));
        }
        Ok(Currency(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of decimal digits in the currency's minor unit.
    pub fn exponent(&self) -> u32 {
        match self.0.as_str() {
            "BIF" | "CLP" | "DJF" | "GNF" | "ISK" | "JPY" | "KMF" | "KRW" | "PYG" | "RWF"
            | "UGX" | "UYI" | "VND" | "VUV" | "XAF" | "XOF" | "XPF" => 0,
            "BHD" | "IQD" | "JOD" | "KWD" | "LYD" | "OMR" | "TND" => 3,
            _ => 2,
        }
    }
}

impl TryFrom<String> for Currency {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Currency::new(&value)
    }
}

impl From<Currency> for String {
    fn from(value: Currency) -> Self {
        value.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An amount of money: integer minor units plus currency.
///
/// Crosses every external boundary as `{"amount": <minor units>, "currency": "CHF"}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    pub amount: i64,
    pub currency: Currency,
}

impl Money {
    pub fn new(amount: i64, currency: Currency) -> Self {
        Money { amount, currency }
    }

    pub fn zero(currency: Currency) -> Self {
        Money::new(0, currency)
    }

    /// Build from a currency code string, for callers holding raw boundary data.
    pub fn from_minor(amount: i64, currency: &str) -> Result<Self, ValidationError> {
        Ok(Money::new(amount, Currency::new(currency)?))
    }

    pub fn is_zero(&self) -> bool {
        self.amount == 0
    }

    pub fn is_negative(&self) -> bool {
        self.amount < 0
    }

    fn same_currency(&self, other: &Money) -> Result<(), FinancialInvariantError> {
        if self.currency != other.currency {
            return Err(FinancialInvariantError::CurrencyMismatch {
                left: self.currency.to_string(),
                right: other.currency.to_string(),
            });
        }
        Ok(())
    }

    pub fn checked_add(&self, other: &Money) -> Result<Money, FinancialInvariantError> {
        self.same_currency(other)?;
        let amount = self
            .amount
            .checked_add(other.amount)
            .ok_or(FinancialInvariantError::AmountOverflow)?;
        Ok(Money::new(amount, self.currency.clone()))
    }

    pub fn checked_sub(&self, other: &Money) -> Result<Money, FinancialInvariantError> {
        self.same_currency(other)?;
        let amount = self
            .amount
            .checked_sub(other.amount)
            .ok_or(FinancialInvariantError::AmountOverflow)?;
        Ok(Money::new(amount, self.currency.clone()))
    }

    /// Subtract, flooring the result at zero.
    pub fn saturating_sub(&self, other: &Money) -> Result<Money, FinancialInvariantError> {
        let diff = self.checked_sub(other)?;
        Ok(if diff.is_negative() {
            Money::zero(self.currency.clone())
        } else {
            diff
        })
    }

    pub fn min(&self, other: &Money) -> Result<Money, FinancialInvariantError> {
        self.same_currency(other)?;
        Ok(if other.amount < self.amount {
            other.clone()
        } else {
            self.clone()
        })
    }

    /// Currency-checked `self < other`.
    pub fn lt(&self, other: &Money) -> Result<bool, FinancialInvariantError> {
        self.same_currency(other)?;
        Ok(self.amount < other.amount)
    }

    /// `pct` of this amount, rounded half-up to the minor unit.
    pub fn percent(&self, pct: Percent) -> Result<Money, FinancialInvariantError> {
        let amount = pct
            .of_minor(self.amount)
            .ok_or(FinancialInvariantError::AmountOverflow)?;
        Ok(Money::new(amount, self.currency.clone()))
    }

    /// Sum an iterator of amounts, all in `currency`.
    pub fn sum<'a, I>(currency: &Currency, items: I) -> Result<Money, FinancialInvariantError>
    where
        I: IntoIterator<Item = &'a Money>,
    {
        items
            .into_iter()
            .try_fold(Money::zero(currency.clone()), |acc, m| acc.checked_add(m))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let exp = self.currency.exponent();
        if exp == 0 {
            return write!(f, "{} {}", self.amount, self.currency);
        }
        let scale = 10i64.pow(exp);
        let sign = if self.amount < 0 { "-" } else { "" };
        let abs = self.amount.unsigned_abs();
        write!(
            f,
            "{}{}.{:0width$} {}",
            sign,
            abs / scale as u64,
            abs % scale as u64,
            self.currency,
            width = exp as usize
        )
    }
}
