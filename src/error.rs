//! Error taxonomy for pricing and earnings computations.
//!
//! Validation and redemption errors are user-facing and recoverable.
//! Financial invariant errors signal upstream data-integrity problems and are
//! fatal to the operation that raised them.

use thiserror::Error;

/// Bad input shape, rejected before any computation takes place.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid currency code: {0}")]
    InvalidCurrency(String),
    #[error("{field} must be between {min} and {max}, got {value}")]
    PercentOutOfRange {
        field: &'static str,
        min: String,
        max: String,
        value: String,
    },
    #[error("{0} must be greater than zero")]
    NonPositiveAmount(&'static str),
    #[error("{0} must not be negative")]
    NegativeAmount(&'static str),
    #[error("{0} must not be empty")]
    EmptySet(&'static str),
    #[error("day of week {0} is outside 0..=6")]
    InvalidDayOfWeek(u8),
    #[error("range start must be before end ({start} >= {end})")]
    InvalidRange { start: String, end: String },
    #[error("discount code text must not be blank")]
    BlankCode,
    #[error("rule {0} already exists")]
    DuplicateRule(String),
    #[error("rule {0} does not exist")]
    UnknownRule(String),
    #[error("{0} must use the rate configuration currency {1}")]
    ForeignCurrency(&'static str, String),
}

/// Write-time conflicts with existing state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictError {
    #[error(
        "special period {candidate} overlaps {existing} for session type {session_type}"
    )]
    OverlappingPeriod {
        candidate: String,
        existing: String,
        session_type: String,
    },
    #[error("version conflict: expected {expected}, current {current}")]
    VersionConflict { expected: u64, current: u64 },
    #[error("payout batch {0} was already recorded")]
    DuplicateBatch(String),
}

/// Reasons a discount cannot be applied to a cart.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RedemptionError {
    #[error("discount code not found")]
    CodeNotFound,
    #[error("discount code is not active yet")]
    CodeNotYetActive,
    #[error("discount code has expired")]
    CodeExpired,
    #[error("discount code usage limit reached")]
    CodeExhausted,
    #[error("discount code already used by this customer")]
    AlreadyUsed,
    #[error("discount code does not apply to this item")]
    ScopeMismatch,
    #[error("customer is not eligible for this discount code")]
    NotEligible,
    #[error("minimum purchase of {minimum} not met")]
    MinimumPurchaseNotMet { minimum: String },
}

/// Data-integrity violations in monetary computations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FinancialInvariantError {
    #[error("currency mismatch: {left} vs {right}")]
    CurrencyMismatch { left: String, right: String },
    #[error("amount overflow in monetary arithmetic")]
    AmountOverflow,
    #[error(
        "payment {payment_id}: refunded {refunded} exceeds gross {gross}"
    )]
    RefundExceedsGross {
        payment_id: String,
        gross: String,
        refunded: String,
    },
    #[error(
        "payment {payment_id}: refunded {refunded} exceeds net earning {net_earning} by {shortfall}"
    )]
    Shortfall {
        payment_id: String,
        net_earning: String,
        refunded: String,
        shortfall: String,
    },
}

/// Top-level error for every engine operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PricingError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Conflict(#[from] ConflictError),
    #[error(transparent)]
    Redemption(#[from] RedemptionError),
    #[error(transparent)]
    Financial(#[from] FinancialInvariantError),
}

impl PricingError {
    /// True for errors that should be surfaced to the user as a rejected
    /// request rather than treated as a failure of the system.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            PricingError::Validation(_) | PricingError::Redemption(_)
        )
    }
}
