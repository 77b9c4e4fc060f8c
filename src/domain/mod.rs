//! Domain types for coach pricing and earnings.
//!
//! This module provides:
//! - Exact money in integer minor units, and percentages backed by rust_decimal
//! - Identifier newtypes and non-empty id sets
//! - Rate configuration (base rates, time-based rules, special periods)
//! - Discount codes with tagged scope/eligibility variants
//! - Payments, refunds and payout adjustments

pub mod decimal;
pub mod discount;
pub mod money;
pub mod payment;
pub mod primitives;
pub mod rates;

pub use decimal::Percent;
pub use discount::{
    Activation, AppliesTo, Buyer, DiscountCode, DiscountValue, Eligibility, EntityRef,
};
pub use money::{Currency, Money};
pub use payment::{
    Adjustment, AdjustmentStatus, Payment, PayoutStatus, RateSnapshot, Refund,
};
pub use primitives::{
    AdjustmentId, BatchId, BuyerId, CoachId, DiscountId, IdSet, PaymentId, ProgramId,
    RefundEventId, RuleId, SegmentId, SessionTypeId,
};
pub use rates::{
    DateRange, DaysOfWeek, RateConfig, RateMutation, SessionKind, SpecialPeriod, TimeBasedRate,
    TimeRange,
};
