//! Storage abstraction for rate configs, discounts, payments and adjustments.
//!
//! The engines never touch storage. Everything that must be atomic across
//! concurrent callers (version-checked rate writes, usage increments,
//! adjustment caps, batch settlement) is the store's job and lives behind
//! these traits.

use crate::domain::{
    Adjustment, AdjustmentId, BatchId, BuyerId, CoachId, Currency, DiscountCode, DiscountId,
    EntityRef, Payment, PaymentId, RateConfig, RateMutation, RefundEventId,
};
use crate::engine::PayoutBatchPlan;
use crate::error::PricingError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

pub mod memory;

pub use memory::MemoryStore;

/// Per-coach rate configuration with optimistic concurrency.
#[async_trait]
pub trait RateConfigRepository: Send + Sync + fmt::Debug {
    /// Load a coach's config, including its current version.
    async fn load(&self, coach_id: &CoachId) -> Result<Option<RateConfig>, StoreError>;

    /// Store a new config unless one already exists; returns the stored config
    /// either way.
    async fn create_if_absent(&self, config: &RateConfig) -> Result<RateConfig, StoreError>;

    /// Apply `mutation` if the stored version still equals `expected_version`.
    ///
    /// # Errors
    /// `VersionConflict` when another writer got there first, `Pricing` when
    /// the mutation itself is invalid or overlaps an existing period.
    async fn save(
        &self,
        coach_id: &CoachId,
        expected_version: u64,
        mutation: &RateMutation,
    ) -> Result<RateConfig, StoreError>;
}

#[async_trait]
pub trait DiscountRepository: Send + Sync + fmt::Debug {
    /// Discounts that could apply to `entity` for `buyer_id`.
    ///
    /// Every code-activated discount of the coach is returned, so that an
    /// entered code is always found and its first failing check reported.
    /// Automatic discounts that cannot apply to the entity or buyer may be
    /// left out.
    async fn find_candidates(
        &self,
        coach_id: &CoachId,
        entity: &EntityRef,
        buyer_id: &BuyerId,
    ) -> Result<Vec<DiscountCode>, StoreError>;

    /// Discounts the buyer has redeemed with this coach.
    async fn buyer_redemptions(
        &self,
        coach_id: &CoachId,
        buyer_id: &BuyerId,
    ) -> Result<BTreeSet<DiscountId>, StoreError>;

    /// Atomically check the usage limit and record one redemption.
    ///
    /// The increment only succeeds while the stored limit still equals
    /// `expected_usage_limit` and `usage_count` is below it.
    ///
    /// # Errors
    /// `LimitExceeded` when the limit is reached (or changed), `AlreadyUsed`
    /// when the code is one-per-customer and `buyer_id` already redeemed it.
    async fn increment_usage(
        &self,
        discount_id: &DiscountId,
        expected_usage_limit: Option<u32>,
        buyer_id: &BuyerId,
    ) -> Result<DiscountCode, StoreError>;
}

/// Read access to payments recorded by the payment pipeline.
#[async_trait]
pub trait PaymentRepository: Send + Sync + fmt::Debug {
    async fn get(&self, payment_id: &PaymentId) -> Result<Option<Payment>, StoreError>;

    /// Payments of the coach not yet included in a payout.
    async fn list_unpaid(&self, coach_id: &CoachId) -> Result<Vec<Payment>, StoreError>;

    /// Record that `payment_ids` were paid out at `paid_at`, settling every
    /// refund recorded against them so far. Already paid payments keep their
    /// original timestamp.
    async fn mark_paid(
        &self,
        payment_ids: &[PaymentId],
        paid_at: DateTime<Utc>,
    ) -> Result<usize, StoreError>;
}

/// The adjustment ledger.
#[async_trait]
pub trait AdjustmentRepository: Send + Sync + fmt::Debug {
    /// Insert an adjustment once per `dedupe_key`.
    ///
    /// # Errors
    /// `AlreadyExists` if an adjustment with the same key was recorded before.
    async fn create(&self, adjustment: &Adjustment, dedupe_key: &str) -> Result<(), StoreError>;

    async fn list_for_payment(&self, payment_id: &PaymentId)
        -> Result<Vec<Adjustment>, StoreError>;

    /// Pending adjustments of the coach, oldest first.
    async fn list_pending(&self, coach_id: &CoachId) -> Result<Vec<Adjustment>, StoreError>;

    /// Mark pending adjustments as applied in `batch_id`. Returns how many
    /// changed state.
    async fn mark_applied(
        &self,
        ids: &[AdjustmentId],
        batch_id: &BatchId,
    ) -> Result<usize, StoreError>;
}

/// What `record_refund_adjustment` did for one refund event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedAdjustment {
    Created(Adjustment),
    /// An earlier delivery of the same event recorded this adjustment.
    AlreadyRecorded(Adjustment),
    /// The refund reduced the payment's own payout, or nothing was left to
    /// claw back.
    NotNeeded,
}

/// Read-plan-write operations over payments and adjustments. Each call runs
/// as one atomic unit, so concurrent callers always plan against the state
/// they write over.
#[async_trait]
pub trait PayoutLedger: Send + Sync + fmt::Debug {
    /// Plan and record the adjustment for one refund event.
    ///
    /// Returns the payment as it was when the adjustment was planned. The sum
    /// of adjustments recorded for a payment never exceeds its net earning,
    /// however many refund events are processed at once.
    ///
    /// # Errors
    /// `NotFound` for an unknown payment or refund event.
    async fn record_refund_adjustment(
        &self,
        payment_id: &PaymentId,
        refund_event_id: &RefundEventId,
        now: DateTime<Utc>,
    ) -> Result<(Payment, RecordedAdjustment), StoreError>;

    /// Plan a payout batch and record it: included payments become paid,
    /// their refunds are settled with them and applied adjustments are
    /// tagged with the batch id.
    ///
    /// # Errors
    /// `AlreadyExists` when `batch_id` was recorded before.
    async fn settle_batch(
        &self,
        coach_id: &CoachId,
        batch_id: &BatchId,
        currency: &Currency,
        paid_at: DateTime<Utc>,
    ) -> Result<PayoutBatchPlan, StoreError>;
}

/// A store implementing every repository the pricing service needs.
pub trait PricingStore:
    RateConfigRepository
    + DiscountRepository
    + PaymentRepository
    + AdjustmentRepository
    + PayoutLedger
{
}

impl<T> PricingStore for T where
    T: RateConfigRepository
        + DiscountRepository
        + PaymentRepository
        + AdjustmentRepository
        + PayoutLedger
{
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("version conflict: expected {expected}, current {current}")]
    VersionConflict { expected: u64, current: u64 },
    #[error("usage limit reached for discount {0}")]
    LimitExceeded(String),
    #[error("discount {discount_id} already used by buyer {buyer_id}")]
    AlreadyUsed {
        discount_id: String,
        buyer_id: String,
    },
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("concurrent update: {0}")]
    Conflict(String),
    #[error(transparent)]
    Pricing(#[from] PricingError),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Shared pre-filter for `find_candidates`.
pub(crate) fn is_candidate(
    code: &DiscountCode,
    coach_id: &CoachId,
    entity: &EntityRef,
    buyer_id: &BuyerId,
) -> bool {
    if &code.coach_id != coach_id {
        return false;
    }
    if !code.activation.is_automatic() {
        return true;
    }
    let buyer_may_qualify = match &code.eligibility {
        crate::domain::Eligibility::Individuals(ids) => ids.contains(buyer_id),
        _ => true,
    };
    code.is_active && code.applies_to.matches(entity) && buyer_may_qualify
}
