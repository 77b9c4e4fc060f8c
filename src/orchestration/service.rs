use crate::config::Config;
use crate::domain::{
    Adjustment, BatchId, Buyer, BuyerId, CoachId, DiscountCode, EntityRef, Money, PaymentId,
    ProgramId, RateConfig, RateMutation, RateSnapshot, RefundEventId, SessionKind, SessionTypeId,
};
use crate::engine::{
    DiscountEngine, DiscountRequest, EarningsBreakdown, EarningsCalculator, PayoutBatchPlan,
    PayoutPlanner, RateResolver, ResolvedRate,
};
use crate::error::{ConflictError, PricingError, RedemptionError};
use crate::repository::{PricingStore, RecordedAdjustment, StoreError};
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// What is being bought.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QuoteItem {
    /// A session priced from the coach's rate config.
    Session {
        session_type_id: SessionTypeId,
        kind: SessionKind,
        /// Session start with the coach's UTC offset.
        start: DateTime<FixedOffset>,
    },
    /// A program sold at a fixed list price.
    Program { program_id: ProgramId, price: Money },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteRequest {
    pub coach_id: CoachId,
    pub item: QuoteItem,
    pub buyer: Buyer,
    pub entered_code: Option<String>,
    pub now: DateTime<Utc>,
}

/// Price shown at checkout, with the coach's expected earnings for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub coach_id: CoachId,
    pub buyer_id: BuyerId,
    pub entity: EntityRef,
    pub resolved_rate: Option<ResolvedRate>,
    pub raw_price: Money,
    pub discount: Option<DiscountCode>,
    pub discount_amount: Money,
    pub final_price: Money,
    pub rate_snapshot: RateSnapshot,
    pub earnings_preview: EarningsBreakdown,
}

/// Result of processing one refund event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundOutcome {
    pub breakdown: EarningsBreakdown,
    pub adjustment: Option<Adjustment>,
    /// False when the adjustment was recorded by an earlier delivery of the
    /// same refund event.
    pub adjustment_created: bool,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Pricing(#[from] PricingError),
    #[error(transparent)]
    Store(StoreError),
    #[error("{0} not found")]
    NotFound(String),
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Pricing(p) => ServiceError::Pricing(p),
            StoreError::VersionConflict { expected, current } => {
                ServiceError::Pricing(ConflictError::VersionConflict { expected, current }.into())
            }
            StoreError::NotFound(what) => ServiceError::NotFound(what),
            other => ServiceError::Store(other),
        }
    }
}

impl From<crate::error::FinancialInvariantError> for ServiceError {
    fn from(e: crate::error::FinancialInvariantError) -> Self {
        ServiceError::Pricing(e.into())
    }
}

/// Ties the pure engines to a store.
pub struct PricingService<R: PricingStore> {
    store: Arc<R>,
    config: Config,
}

impl<R: PricingStore> PricingService<R> {
    pub fn new(store: Arc<R>, config: Config) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<R> {
        &self.store
    }

    /// Load a coach's rate config, creating the onboarding default on first use.
    pub async fn rate_config(&self, coach_id: &CoachId) -> Result<RateConfig, ServiceError> {
        if let Some(config) = self.store.load(coach_id).await? {
            return Ok(config);
        }
        let default =
            RateConfig::onboarding_default(coach_id.clone(), self.config.default_currency.clone());
        info!(coach_id = %coach_id, currency = %self.config.default_currency, "Creating onboarding rate config");
        Ok(self.store.create_if_absent(&default).await?)
    }

    /// Price an item for a buyer. Nothing is written except a missing
    /// onboarding rate config.
    pub async fn quote(&self, request: &QuoteRequest) -> Result<Quote, ServiceError> {
        let (entity, raw_price, resolved_rate) = match &request.item {
            QuoteItem::Session {
                session_type_id,
                kind,
                start,
            } => {
                let config = self.rate_config(&request.coach_id).await?;
                let resolved = RateResolver::new(&config).resolve(session_type_id, *kind, start)?;
                (
                    EntityRef::Session(session_type_id.clone()),
                    resolved.price.clone(),
                    Some(resolved),
                )
            }
            QuoteItem::Program { program_id, price } => {
                (EntityRef::Program(program_id.clone()), price.clone(), None)
            }
        };

        let candidates = self
            .store
            .find_candidates(&request.coach_id, &entity, &request.buyer.id)
            .await?;
        let redeemed = self
            .store
            .buyer_redemptions(&request.coach_id, &request.buyer.id)
            .await?;

        let discount = DiscountEngine::new(&candidates, &redeemed).quote(&DiscountRequest {
            coach_id: request.coach_id.clone(),
            entity: entity.clone(),
            buyer: request.buyer.clone(),
            raw_price: raw_price.clone(),
            entered_code: request.entered_code.clone(),
            now: request.now,
        })?;

        let rate_snapshot = self.config.rate_snapshot();
        let earnings_preview =
            EarningsCalculator::preview(&discount.discounted_price, &rate_snapshot)?;

        info!(
            coach_id = %request.coach_id,
            buyer_id = %request.buyer.id,
            entity = %entity.id(),
            raw_price = %raw_price,
            final_price = %discount.discounted_price,
            discount_id = ?discount.discount.as_ref().map(|d| d.id.as_str()),
            "Quoted price"
        );

        Ok(Quote {
            coach_id: request.coach_id.clone(),
            buyer_id: request.buyer.id.clone(),
            entity,
            resolved_rate,
            raw_price,
            discount: discount.discount,
            discount_amount: discount.discount_amount,
            final_price: discount.discounted_price,
            rate_snapshot,
            earnings_preview,
        })
    }

    /// Redeem the quoted discount once the sale is confirmed.
    ///
    /// Returns the discount with its new usage count, or `None` when the quote
    /// carried no discount.
    pub async fn confirm_redemption(&self, quote: &Quote) -> Result<Option<DiscountCode>, ServiceError> {
        let Some(code) = &quote.discount else {
            return Ok(None);
        };

        match self
            .store
            .increment_usage(&code.id, code.usage_limit, &quote.buyer_id)
            .await
        {
            Ok(updated) => {
                info!(
                    discount_id = %updated.id,
                    buyer_id = %quote.buyer_id,
                    usage_count = updated.usage_count,
                    "Discount redeemed"
                );
                Ok(Some(updated))
            }
            Err(StoreError::LimitExceeded(_)) => {
                Err(PricingError::from(RedemptionError::CodeExhausted).into())
            }
            Err(StoreError::AlreadyUsed { .. }) => {
                Err(PricingError::from(RedemptionError::AlreadyUsed).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Apply a rate mutation, retrying when a concurrent writer bumped the
    /// version in between. Invalid or overlapping mutations fail immediately.
    pub async fn update_rates(
        &self,
        coach_id: &CoachId,
        mutation: &RateMutation,
    ) -> Result<RateConfig, ServiceError> {
        let mut attempt = 0;
        loop {
            let current = self.rate_config(coach_id).await?;
            match self.store.save(coach_id, current.version, mutation).await {
                Ok(saved) => {
                    info!(coach_id = %coach_id, version = saved.version, "Rate config updated");
                    return Ok(saved);
                }
                Err(StoreError::VersionConflict { expected, current })
                    if attempt < self.config.rate_write_retries =>
                {
                    attempt += 1;
                    warn!(
                        coach_id = %coach_id,
                        expected,
                        current,
                        attempt,
                        "Rate config version conflict, retrying"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Earnings breakdown of a stored payment.
    pub async fn earnings(&self, payment_id: &PaymentId) -> Result<EarningsBreakdown, ServiceError> {
        let payment = self
            .store
            .get(payment_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("payment {}", payment_id)))?;
        Ok(EarningsCalculator::breakdown(&payment)?)
    }

    /// Process a refund event already recorded against a payment.
    ///
    /// Safe to call repeatedly and concurrently: at most one adjustment is
    /// ever recorded per `(payment, refund event)`, and adjustments for one
    /// payment never add up to more than its net earning.
    pub async fn process_refund(
        &self,
        payment_id: &PaymentId,
        refund_event_id: &RefundEventId,
        now: DateTime<Utc>,
    ) -> Result<RefundOutcome, ServiceError> {
        let (payment, recorded) = self
            .store
            .record_refund_adjustment(payment_id, refund_event_id, now)
            .await?;
        let breakdown = EarningsCalculator::breakdown(&payment)?;

        let outcome = match recorded {
            RecordedAdjustment::Created(adjustment) => {
                info!(
                    payment_id = %payment_id,
                    refund_event_id = %refund_event_id,
                    adjustment_id = %adjustment.id,
                    amount = %adjustment.amount,
                    "Recorded payout adjustment"
                );
                RefundOutcome {
                    breakdown,
                    adjustment: Some(adjustment),
                    adjustment_created: true,
                }
            }
            RecordedAdjustment::AlreadyRecorded(adjustment) => RefundOutcome {
                breakdown,
                adjustment: Some(adjustment),
                adjustment_created: false,
            },
            RecordedAdjustment::NotNeeded => RefundOutcome {
                breakdown,
                adjustment: None,
                adjustment_created: false,
            },
        };
        Ok(outcome)
    }

    /// Plan a payout batch without recording anything.
    pub async fn plan_payout(
        &self,
        coach_id: &CoachId,
        batch_id: &BatchId,
    ) -> Result<PayoutBatchPlan, ServiceError> {
        let config = self.rate_config(coach_id).await?;
        let payments = self.store.list_unpaid(coach_id).await?;
        let pending = self.store.list_pending(coach_id).await?;
        Ok(PayoutPlanner::plan(
            coach_id,
            batch_id,
            config.currency(),
            &payments,
            &pending,
        )?)
    }

    /// Plan a payout batch and record it in one atomic step: included
    /// payments become paid and applied adjustments are tagged with the
    /// batch id. A batch id can be recorded only once.
    pub async fn payout_batch(
        &self,
        coach_id: &CoachId,
        batch_id: &BatchId,
        paid_at: DateTime<Utc>,
    ) -> Result<PayoutBatchPlan, ServiceError> {
        let config = self.rate_config(coach_id).await?;
        let plan = match self
            .store
            .settle_batch(coach_id, batch_id, config.currency(), paid_at)
            .await
        {
            Ok(plan) => plan,
            Err(StoreError::AlreadyExists(_)) => {
                warn!(coach_id = %coach_id, batch_id = %batch_id, "Payout batch already recorded");
                return Err(PricingError::from(ConflictError::DuplicateBatch(batch_id.to_string())).into());
            }
            Err(e) => return Err(e.into()),
        };
        info!(
            coach_id = %coach_id,
            batch_id = %batch_id,
            payout = %plan.payout_total,
            "Payout batch recorded"
        );
        Ok(plan)
    }
}
