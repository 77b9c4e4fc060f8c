//! In-process store for tests and embedding.

use super::{
    is_candidate, AdjustmentRepository, DiscountRepository, PaymentRepository, PayoutLedger,
    RateConfigRepository, RecordedAdjustment, StoreError,
};
use crate::domain::{
    Adjustment, AdjustmentId, AdjustmentStatus, BatchId, BuyerId, CoachId, Currency,
    DiscountCode, DiscountId, EntityRef, Payment, PaymentId, RateConfig, RateMutation, Refund,
    RefundEventId,
};
use crate::engine::{EarningsCalculator, PayoutBatchPlan, PayoutPlanner, RateEditor};
use crate::error::PricingError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct State {
    rates: HashMap<CoachId, RateConfig>,
    discounts: BTreeMap<DiscountId, DiscountCode>,
    /// (discount, coach, buyer) per redemption.
    redemptions: Vec<(DiscountId, CoachId, BuyerId)>,
    payments: BTreeMap<PaymentId, Payment>,
    /// Keyed by de-duplication key.
    adjustments: BTreeMap<String, Adjustment>,
    batches: BTreeSet<BatchId>,
}

/// All repositories over one `RwLock`; every check-and-write happens under a
/// single write guard.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a discount.
    pub async fn insert_discount(&self, code: DiscountCode) -> Result<(), StoreError> {
        code.validate().map_err(crate::error::PricingError::from)?;
        self.state
            .write()
            .await
            .discounts
            .insert(code.id.clone(), code);
        Ok(())
    }

    pub async fn get_discount(&self, id: &DiscountId) -> Option<DiscountCode> {
        self.state.read().await.discounts.get(id).cloned()
    }

    /// Record a payment. Returns false if it already exists.
    pub async fn insert_payment(&self, payment: Payment) -> bool {
        let mut state = self.state.write().await;
        if state.payments.contains_key(&payment.id) {
            return false;
        }
        state.payments.insert(payment.id.clone(), payment);
        true
    }

    /// Attach a refund to a payment. Returns false for a repeated refund event.
    ///
    /// A newly recorded refund is never part of a past payout.
    pub async fn insert_refund(&self, payment_id: &PaymentId, mut refund: Refund) -> Result<bool, StoreError> {
        refund.deducted_at_payout = false;
        let mut state = self.state.write().await;
        let payment = state
            .payments
            .get_mut(payment_id)
            .ok_or_else(|| StoreError::NotFound(format!("payment {}", payment_id)))?;
        if payment.refund(&refund.refund_event_id).is_some() {
            return Ok(false);
        }
        payment.refunds.push(refund);
        Ok(true)
    }
}

#[async_trait]
impl RateConfigRepository for MemoryStore {
    async fn load(&self, coach_id: &CoachId) -> Result<Option<RateConfig>, StoreError> {
        Ok(self.state.read().await.rates.get(coach_id).cloned())
    }

    async fn create_if_absent(&self, config: &RateConfig) -> Result<RateConfig, StoreError> {
        let mut state = self.state.write().await;
        let stored = state
            .rates
            .entry(config.coach_id.clone())
            .or_insert_with(|| config.clone());
        Ok(stored.clone())
    }

    async fn save(
        &self,
        coach_id: &CoachId,
        expected_version: u64,
        mutation: &RateMutation,
    ) -> Result<RateConfig, StoreError> {
        let mut state = self.state.write().await;
        let current = state
            .rates
            .get(coach_id)
            .ok_or_else(|| StoreError::NotFound(format!("rate config for {}", coach_id)))?;
        if current.version != expected_version {
            return Err(StoreError::VersionConflict {
                expected: expected_version,
                current: current.version,
            });
        }
        let next = RateEditor::apply(current, mutation)?;
        state.rates.insert(coach_id.clone(), next.clone());
        Ok(next)
    }
}

#[async_trait]
impl DiscountRepository for MemoryStore {
    async fn find_candidates(
        &self,
        coach_id: &CoachId,
        entity: &EntityRef,
        buyer_id: &BuyerId,
    ) -> Result<Vec<DiscountCode>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .discounts
            .values()
            .filter(|c| is_candidate(c, coach_id, entity, buyer_id))
            .cloned()
            .collect())
    }

    async fn buyer_redemptions(
        &self,
        coach_id: &CoachId,
        buyer_id: &BuyerId,
    ) -> Result<BTreeSet<DiscountId>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .redemptions
            .iter()
            .filter(|(_, c, b)| c == coach_id && b == buyer_id)
            .map(|(d, _, _)| d.clone())
            .collect())
    }

    async fn increment_usage(
        &self,
        discount_id: &DiscountId,
        expected_usage_limit: Option<u32>,
        buyer_id: &BuyerId,
    ) -> Result<DiscountCode, StoreError> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let code = state
            .discounts
            .get_mut(discount_id)
            .ok_or_else(|| StoreError::NotFound(format!("discount {}", discount_id)))?;

        if code.usage_limit != expected_usage_limit || code.exhausted() {
            return Err(StoreError::LimitExceeded(discount_id.to_string()));
        }
        if code.limit_to_one_per_customer
            && state
                .redemptions
                .iter()
                .any(|(d, _, b)| d == discount_id && b == buyer_id)
        {
            return Err(StoreError::AlreadyUsed {
                discount_id: discount_id.to_string(),
                buyer_id: buyer_id.to_string(),
            });
        }

        code.usage_count += 1;
        state
            .redemptions
            .push((discount_id.clone(), code.coach_id.clone(), buyer_id.clone()));
        debug!(discount_id = %discount_id, usage_count = code.usage_count, "Redeemed discount");
        Ok(code.clone())
    }
}

#[async_trait]
impl PaymentRepository for MemoryStore {
    async fn get(&self, payment_id: &PaymentId) -> Result<Option<Payment>, StoreError> {
        Ok(self.state.read().await.payments.get(payment_id).cloned())
    }

    async fn list_unpaid(&self, coach_id: &CoachId) -> Result<Vec<Payment>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .payments
            .values()
            .filter(|p| &p.coach_id == coach_id && p.paid_at().is_none())
            .cloned()
            .collect())
    }

    async fn mark_paid(
        &self,
        payment_ids: &[PaymentId],
        paid_at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut state = self.state.write().await;
        let mut changed = 0;
        for id in payment_ids {
            if let Some(payment) = state.payments.get_mut(id) {
                if payment.settle(paid_at) {
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }
}

#[async_trait]
impl AdjustmentRepository for MemoryStore {
    async fn create(&self, adjustment: &Adjustment, dedupe_key: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.adjustments.contains_key(dedupe_key) {
            return Err(StoreError::AlreadyExists(format!("adjustment {}", dedupe_key)));
        }
        state
            .adjustments
            .insert(dedupe_key.to_string(), adjustment.clone());
        Ok(())
    }

    async fn list_for_payment(&self, payment_id: &PaymentId) -> Result<Vec<Adjustment>, StoreError> {
        Ok(sorted(
            self.state
                .read()
                .await
                .adjustments
                .values()
                .filter(|a| &a.payment_id == payment_id)
                .cloned()
                .collect(),
        ))
    }

    async fn list_pending(&self, coach_id: &CoachId) -> Result<Vec<Adjustment>, StoreError> {
        Ok(sorted(
            self.state
                .read()
                .await
                .adjustments
                .values()
                .filter(|a| &a.coach_id == coach_id && a.is_pending())
                .cloned()
                .collect(),
        ))
    }

    async fn mark_applied(&self, ids: &[AdjustmentId], batch_id: &BatchId) -> Result<usize, StoreError> {
        let mut state = self.state.write().await;
        let mut changed = 0;
        for adjustment in state.adjustments.values_mut() {
            if adjustment.is_pending() && ids.contains(&adjustment.id) {
                adjustment.status = AdjustmentStatus::Applied {
                    batch_id: batch_id.clone(),
                };
                changed += 1;
            }
        }
        Ok(changed)
    }
}

#[async_trait]
impl PayoutLedger for MemoryStore {
    async fn record_refund_adjustment(
        &self,
        payment_id: &PaymentId,
        refund_event_id: &RefundEventId,
        now: DateTime<Utc>,
    ) -> Result<(Payment, RecordedAdjustment), StoreError> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let payment = state
            .payments
            .get(payment_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("payment {}", payment_id)))?;
        let refund = payment.refund(refund_event_id).ok_or_else(|| {
            StoreError::NotFound(format!("refund {} on payment {}", refund_event_id, payment_id))
        })?;

        let key = Adjustment::dedupe_key(payment_id, refund_event_id);
        if let Some(recorded) = state.adjustments.get(&key) {
            return Ok((payment.clone(), RecordedAdjustment::AlreadyRecorded(recorded.clone())));
        }

        let existing: Vec<Adjustment> = state
            .adjustments
            .values()
            .filter(|a| &a.payment_id == payment_id)
            .cloned()
            .collect();
        let planned = EarningsCalculator::plan_adjustment(&payment, refund, &existing, now)
            .map_err(PricingError::from)?;

        let recorded = match planned {
            Some(adjustment) => {
                state.adjustments.insert(key, adjustment.clone());
                RecordedAdjustment::Created(adjustment)
            }
            None => RecordedAdjustment::NotNeeded,
        };
        Ok((payment, recorded))
    }

    async fn settle_batch(
        &self,
        coach_id: &CoachId,
        batch_id: &BatchId,
        currency: &Currency,
        paid_at: DateTime<Utc>,
    ) -> Result<PayoutBatchPlan, StoreError> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        if state.batches.contains(batch_id) {
            return Err(StoreError::AlreadyExists(format!("payout batch {}", batch_id)));
        }

        let payments: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| &p.coach_id == coach_id && p.paid_at().is_none())
            .cloned()
            .collect();
        let pending: Vec<Adjustment> = state
            .adjustments
            .values()
            .filter(|a| &a.coach_id == coach_id && a.is_pending())
            .cloned()
            .collect();
        let plan = PayoutPlanner::plan(coach_id, batch_id, currency, &payments, &pending)
            .map_err(PricingError::from)?;

        for id in &plan.payment_ids {
            if let Some(payment) = state.payments.get_mut(id) {
                payment.settle(paid_at);
            }
        }
        for adjustment in state.adjustments.values_mut() {
            if adjustment.is_pending() && plan.applied_adjustments.contains(&adjustment.id) {
                adjustment.status = AdjustmentStatus::Applied {
                    batch_id: batch_id.clone(),
                };
            }
        }
        state.batches.insert(batch_id.clone());

        info!(coach_id = %coach_id, batch_id = %batch_id, payout = %plan.payout_total, "Settled payout batch");
        Ok(plan)
    }
}

fn sorted(mut adjustments: Vec<Adjustment>) -> Vec<Adjustment> {
    adjustments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    adjustments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        Activation, AppliesTo, DiscountValue, Eligibility, Money, PayoutStatus, Percent,
        RateSnapshot,
    };

    fn discount(limit: Option<u32>, once: bool) -> DiscountCode {
        DiscountCode {
            id: DiscountId::new("d1"),
            coach_id: CoachId::new("c1"),
            activation: Activation::Code {
                code: "SAVE".to_string(),
            },
            value: DiscountValue::fixed(Money::from_minor(500, "CHF").unwrap()).unwrap(),
            applies_to: AppliesTo::PlatformWide,
            eligibility: Eligibility::All,
            is_active: true,
            start_date: None,
            expiry_date: None,
            usage_limit: limit,
            usage_count: 0,
            limit_to_one_per_customer: once,
            minimum_purchase_amount: None,
        }
    }

    #[test]
    fn test_increment_respects_limit() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            store.insert_discount(discount(Some(2), false)).await.unwrap();
            let id = DiscountId::new("d1");

            store.increment_usage(&id, Some(2), &BuyerId::new("a")).await.unwrap();
            let code = store.increment_usage(&id, Some(2), &BuyerId::new("b")).await.unwrap();
            assert_eq!(code.usage_count, 2);

            let err = store
                .increment_usage(&id, Some(2), &BuyerId::new("c"))
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::LimitExceeded(_)));
        });
    }

    #[test]
    fn test_changed_limit_rejected() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            store.insert_discount(discount(Some(5), false)).await.unwrap();
            let err = store
                .increment_usage(&DiscountId::new("d1"), Some(10), &BuyerId::new("a"))
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::LimitExceeded(_)));
        });
    }

    #[test]
    fn test_one_per_customer() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            store.insert_discount(discount(None, true)).await.unwrap();
            let id = DiscountId::new("d1");
            let buyer = BuyerId::new("a");

            store.increment_usage(&id, None, &buyer).await.unwrap();
            let err = store.increment_usage(&id, None, &buyer).await.unwrap_err();
            assert!(matches!(err, StoreError::AlreadyUsed { .. }));

            let redeemed = store
                .buyer_redemptions(&CoachId::new("c1"), &buyer)
                .await
                .unwrap();
            assert!(redeemed.contains(&id));
            assert_eq!(store.get_discount(&id).await.unwrap().usage_count, 1);
        });
    }

    #[test]
    fn test_save_checks_version() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let coach = CoachId::new("c1");
            let config =
                RateConfig::onboarding_default(coach.clone(), Currency::new("CHF").unwrap());
            store.create_if_absent(&config).await.unwrap();

            let rate = Money::from_minor(9_000, "CHF").unwrap();
            let saved = store
                .save(&coach, 0, &RateMutation::SetBaseRate { rate: rate.clone() })
                .await
                .unwrap();
            assert_eq!(saved.version, 1);

            let err = store
                .save(&coach, 0, &RateMutation::SetBaseRate { rate })
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                StoreError::VersionConflict {
                    expected: 0,
                    current: 1
                }
            ));
        });
    }

    #[test]
    fn test_adjustment_dedupe() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let payment_id = PaymentId::new("p1");
            let refund_id = RefundEventId::new("r1");
            let adjustment = Adjustment {
                id: Adjustment::compute_id(&payment_id, &refund_id),
                payment_id: payment_id.clone(),
                coach_id: CoachId::new("c1"),
                refund_event_id: refund_id.clone(),
                amount: Money::from_minor(100, "CHF").unwrap(),
                created_at: Utc::now(),
                status: AdjustmentStatus::Pending,
            };
            let key = Adjustment::dedupe_key(&payment_id, &refund_id);

            store.create(&adjustment, &key).await.unwrap();
            let err = store.create(&adjustment, &key).await.unwrap_err();
            assert!(matches!(err, StoreError::AlreadyExists(_)));
            assert_eq!(store.list_for_payment(&payment_id).await.unwrap().len(), 1);

            let applied = store
                .mark_applied(&[adjustment.id.clone()], &BatchId::new("b1"))
                .await
                .unwrap();
            assert_eq!(applied, 1);
            assert!(store
                .list_pending(&CoachId::new("c1"))
                .await
                .unwrap()
                .is_empty());
        });
    }

    #[test]
    fn test_settle_batch_then_late_refund() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let chf = |amount| Money::from_minor(amount, "CHF").unwrap();
            let coach = CoachId::new("c1");
            let p1 = PaymentId::new("p1");
            store
                .insert_payment(Payment {
                    id: p1.clone(),
                    coach_id: coach.clone(),
                    gross_amount: chf(10_000),
                    rate_snapshot: RateSnapshot {
                        platform_fee_rate: Percent::zero(),
                        vat_rate: Percent::zero(),
                        processing_fee_rate: Percent::zero(),
                    },
                    refunds: vec![],
                    payout_status: PayoutStatus::Pending,
                })
                .await;
            let now = Utc::now();
            store
                .insert_refund(&p1, Refund::new(RefundEventId::new("r1"), chf(1_000), now))
                .await
                .unwrap();

            let currency = Currency::new("CHF").unwrap();
            let batch = BatchId::new("b1");
            let plan = store.settle_batch(&coach, &batch, &currency, now).await.unwrap();
            assert_eq!(plan.payout_total, chf(9_000));
            let err = store
                .settle_batch(&coach, &batch, &currency, now)
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::AlreadyExists(_)));

            let (_, recorded) = store
                .record_refund_adjustment(&p1, &RefundEventId::new("r1"), now)
                .await
                .unwrap();
            assert_eq!(recorded, RecordedAdjustment::NotNeeded);

            store
                .insert_refund(&p1, Refund::new(RefundEventId::new("r2"), chf(500), now))
                .await
                .unwrap();
            let (_, recorded) = store
                .record_refund_adjustment(&p1, &RefundEventId::new("r2"), now)
                .await
                .unwrap();
            assert!(matches!(recorded, RecordedAdjustment::Created(ref a) if a.amount == chf(500)));
        });
    }
}
