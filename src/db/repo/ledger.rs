//! Atomic read-plan-write ledger operations for the repository.
//!
//! Each operation opens its transaction with a write, so SQLite hands it the
//! database write lock before anything is read. Concurrent callers queue on
//! `busy_timeout` and always plan against committed state.

use super::adjustments::{apply_adjustment, fetch_for_payment, fetch_pending, insert_adjustment};
use super::payments::{fetch_payment, fetch_unpaid, settle_payment};
use super::Repository;
use crate::domain::{Adjustment, BatchId, CoachId, Currency, Payment, PaymentId, RefundEventId};
use crate::engine::{EarningsCalculator, PayoutBatchPlan, PayoutPlanner};
use crate::error::PricingError;
use crate::repository::{PayoutLedger, RecordedAdjustment, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{error, info};

#[async_trait]
impl PayoutLedger for Repository {
    async fn record_refund_adjustment(
        &self,
        payment_id: &PaymentId,
        refund_event_id: &RefundEventId,
        now: DateTime<Utc>,
    ) -> Result<(Payment, RecordedAdjustment), StoreError> {
        let mut tx = self.pool.begin().await?;

        let touched = sqlx::query(
            r#"
            UPDATE refunds SET processed_at_ms = COALESCE(processed_at_ms, ?)
            WHERE payment_id = ? AND refund_event_id = ?
            "#,
        )
        .bind(now.timestamp_millis())
        .bind(payment_id.as_str())
        .bind(refund_event_id.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let payment = fetch_payment(&mut *tx, payment_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("payment {}", payment_id)))?;
        let refund = match payment.refund(refund_event_id) {
            Some(refund) if touched > 0 => refund.clone(),
            _ => {
                return Err(StoreError::NotFound(format!(
                    "refund {} on payment {}",
                    refund_event_id, payment_id
                )))
            }
        };

        let existing = fetch_for_payment(&mut *tx, payment_id).await?;
        if let Some(recorded) = existing
            .iter()
            .find(|a| &a.refund_event_id == refund_event_id)
        {
            let recorded = recorded.clone();
            tx.commit().await?;
            return Ok((payment, RecordedAdjustment::AlreadyRecorded(recorded)));
        }

        let planned = EarningsCalculator::plan_adjustment(&payment, &refund, &existing, now)
            .map_err(PricingError::from)?;
        let Some(adjustment) = planned else {
            tx.commit().await?;
            return Ok((payment, RecordedAdjustment::NotNeeded));
        };

        let dedupe_key = Adjustment::dedupe_key(payment_id, refund_event_id);
        if !insert_adjustment(&mut *tx, &adjustment, &dedupe_key).await? {
            return Err(StoreError::AlreadyExists(format!("adjustment {}", dedupe_key)));
        }
        tx.commit().await?;

        Ok((payment, RecordedAdjustment::Created(adjustment)))
    }

    async fn settle_batch(
        &self,
        coach_id: &CoachId,
        batch_id: &BatchId,
        currency: &Currency,
        paid_at: DateTime<Utc>,
    ) -> Result<PayoutBatchPlan, StoreError> {
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            r#"
            INSERT INTO payout_batches (batch_id, coach_id, paid_at_ms)
            VALUES (?, ?, ?)
            ON CONFLICT(batch_id) DO NOTHING
            "#,
        )
        .bind(batch_id.as_str())
        .bind(coach_id.as_str())
        .bind(paid_at.timestamp_millis())
        .execute(&mut *tx)
        .await?;
        if claimed.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(format!("payout batch {}", batch_id)));
        }

        let payments = fetch_unpaid(&mut *tx, coach_id).await?;
        let pending = fetch_pending(&mut *tx, coach_id).await?;
        let plan = PayoutPlanner::plan(coach_id, batch_id, currency, &payments, &pending)
            .map_err(PricingError::from)?;

        let mut paid = 0usize;
        for id in &plan.payment_ids {
            if settle_payment(&mut *tx, id, paid_at).await? {
                paid += 1;
            }
        }
        let mut applied = 0usize;
        for id in &plan.applied_adjustments {
            if apply_adjustment(&mut *tx, id, batch_id).await? {
                applied += 1;
            }
        }
        if paid != plan.payment_ids.len() || applied != plan.applied_adjustments.len() {
            error!(
                batch_id = %batch_id,
                planned_payments = plan.payment_ids.len(),
                paid,
                planned_adjustments = plan.applied_adjustments.len(),
                applied,
                "Payout batch state changed while settling"
            );
            return Err(StoreError::Conflict(format!("payout batch {}", batch_id)));
        }

        sqlx::query("UPDATE payout_batches SET payout_amount = ?, currency = ? WHERE batch_id = ?")
            .bind(plan.payout_total.amount)
            .bind(plan.payout_total.currency.as_str())
            .bind(batch_id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(
            coach_id = %coach_id,
            batch_id = %batch_id,
            payments = paid,
            adjustments = applied,
            payout = %plan.payout_total,
            "Settled payout batch"
        );
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::setup_test_db;
    use super::*;
    use crate::domain::{Money, PayoutStatus, Percent, RateSnapshot, Refund};
    use crate::repository::{AdjustmentRepository, PaymentRepository};
    use chrono::TimeZone;

    fn chf(amount: i64) -> Money {
        Money::from_minor(amount, "CHF").unwrap()
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, day, 0, 0, 0).unwrap()
    }

    fn payment(id: &str) -> Payment {
        Payment {
            id: PaymentId::new(id),
            coach_id: CoachId::new("c1"),
            gross_amount: chf(10_000),
            rate_snapshot: RateSnapshot {
                platform_fee_rate: Percent::from_str_canonical("10").unwrap(),
                vat_rate: Percent::zero(),
                processing_fee_rate: Percent::zero(),
            },
            refunds: vec![],
            payout_status: PayoutStatus::Pending,
        }
    }

    #[tokio::test]
    async fn test_settle_batch_claims_batch_id_once() {
        let (repo, _temp) = setup_test_db().await;
        repo.insert_payment(&payment("p1")).await.unwrap();
        let currency = Currency::new("CHF").unwrap();
        let coach = CoachId::new("c1");
        let batch = BatchId::new("batch-1");

        let plan = repo.settle_batch(&coach, &batch, &currency, at(1)).await.unwrap();
        assert_eq!(plan.payout_total, chf(9_000));

        repo.insert_payment(&payment("p2")).await.unwrap();
        let err = repo
            .settle_batch(&coach, &batch, &currency, at(2))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));

        // The rejected retry left p2 for the next batch.
        let unpaid = repo.list_unpaid(&coach).await.unwrap();
        assert_eq!(unpaid.len(), 1);
        assert_eq!(unpaid[0].id, PaymentId::new("p2"));
    }

    #[tokio::test]
    async fn test_refund_recorded_after_settlement_needs_adjustment() {
        let (repo, _temp) = setup_test_db().await;
        let p1 = PaymentId::new("p1");
        repo.insert_payment(&payment("p1")).await.unwrap();
        repo.insert_refund(&p1, &Refund::new(RefundEventId::new("r1"), chf(1_000), at(1)))
            .await
            .unwrap();
        repo.settle_batch(&CoachId::new("c1"), &BatchId::new("b1"), &Currency::new("CHF").unwrap(), at(3))
            .await
            .unwrap();

        // Settled with the payout.
        let (_, recorded) = repo
            .record_refund_adjustment(&p1, &RefundEventId::new("r1"), at(4))
            .await
            .unwrap();
        assert_eq!(recorded, RecordedAdjustment::NotNeeded);

        // Backdated before the payout, but recorded after it.
        repo.insert_refund(&p1, &Refund::new(RefundEventId::new("r2"), chf(2_000), at(2)))
            .await
            .unwrap();
        let (payment, recorded) = repo
            .record_refund_adjustment(&p1, &RefundEventId::new("r2"), at(5))
            .await
            .unwrap();
        let RecordedAdjustment::Created(adjustment) = recorded else {
            panic!("expected a new adjustment, got {:?}", recorded);
        };
        assert_eq!(adjustment.amount, chf(2_000));
        assert_eq!(
            EarningsCalculator::breakdown(&payment).unwrap().final_payout,
            chf(8_000)
        );

        let (_, again) = repo
            .record_refund_adjustment(&p1, &RefundEventId::new("r2"), at(6))
            .await
            .unwrap();
        assert_eq!(again, RecordedAdjustment::AlreadyRecorded(adjustment));
        assert_eq!(repo.list_for_payment(&p1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_refund_event_not_found() {
        let (repo, _temp) = setup_test_db().await;
        repo.insert_payment(&payment("p1")).await.unwrap();
        let err = repo
            .record_refund_adjustment(&PaymentId::new("p1"), &RefundEventId::new("nope"), at(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
