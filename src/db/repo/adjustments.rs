//! Adjustment ledger operations for the repository.

use super::{from_ms, money, Repository};
use crate::domain::{
    Adjustment, AdjustmentId, AdjustmentStatus, BatchId, CoachId, PaymentId, RefundEventId,
};
use crate::repository::{AdjustmentRepository, StoreError};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;
use tracing::info;

const ADJUSTMENT_COLUMNS: &str =
    "id, payment_id, coach_id, refund_event_id, amount, currency, created_at_ms, batch_id";

fn decode(row: &SqliteRow) -> Result<Adjustment, StoreError> {
    let currency: String = row.get("currency");
    let batch_id: Option<String> = row.get("batch_id");
    Ok(Adjustment {
        id: AdjustmentId::new(row.get::<String, _>("id")),
        payment_id: PaymentId::new(row.get::<String, _>("payment_id")),
        coach_id: CoachId::new(row.get::<String, _>("coach_id")),
        refund_event_id: RefundEventId::new(row.get::<String, _>("refund_event_id")),
        amount: money(row.get("amount"), &currency)?,
        created_at: from_ms(row.get("created_at_ms"))?,
        status: match batch_id {
            Some(batch_id) => AdjustmentStatus::Applied {
                batch_id: BatchId::new(batch_id),
            },
            None => AdjustmentStatus::Pending,
        },
    })
}

/// Insert an adjustment unless one with the same key exists. Returns false
/// on a duplicate.
pub(super) async fn insert_adjustment(
    conn: &mut SqliteConnection,
    adjustment: &Adjustment,
    dedupe_key: &str,
) -> Result<bool, StoreError> {
    let batch_id = match &adjustment.status {
        AdjustmentStatus::Pending => None,
        AdjustmentStatus::Applied { batch_id } => Some(batch_id.as_str()),
    };

    let result = sqlx::query(
        r#"
        INSERT INTO adjustments (
            id, dedupe_key, payment_id, coach_id, refund_event_id,
            amount, currency, created_at_ms, batch_id
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(adjustment.id.as_str())
    .bind(dedupe_key)
    .bind(adjustment.payment_id.as_str())
    .bind(adjustment.coach_id.as_str())
    .bind(adjustment.refund_event_id.as_str())
    .bind(adjustment.amount.amount)
    .bind(adjustment.amount.currency.as_str())
    .bind(adjustment.created_at.timestamp_millis())
    .bind(batch_id)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub(super) async fn fetch_for_payment(
    conn: &mut SqliteConnection,
    payment_id: &PaymentId,
) -> Result<Vec<Adjustment>, StoreError> {
    let sql = format!(
        "SELECT {} FROM adjustments WHERE payment_id = ? ORDER BY created_at_ms ASC, id ASC",
        ADJUSTMENT_COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(payment_id.as_str())
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(decode).collect()
}

pub(super) async fn fetch_pending(
    conn: &mut SqliteConnection,
    coach_id: &CoachId,
) -> Result<Vec<Adjustment>, StoreError> {
    let sql = format!(
        "SELECT {} FROM adjustments WHERE coach_id = ? AND batch_id IS NULL ORDER BY created_at_ms ASC, id ASC",
        ADJUSTMENT_COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(coach_id.as_str())
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(decode).collect()
}

/// Tag a pending adjustment with `batch_id`. Returns false if it was not
/// pending.
pub(super) async fn apply_adjustment(
    conn: &mut SqliteConnection,
    id: &AdjustmentId,
    batch_id: &BatchId,
) -> Result<bool, StoreError> {
    let result = sqlx::query("UPDATE adjustments SET batch_id = ? WHERE id = ? AND batch_id IS NULL")
        .bind(batch_id.as_str())
        .bind(id.as_str())
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

#[async_trait]
impl AdjustmentRepository for Repository {
    async fn create(&self, adjustment: &Adjustment, dedupe_key: &str) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        if !insert_adjustment(&mut *conn, adjustment, dedupe_key).await? {
            return Err(StoreError::AlreadyExists(format!("adjustment {}", dedupe_key)));
        }
        Ok(())
    }

    async fn list_for_payment(&self, payment_id: &PaymentId) -> Result<Vec<Adjustment>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_for_payment(&mut *conn, payment_id).await
    }

    async fn list_pending(&self, coach_id: &CoachId) -> Result<Vec<Adjustment>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_pending(&mut *conn, coach_id).await
    }

    async fn mark_applied(&self, ids: &[AdjustmentId], batch_id: &BatchId) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut changed = 0usize;
        let mut tx = self.pool.begin().await?;
        for id in ids {
            if apply_adjustment(&mut *tx, id, batch_id).await? {
                changed += 1;
            }
        }
        tx.commit().await?;

        info!(batch_id = %batch_id, adjustments = changed, "Applied adjustments to batch");
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::setup_test_db;
    use super::*;
    use crate::domain::{Money, Payment, PayoutStatus, Percent, RateSnapshot};
    use chrono::{TimeZone, Utc};

    async fn seed_payment(repo: &Repository) {
        repo.insert_payment(&Payment {
            id: PaymentId::new("p1"),
            coach_id: CoachId::new("c1"),
            gross_amount: Money::from_minor(10_000, "CHF").unwrap(),
            rate_snapshot: RateSnapshot {
                platform_fee_rate: Percent::zero(),
                vat_rate: Percent::zero(),
                processing_fee_rate: Percent::zero(),
            },
            refunds: vec![],
            payout_status: PayoutStatus::Paid {
                paid_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            },
        })
        .await
        .unwrap();
    }

    fn adjustment(refund: &str, day: u32) -> Adjustment {
        let payment_id = PaymentId::new("p1");
        let refund_event_id = RefundEventId::new(refund);
        Adjustment {
            id: Adjustment::compute_id(&payment_id, &refund_event_id),
            payment_id,
            coach_id: CoachId::new("c1"),
            refund_event_id,
            amount: Money::from_minor(1_000, "CHF").unwrap(),
            created_at: Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap(),
            status: AdjustmentStatus::Pending,
        }
    }

    #[tokio::test]
    async fn test_create_is_idempotent_per_key() {
        let (repo, _temp) = setup_test_db().await;
        seed_payment(&repo).await;

        let a = adjustment("r1", 2);
        let key = Adjustment::dedupe_key(&a.payment_id, &a.refund_event_id);
        repo.create(&a, &key).await.unwrap();
        let err = repo.create(&a, &key).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));

        let stored = repo.list_for_payment(&a.payment_id).await.unwrap();
        assert_eq!(stored, vec![a]);
    }

    #[tokio::test]
    async fn test_pending_listed_oldest_first_until_applied() {
        let (repo, _temp) = setup_test_db().await;
        seed_payment(&repo).await;

        let later = adjustment("r2", 5);
        let earlier = adjustment("r1", 3);
        for a in [&later, &earlier] {
            let key = Adjustment::dedupe_key(&a.payment_id, &a.refund_event_id);
            repo.create(a, &key).await.unwrap();
        }

        let pending = repo.list_pending(&CoachId::new("c1")).await.unwrap();
        assert_eq!(pending, vec![earlier.clone(), later.clone()]);

        let batch = BatchId::new("batch-1");
        let changed = repo
            .mark_applied(&[earlier.id.clone()], &batch)
            .await
            .unwrap();
        assert_eq!(changed, 1);
        assert_eq!(
            repo.mark_applied(&[earlier.id.clone()], &BatchId::new("batch-2"))
                .await
                .unwrap(),
            0
        );

        let pending = repo.list_pending(&CoachId::new("c1")).await.unwrap();
        assert_eq!(pending, vec![later]);

        let all = repo.list_for_payment(&PaymentId::new("p1")).await.unwrap();
        assert_eq!(all[0].status, AdjustmentStatus::Applied { batch_id: batch });
    }
}
