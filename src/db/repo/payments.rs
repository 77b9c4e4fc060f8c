//! Payment, refund and payout status operations for the repository.

use super::{from_ms, money, Repository};
use crate::domain::{CoachId, Payment, PaymentId, PayoutStatus, RateSnapshot, Refund, RefundEventId};
use crate::repository::{PaymentRepository, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;
use tracing::info;

impl Repository {
    /// Record a payment and any refunds it already carries.
    ///
    /// Returns false if the payment was recorded before; the stored copy is
    /// left untouched.
    pub async fn insert_payment(&self, payment: &Payment) -> Result<bool, StoreError> {
        let snapshot = serde_json::to_string(&payment.rate_snapshot)?;
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO payments (id, coach_id, gross_amount, currency, rate_snapshot, paid_at_ms, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(payment.id.as_str())
        .bind(payment.coach_id.as_str())
        .bind(payment.gross_amount.amount)
        .bind(payment.gross_amount.currency.as_str())
        .bind(snapshot)
        .bind(payment.paid_at().map(|t| t.timestamp_millis()))
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        for refund in &payment.refunds {
            insert_refund_row(&mut *tx, &payment.id, refund).await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Attach a refund event to a payment. Returns false for a repeated event.
    ///
    /// A newly recorded refund is never part of a past payout.
    pub async fn insert_refund(
        &self,
        payment_id: &PaymentId,
        refund: &Refund,
    ) -> Result<bool, StoreError> {
        let exists = sqlx::query("SELECT 1 FROM payments WHERE id = ?")
            .bind(payment_id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        if !exists {
            return Err(StoreError::NotFound(format!("payment {}", payment_id)));
        }

        let refund = Refund {
            deducted_at_payout: false,
            ..refund.clone()
        };
        let mut conn = self.pool.acquire().await?;
        insert_refund_row(&mut *conn, payment_id, &refund).await
    }
}

/// Decode a payment row; refunds are loaded separately.
fn decode_payment(row: &SqliteRow) -> Result<Payment, StoreError> {
    let currency: String = row.get("currency");
    let snapshot: String = row.get("rate_snapshot");
    let paid_at_ms: Option<i64> = row.get("paid_at_ms");

    let rate_snapshot: RateSnapshot = serde_json::from_str(&snapshot)?;
    let payout_status = match paid_at_ms {
        Some(ms) => PayoutStatus::Paid {
            paid_at: from_ms(ms)?,
        },
        None => PayoutStatus::Pending,
    };

    Ok(Payment {
        id: PaymentId::new(row.get::<String, _>("id")),
        coach_id: CoachId::new(row.get::<String, _>("coach_id")),
        gross_amount: money(row.get("gross_amount"), &currency)?,
        rate_snapshot,
        refunds: Vec::new(),
        payout_status,
    })
}

async fn insert_refund_row(
    conn: &mut SqliteConnection,
    payment_id: &PaymentId,
    refund: &Refund,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        r#"
        INSERT INTO refunds (payment_id, refund_event_id, amount, currency, issued_at_ms, deducted)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(payment_id, refund_event_id) DO NOTHING
        "#,
    )
    .bind(payment_id.as_str())
    .bind(refund.refund_event_id.as_str())
    .bind(refund.amount.amount)
    .bind(refund.amount.currency.as_str())
    .bind(refund.issued_at.timestamp_millis())
    .bind(refund.deducted_at_payout)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

async fn load_refunds(
    conn: &mut SqliteConnection,
    payment_id: &PaymentId,
) -> Result<Vec<Refund>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT refund_event_id, amount, currency, issued_at_ms, deducted
        FROM refunds
        WHERE payment_id = ?
        ORDER BY issued_at_ms ASC, refund_event_id ASC
        "#,
    )
    .bind(payment_id.as_str())
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| -> Result<Refund, StoreError> {
            let currency: String = row.get("currency");
            Ok(Refund {
                refund_event_id: RefundEventId::new(row.get::<String, _>("refund_event_id")),
                amount: money(row.get("amount"), &currency)?,
                issued_at: from_ms(row.get("issued_at_ms"))?,
                deducted_at_payout: row.get("deducted"),
            })
        })
        .collect()
}

const PAYMENT_COLUMNS: &str = "id, coach_id, gross_amount, currency, rate_snapshot, paid_at_ms";

/// Load one payment with its refunds.
pub(super) async fn fetch_payment(
    conn: &mut SqliteConnection,
    payment_id: &PaymentId,
) -> Result<Option<Payment>, StoreError> {
    let sql = format!("SELECT {} FROM payments WHERE id = ?", PAYMENT_COLUMNS);
    let row = sqlx::query(&sql)
        .bind(payment_id.as_str())
        .fetch_optional(&mut *conn)
        .await?;

    match row.as_ref().map(decode_payment).transpose()? {
        Some(mut payment) => {
            payment.refunds = load_refunds(conn, &payment.id).await?;
            Ok(Some(payment))
        }
        None => Ok(None),
    }
}

/// Unpaid payments of a coach with their refunds, oldest first.
pub(super) async fn fetch_unpaid(
    conn: &mut SqliteConnection,
    coach_id: &CoachId,
) -> Result<Vec<Payment>, StoreError> {
    let sql = format!(
        "SELECT {} FROM payments WHERE coach_id = ? AND paid_at_ms IS NULL ORDER BY created_at ASC, id ASC",
        PAYMENT_COLUMNS
    );
    let decoded = {
        let rows = sqlx::query(&sql)
            .bind(coach_id.as_str())
            .fetch_all(&mut *conn)
            .await?;
        rows.iter()
            .map(decode_payment)
            .collect::<Result<Vec<_>, _>>()?
    };

    let mut payments = Vec::with_capacity(decoded.len());
    for mut payment in decoded {
        payment.refunds = load_refunds(conn, &payment.id).await?;
        payments.push(payment);
    }
    Ok(payments)
}

/// Mark one unpaid payment paid and settle its recorded refunds with it.
/// Returns false when the payment was already paid or does not exist.
pub(super) async fn settle_payment(
    conn: &mut SqliteConnection,
    payment_id: &PaymentId,
    paid_at: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let result = sqlx::query("UPDATE payments SET paid_at_ms = ? WHERE id = ? AND paid_at_ms IS NULL")
        .bind(paid_at.timestamp_millis())
        .bind(payment_id.as_str())
        .execute(&mut *conn)
        .await?;
    if result.rows_affected() == 0 {
        return Ok(false);
    }

    sqlx::query("UPDATE refunds SET deducted = 1 WHERE payment_id = ?")
        .bind(payment_id.as_str())
        .execute(&mut *conn)
        .await?;
    Ok(true)
}

#[async_trait]
impl PaymentRepository for Repository {
    async fn get(&self, payment_id: &PaymentId) -> Result<Option<Payment>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_payment(&mut *conn, payment_id).await
    }

    async fn list_unpaid(&self, coach_id: &CoachId) -> Result<Vec<Payment>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_unpaid(&mut *conn, coach_id).await
    }

    async fn mark_paid(
        &self,
        payment_ids: &[PaymentId],
        paid_at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        if payment_ids.is_empty() {
            return Ok(0);
        }

        let mut changed = 0usize;
        let mut tx = self.pool.begin().await?;
        for id in payment_ids {
            if settle_payment(&mut *tx, id, paid_at).await? {
                changed += 1;
            }
        }
        tx.commit().await?;

        info!(payments = changed, paid_at = %paid_at, "Marked payments paid");
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::setup_test_db;
    use super::*;
    use crate::domain::{Money, Percent};
    use chrono::TimeZone;

    fn payment(id: &str) -> Payment {
        Payment {
            id: PaymentId::new(id),
            coach_id: CoachId::new("c1"),
            gross_amount: Money::from_minor(10_000, "CHF").unwrap(),
            rate_snapshot: RateSnapshot {
                platform_fee_rate: Percent::from_str_canonical("9.9").unwrap(),
                vat_rate: Percent::zero(),
                processing_fee_rate: Percent::zero(),
            },
            refunds: vec![],
            payout_status: PayoutStatus::Pending,
        }
    }

    fn refund(id: &str, amount: i64) -> Refund {
        Refund {
            refund_event_id: RefundEventId::new(id),
            amount: Money::from_minor(amount, "CHF").unwrap(),
            issued_at: Utc.with_ymd_and_hms(2024, 2, 1, 9, 30, 0).unwrap(),
            deducted_at_payout: false,
        }
    }

    #[tokio::test]
    async fn test_payment_round_trip_with_refunds() {
        let (repo, _temp) = setup_test_db().await;
        let mut p = payment("p1");
        p.refunds.push(refund("r1", 1_000));

        assert!(repo.insert_payment(&p).await.unwrap());
        assert!(!repo.insert_payment(&p).await.unwrap());

        assert!(repo.insert_refund(&p.id, &refund("r2", 500)).await.unwrap());
        assert!(!repo.insert_refund(&p.id, &refund("r2", 500)).await.unwrap());

        let stored = repo.get(&p.id).await.unwrap().unwrap();
        assert_eq!(stored.refunds.len(), 2);
        assert_eq!(stored.rate_snapshot, p.rate_snapshot);
        assert_eq!(stored.payout_status, PayoutStatus::Pending);

        let paid_at = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(repo.mark_paid(&[p.id.clone()], paid_at).await.unwrap(), 1);
        let stored = repo.get(&p.id).await.unwrap().unwrap();
        assert!(stored.refunds.iter().all(|r| r.deducted_at_payout));
    }

    #[tokio::test]
    async fn test_refund_for_unknown_payment() {
        let (repo, _temp) = setup_test_db().await;
        let err = repo
            .insert_refund(&PaymentId::new("missing"), &refund("r1", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_mark_paid_only_once() {
        let (repo, _temp) = setup_test_db().await;
        repo.insert_payment(&payment("p1")).await.unwrap();
        repo.insert_payment(&payment("p2")).await.unwrap();

        let first = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let ids = vec![PaymentId::new("p1")];
        assert_eq!(repo.mark_paid(&ids, first).await.unwrap(), 1);
        assert_eq!(
            repo.mark_paid(&ids, first + chrono::Duration::days(1))
                .await
                .unwrap(),
            0
        );

        let stored = repo.get(&PaymentId::new("p1")).await.unwrap().unwrap();
        assert_eq!(stored.paid_at(), Some(first));

        // Recorded after the payout, so it is not settled with it.
        repo.insert_refund(&PaymentId::new("p1"), &refund("r1", 500)).await.unwrap();
        let stored = repo.get(&PaymentId::new("p1")).await.unwrap().unwrap();
        assert!(!stored.refunds[0].deducted_at_payout);

        let unpaid = repo.list_unpaid(&CoachId::new("c1")).await.unwrap();
        assert_eq!(unpaid.len(), 1);
        assert_eq!(unpaid[0].id, PaymentId::new("p2"));
    }
}
