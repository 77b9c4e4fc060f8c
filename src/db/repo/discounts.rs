//! Discount code and redemption operations for the repository.

use super::{is_unique_violation, Repository};
use crate::domain::{BuyerId, CoachId, DiscountCode, DiscountId, EntityRef};
use crate::error::PricingError;
use crate::repository::{is_candidate, DiscountRepository, StoreError};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::BTreeSet;
use tracing::{debug, warn};

fn decode(row: &SqliteRow) -> Result<DiscountCode, StoreError> {
    let body: String = row.get("body");
    let usage_count: i64 = row.get("usage_count");
    let mut code: DiscountCode = serde_json::from_str(&body)?;
    code.usage_count = u32::try_from(usage_count)
        .map_err(|_| StoreError::Serialization(format!("usage_count {} out of range", usage_count)))?;
    Ok(code)
}

impl Repository {
    /// Insert a discount, or update everything but its usage count.
    ///
    /// # Errors
    /// Returns `Pricing` if the code fails validation.
    pub async fn insert_discount(&self, code: &DiscountCode) -> Result<(), StoreError> {
        code.validate().map_err(PricingError::from)?;
        let body = serde_json::to_string(code)?;

        sqlx::query(
            r#"
            INSERT INTO discount_codes (
                id, coach_id, body, usage_limit, usage_count, one_per_customer, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                body = excluded.body,
                usage_limit = excluded.usage_limit,
                one_per_customer = excluded.one_per_customer
            "#,
        )
        .bind(code.id.as_str())
        .bind(code.coach_id.as_str())
        .bind(body)
        .bind(code.usage_limit.map(i64::from))
        .bind(i64::from(code.usage_count))
        .bind(code.limit_to_one_per_customer)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_discount(&self, id: &DiscountId) -> Result<Option<DiscountCode>, StoreError> {
        let row = sqlx::query("SELECT body, usage_count FROM discount_codes WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode).transpose()
    }
}

#[async_trait]
impl DiscountRepository for Repository {
    async fn find_candidates(
        &self,
        coach_id: &CoachId,
        entity: &EntityRef,
        buyer_id: &BuyerId,
    ) -> Result<Vec<DiscountCode>, StoreError> {
        let rows = sqlx::query(
            "SELECT body, usage_count FROM discount_codes WHERE coach_id = ? ORDER BY id ASC",
        )
        .bind(coach_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut codes = Vec::with_capacity(rows.len());
        for row in &rows {
            let code = decode(row)?;
            if is_candidate(&code, coach_id, entity, buyer_id) {
                codes.push(code);
            }
        }
        Ok(codes)
    }

    async fn buyer_redemptions(
        &self,
        coach_id: &CoachId,
        buyer_id: &BuyerId,
    ) -> Result<BTreeSet<DiscountId>, StoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT discount_id FROM redemptions WHERE coach_id = ? AND buyer_id = ?",
        )
        .bind(coach_id.as_str())
        .bind(buyer_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| DiscountId::new(r.get::<String, _>("discount_id")))
            .collect())
    }

    async fn increment_usage(
        &self,
        discount_id: &DiscountId,
        expected_usage_limit: Option<u32>,
        buyer_id: &BuyerId,
    ) -> Result<DiscountCode, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Writing first takes the write lock up front, so the limit check and
        // the increment see the same committed state.
        let row = sqlx::query(
            r#"
            UPDATE discount_codes
            SET usage_count = usage_count + 1
            WHERE id = ?
              AND usage_limit IS ?
              AND (usage_limit IS NULL OR usage_count < usage_limit)
            RETURNING coach_id, body, usage_count, one_per_customer
            "#,
        )
        .bind(discount_id.as_str())
        .bind(expected_usage_limit.map(i64::from))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return match self.get_discount(discount_id).await? {
                None => Err(StoreError::NotFound(format!("discount {}", discount_id))),
                Some(_) => Err(StoreError::LimitExceeded(discount_id.to_string())),
            };
        };

        let coach_id: String = row.get("coach_id");
        let one_per_customer: bool = row.get("one_per_customer");
        let code = decode(&row)?;
        let once_key =
            one_per_customer.then(|| format!("{}:{}", discount_id.as_str(), buyer_id.as_str()));

        let inserted = sqlx::query(
            r#"
            INSERT INTO redemptions (discount_id, coach_id, buyer_id, once_key, redeemed_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(discount_id.as_str())
        .bind(coach_id.as_str())
        .bind(buyer_id.as_str())
        .bind(once_key)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                tx.rollback().await?;
                warn!(
                    discount_id = %discount_id,
                    buyer_id = %buyer_id,
                    "Repeated redemption of one-per-customer discount"
                );
                return Err(StoreError::AlreadyUsed {
                    discount_id: discount_id.to_string(),
                    buyer_id: buyer_id.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        tx.commit().await?;
        debug!(discount_id = %discount_id, usage_count = code.usage_count, "Redeemed discount");
        Ok(code)
    }
}
