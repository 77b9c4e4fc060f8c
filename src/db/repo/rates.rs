//! Rate config operations for the repository.

use super::Repository;
use crate::domain::{CoachId, RateConfig, RateMutation};
use crate::engine::RateEditor;
use crate::repository::{RateConfigRepository, StoreError};
use async_trait::async_trait;
use sqlx::Row;
use tracing::debug;

impl Repository {
    async fn load_versioned(&self, coach_id: &CoachId) -> Result<Option<RateConfig>, StoreError> {
        let row = sqlx::query("SELECT body, version FROM rate_configs WHERE coach_id = ?")
            .bind(coach_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let body: String = row.get("body");
        let version: i64 = row.get("version");
        let mut config: RateConfig = serde_json::from_str(&body)?;
        // The column is authoritative; the body may lag if edited by hand.
        config.version = version as u64;
        Ok(Some(config))
    }
}

#[async_trait]
impl RateConfigRepository for Repository {
    async fn load(&self, coach_id: &CoachId) -> Result<Option<RateConfig>, StoreError> {
        self.load_versioned(coach_id).await
    }

    async fn create_if_absent(&self, config: &RateConfig) -> Result<RateConfig, StoreError> {
        let body = serde_json::to_string(config)?;
        sqlx::query(
            r#"
            INSERT INTO rate_configs (coach_id, currency, body, version, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(coach_id) DO NOTHING
            "#,
        )
        .bind(config.coach_id.as_str())
        .bind(config.currency().as_str())
        .bind(body)
        .bind(config.version as i64)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        self.load_versioned(&config.coach_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("rate config for {}", config.coach_id)))
    }

    async fn save(
        &self,
        coach_id: &CoachId,
        expected_version: u64,
        mutation: &RateMutation,
    ) -> Result<RateConfig, StoreError> {
        let current = self
            .load_versioned(coach_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("rate config for {}", coach_id)))?;
        if current.version != expected_version {
            return Err(StoreError::VersionConflict {
                expected: expected_version,
                current: current.version,
            });
        }

        let next = RateEditor::apply(&current, mutation)?;
        let body = serde_json::to_string(&next)?;

        let result = sqlx::query(
            r#"
            UPDATE rate_configs
            SET body = ?, version = ?, updated_at = ?
            WHERE coach_id = ? AND version = ?
            "#,
        )
        .bind(body)
        .bind(next.version as i64)
        .bind(chrono::Utc::now().timestamp_millis())
        .bind(coach_id.as_str())
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let current = self
                .load_versioned(coach_id)
                .await?
                .map(|c| c.version)
                .unwrap_or(expected_version);
            debug!(coach_id = %coach_id, expected_version, current, "Rate config write lost race");
            return Err(StoreError::VersionConflict {
                expected: expected_version,
                current,
            });
        }

        Ok(next)
    }
}
