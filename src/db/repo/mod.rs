//! SQLite-backed repository.
//!
//! `Repository` implements every repository trait over one connection pool.
//! Methods are organized across submodules by aggregate:
//! - `rates.rs` - rate configs (JSON body plus version column)
//! - `discounts.rs` - discount codes, usage counting and redemptions
//! - `payments.rs` - payments, refunds and payout status
//! - `adjustments.rs` - the adjustment ledger
//! - `ledger.rs` - refund adjustments and batch settlement as single transactions
//!
//! Timestamps are stored as epoch milliseconds, money as integer minor units
//! next to a currency column.

mod adjustments;
mod discounts;
mod ledger;
mod payments;
mod rates;

use crate::domain::Money;
use crate::repository::StoreError;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;

/// Repository for database operations.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    /// Create a new repository with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Repository { pool }
    }
}

fn from_ms(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Serialization(format!("timestamp out of range: {}", ms)))
}

fn money(amount: i64, currency: &str) -> Result<Money, StoreError> {
    Money::from_minor(amount, currency).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// True when `err` is a UNIQUE or PRIMARY KEY violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}
