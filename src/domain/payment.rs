//! Completed sales, refunds and payout adjustments.

use crate::domain::{
    AdjustmentId, BatchId, CoachId, Money, PaymentId, Percent, RefundEventId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Platform rates captured at sale time. Never recomputed from current config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateSnapshot {
    pub platform_fee_rate: Percent,
    pub vat_rate: Percent,
    pub processing_fee_rate: Percent,
}

/// A refund issued against a payment.
///
/// `issued_at` is informational. Whether a refund reduced the payment's own
/// payout is decided by `deducted_at_payout`, which the store sets on every
/// refund already recorded when the payment is paid out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Refund {
    pub refund_event_id: RefundEventId,
    pub amount: Money,
    pub issued_at: DateTime<Utc>,
    #[serde(default)]
    pub deducted_at_payout: bool,
}

impl Refund {
    /// A refund recorded now; it has not been part of any payout yet.
    pub fn new(refund_event_id: RefundEventId, amount: Money, issued_at: DateTime<Utc>) -> Self {
        Self {
            refund_event_id,
            amount,
            issued_at,
            deducted_at_payout: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    Paid { paid_at: DateTime<Utc> },
}

/// A completed sale as recorded by the payment pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: PaymentId,
    pub coach_id: CoachId,
    pub gross_amount: Money,
    pub rate_snapshot: RateSnapshot,
    pub refunds: Vec<Refund>,
    pub payout_status: PayoutStatus,
}

impl Payment {
    pub fn refund(&self, event_id: &RefundEventId) -> Option<&Refund> {
        self.refunds.iter().find(|r| &r.refund_event_id == event_id)
    }

    pub fn paid_at(&self) -> Option<DateTime<Utc>> {
        match self.payout_status {
            PayoutStatus::Paid { paid_at } => Some(paid_at),
            PayoutStatus::Pending => None,
        }
    }

    /// True when `refund` reduces this payment's own payout. Refunds on an
    /// unpaid payment always do; on a paid one only those settled with it.
    pub fn counts_against_payout(&self, refund: &Refund) -> bool {
        self.paid_at().is_none() || refund.deducted_at_payout
    }

    /// Record the payout: the payment becomes paid and every refund already
    /// recorded is settled with it. A paid payment is left untouched.
    pub fn settle(&mut self, paid_at: DateTime<Utc>) -> bool {
        if self.paid_at().is_some() {
            return false;
        }
        self.payout_status = PayoutStatus::Paid { paid_at };
        for refund in &mut self.refunds {
            refund.deducted_at_payout = true;
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AdjustmentStatus {
    Pending,
    Applied { batch_id: BatchId },
}

/// A deduction from a coach's next payout for a refund issued after payout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Adjustment {
    pub id: AdjustmentId,
    pub payment_id: PaymentId,
    pub coach_id: CoachId,
    pub refund_event_id: RefundEventId,
    pub amount: Money,
    pub created_at: DateTime<Utc>,
    pub status: AdjustmentStatus,
}

impl Adjustment {
    /// De-duplication key: one adjustment per `(payment, refund event)`.
    pub fn dedupe_key(payment_id: &PaymentId, refund_event_id: &RefundEventId) -> String {
        format!("{}:{}", payment_id.as_str(), refund_event_id.as_str())
    }

    /// Stable id derived from the de-duplication key, so retried refund events
    /// always produce the same adjustment id.
    pub fn compute_id(payment_id: &PaymentId, refund_event_id: &RefundEventId) -> AdjustmentId {
        use sha2::{Digest, Sha256};

        fn hash_var(hasher: &mut Sha256, data: &str) {
            hasher.update((data.len() as u32).to_le_bytes());
            hasher.update(data.as_bytes());
        }

        let mut hasher = Sha256::new();
        hash_var(&mut hasher, payment_id.as_str());
        hash_var(&mut hasher, refund_event_id.as_str());
        let hash = hasher.finalize();
        AdjustmentId::new(format!("adj:{}", hex::encode(&hash[..16])))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.status, AdjustmentStatus::Pending)
    }
}
