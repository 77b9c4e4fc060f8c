use crate::domain::{Adjustment, AdjustmentId, BatchId, CoachId, Currency, Money, Payment, PaymentId};
use crate::engine::EarningsCalculator;
use crate::error::FinancialInvariantError;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// What a payout batch would pay a coach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutBatchPlan {
    pub coach_id: CoachId,
    pub batch_id: BatchId,
    pub payment_ids: Vec<PaymentId>,
    /// Sum of `final_payout` over the included payments.
    pub earnings_total: Money,
    pub applied_adjustments: Vec<AdjustmentId>,
    pub adjustment_total: Money,
    /// Adjustments left pending for a later batch.
    pub carried_adjustments: Vec<AdjustmentId>,
    pub payout_total: Money,
}

pub struct PayoutPlanner;

impl PayoutPlanner {
    /// Plan a batch from a coach's unpaid payments and pending adjustments.
    ///
    /// Adjustments are deducted oldest first. One that does not fit in what is
    /// left is carried whole to the next batch, so the total never goes below
    /// zero and no adjustment is ever split.
    pub fn plan(
        coach_id: &CoachId,
        batch_id: &BatchId,
        currency: &Currency,
        payments: &[Payment],
        adjustments: &[Adjustment],
    ) -> Result<PayoutBatchPlan, FinancialInvariantError> {
        let mut payment_ids = Vec::new();
        let mut earnings_total = Money::zero(currency.clone());
        for payment in payments
            .iter()
            .filter(|p| &p.coach_id == coach_id && p.paid_at().is_none())
        {
            let breakdown = EarningsCalculator::breakdown(payment)?;
            earnings_total = earnings_total.checked_add(&breakdown.final_payout)?;
            payment_ids.push(payment.id.clone());
        }

        let mut pending: Vec<&Adjustment> = adjustments
            .iter()
            .filter(|a| &a.coach_id == coach_id && a.is_pending())
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let mut remaining = earnings_total.clone();
        let mut applied = Vec::new();
        let mut carried = Vec::new();
        for adjustment in pending {
            if !remaining.lt(&adjustment.amount)? {
                remaining = remaining.checked_sub(&adjustment.amount)?;
                applied.push(adjustment.id.clone());
            } else {
                carried.push(adjustment.id.clone());
            }
        }

        let adjustment_total = earnings_total.checked_sub(&remaining)?;
        if !carried.is_empty() {
            warn!(
                coach_id = %coach_id,
                batch_id = %batch_id,
                carried = carried.len(),
                "Adjustments exceed batch earnings, carried to next batch"
            );
        }
        info!(
            coach_id = %coach_id,
            batch_id = %batch_id,
            payments = payment_ids.len(),
            earnings = %earnings_total,
            adjustments = %adjustment_total,
            payout = %remaining,
            "Planned payout batch"
        );

        Ok(PayoutBatchPlan {
            coach_id: coach_id.clone(),
            batch_id: batch_id.clone(),
            payment_ids,
            earnings_total,
            applied_adjustments: applied,
            adjustment_total,
            carried_adjustments: carried,
            payout_total: remaining,
        })
    }
}
