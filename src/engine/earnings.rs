use crate::domain::{Adjustment, AdjustmentStatus, Money, Payment, PaymentId, RateSnapshot, Refund};
use crate::error::FinancialInvariantError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

/// Coach-facing earnings for one payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EarningsBreakdown {
    pub gross_amount: Money,
    /// Refunds counted against this payment's payout.
    pub refunded_amount: Money,
    pub effective_gross: Money,
    pub platform_fee: Money,
    pub vat_withheld: Money,
    pub processing_fee: Money,
    pub total_deductions: Money,
    pub net_earning: Money,
    pub final_payout: Money,
    /// Refunds issued after payout; settled through adjustments instead.
    pub post_payout_refunds: Money,
    /// Set when refunds exceed net earning and `final_payout` was clamped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shortfall: Option<Money>,
}

impl EarningsBreakdown {
    pub fn ensure_no_shortfall(&self, payment_id: &PaymentId) -> Result<(), FinancialInvariantError> {
        match &self.shortfall {
            None => Ok(()),
            Some(shortfall) => Err(FinancialInvariantError::Shortfall {
                payment_id: payment_id.to_string(),
                net_earning: self.net_earning.to_string(),
                refunded: self.refunded_amount.to_string(),
                shortfall: shortfall.to_string(),
            }),
        }
    }
}

/// Derives fees, net earning and payout from a payment's captured rate
/// snapshot. Fees are always charged on the original gross.
pub struct EarningsCalculator;

impl EarningsCalculator {
    /// Breakdown of a stored payment.
    ///
    /// For a paid payment only refunds settled with the payout reduce
    /// `final_payout`; refunds recorded afterwards are reported in
    /// `post_payout_refunds`, whatever their `issued_at`.
    pub fn breakdown(payment: &Payment) -> Result<EarningsBreakdown, FinancialInvariantError> {
        let currency = &payment.gross_amount.currency;

        let (before, after): (Vec<&Refund>, Vec<&Refund>) = payment
            .refunds
            .iter()
            .partition(|r| payment.counts_against_payout(r));

        let all_refunds = Money::sum(currency, payment.refunds.iter().map(|r| &r.amount))?;
        if payment.gross_amount.lt(&all_refunds)? {
            error!(
                payment_id = %payment.id,
                gross = %payment.gross_amount,
                refunded = %all_refunds,
                "Refunds exceed gross amount"
            );
            return Err(FinancialInvariantError::RefundExceedsGross {
                payment_id: payment.id.to_string(),
                gross: payment.gross_amount.to_string(),
                refunded: all_refunds.to_string(),
            });
        }

        let mut breakdown = Self::compute(
            &payment.gross_amount,
            &payment.rate_snapshot,
            before.iter().map(|r| &r.amount),
        )?;
        breakdown.post_payout_refunds = Money::sum(currency, after.iter().map(|r| &r.amount))?;

        if let Some(shortfall) = &breakdown.shortfall {
            error!(
                payment_id = %payment.id,
                net_earning = %breakdown.net_earning,
                refunded = %breakdown.refunded_amount,
                shortfall = %shortfall,
                "Refunds exceed net earning, payout clamped to zero"
            );
        }

        debug!(
            payment_id = %payment.id,
            net_earning = %breakdown.net_earning,
            final_payout = %breakdown.final_payout,
            "Computed earnings"
        );
        Ok(breakdown)
    }

    /// Breakdown a coach would see for a sale at `gross` with no refunds.
    pub fn preview(gross: &Money, snapshot: &RateSnapshot) -> Result<EarningsBreakdown, FinancialInvariantError> {
        Self::compute(gross, snapshot, std::iter::empty())
    }

    pub fn compute<'a, I>(
        gross: &Money,
        snapshot: &RateSnapshot,
        refunds: I,
    ) -> Result<EarningsBreakdown, FinancialInvariantError>
    where
        I: IntoIterator<Item = &'a Money>,
    {
        let currency = &gross.currency;
        let refunded_amount = Money::sum(currency, refunds)?;
        let effective_gross = gross.saturating_sub(&refunded_amount)?;

        let platform_fee = gross.percent(snapshot.platform_fee_rate)?;
        let vat_withheld = gross.percent(snapshot.vat_rate)?;
        let processing_fee = gross.percent(snapshot.processing_fee_rate)?;
        let total_deductions = Money::sum(currency, [&platform_fee, &vat_withheld, &processing_fee])?;

        let net_earning = gross.checked_sub(&total_deductions)?;
        let raw_payout = net_earning.checked_sub(&refunded_amount)?;
        let (final_payout, shortfall) = if raw_payout.is_negative() {
            let shortfall = Money::new(-raw_payout.amount, currency.clone());
            (Money::zero(currency.clone()), Some(shortfall))
        } else {
            (raw_payout, None)
        };

        Ok(EarningsBreakdown {
            gross_amount: gross.clone(),
            refunded_amount,
            effective_gross,
            platform_fee,
            vat_withheld,
            processing_fee,
            total_deductions,
            net_earning,
            final_payout,
            post_payout_refunds: Money::zero(currency.clone()),
            shortfall,
        })
    }

    /// Plan the adjustment for `refund` against an already paid payment.
    ///
    /// Returns `None` when the payment is unpaid, the refund was settled with
    /// the payout, or nothing of the net earning is left to claw back. The
    /// adjustment is capped so that everything clawed back for the payment
    /// never exceeds its net earning.
    pub fn plan_adjustment(
        payment: &Payment,
        refund: &Refund,
        existing: &[Adjustment],
        now: DateTime<Utc>,
    ) -> Result<Option<Adjustment>, FinancialInvariantError> {
        if payment.counts_against_payout(refund) {
            return Ok(None);
        }

        let breakdown = Self::breakdown(payment)?;
        let currency = &payment.gross_amount.currency;

        let earlier_adjustments = Money::sum(
            currency,
            existing
                .iter()
                .filter(|a| a.payment_id == payment.id)
                .filter(|a| a.refund_event_id != refund.refund_event_id)
                .map(|a| &a.amount),
        )?;
        let clawed_back = breakdown.refunded_amount.checked_add(&earlier_adjustments)?;
        let remaining = breakdown.net_earning.saturating_sub(&clawed_back)?;
        let amount = refund.amount.min(&remaining)?;

        if amount.is_zero() {
            error!(
                payment_id = %payment.id,
                refund_event_id = %refund.refund_event_id,
                refund = %refund.amount,
                net_earning = %breakdown.net_earning,
                "Net earning fully clawed back, refund covered by platform"
            );
            return Ok(None);
        }
        if amount != refund.amount {
            warn!(
                payment_id = %payment.id,
                refund_event_id = %refund.refund_event_id,
                refund = %refund.amount,
                adjustment = %amount,
                "Adjustment capped at remaining net earning"
            );
        }

        Ok(Some(Adjustment {
            id: Adjustment::compute_id(&payment.id, &refund.refund_event_id),
            payment_id: payment.id.clone(),
            coach_id: payment.coach_id.clone(),
            refund_event_id: refund.refund_event_id.clone(),
            amount,
            created_at: now,
            status: AdjustmentStatus::Pending,
        }))
    }
}
