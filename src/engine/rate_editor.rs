use crate::domain::{Money, RateConfig, RateMutation, RuleId};
use crate::engine::PeriodOverlapValidator;
use crate::error::{PricingError, ValidationError};
use tracing::debug;

/// Applies validated mutations to a rate configuration.
///
/// Produces a new config with `version + 1`; the input is never modified, so
/// a store can compare-and-swap the result against the version it loaded.
pub struct RateEditor;

impl RateEditor {
    pub fn apply(config: &RateConfig, mutation: &RateMutation) -> Result<RateConfig, PricingError> {
        let mut next = config.clone();

        match mutation {
            RateMutation::SetBaseRate { rate } => {
                check_amount(config, rate, "base rate")?;
                next.base_rate = rate.clone();
            }
            RateMutation::SetLiveSessionRate { rate } => {
                check_amount(config, rate, "live session rate")?;
                next.live_session_rate = rate.clone();
            }
            RateMutation::SetSessionTypeRate {
                session_type_id,
                rate,
            } => {
                check_amount(config, rate, "session type rate")?;
                next.session_type_rates
                    .insert(session_type_id.clone(), rate.clone());
            }
            RateMutation::RemoveSessionTypeRate { session_type_id } => {
                if next.session_type_rates.remove(session_type_id).is_none() {
                    return Err(ValidationError::UnknownRule(session_type_id.to_string()).into());
                }
            }
            RateMutation::AddTimeBasedRate { rule } => {
                rule.validate()?;
                if next.time_based_rates.iter().any(|r| r.id == rule.id) {
                    return Err(ValidationError::DuplicateRule(rule.id.to_string()).into());
                }
                next.time_based_rates.push(rule.clone());
            }
            RateMutation::UpdateTimeBasedRate { rule } => {
                rule.validate()?;
                let slot = next
                    .time_based_rates
                    .iter_mut()
                    .find(|r| r.id == rule.id)
                    .ok_or_else(|| ValidationError::UnknownRule(rule.id.to_string()))?;
                *slot = rule.clone();
            }
            RateMutation::RemoveTimeBasedRate { id } => {
                remove_by_id(&mut next.time_based_rates, id, |r| &r.id)?;
            }
            RateMutation::AddSpecialPeriod { period } => {
                period.validate()?;
                if next.special_periods.iter().any(|p| p.id == period.id) {
                    return Err(ValidationError::DuplicateRule(period.id.to_string()).into());
                }
                PeriodOverlapValidator::check(period, &next.special_periods)?;
                next.special_periods.push(period.clone());
            }
            RateMutation::UpdateSpecialPeriod { period } => {
                period.validate()?;
                if !next.special_periods.iter().any(|p| p.id == period.id) {
                    return Err(ValidationError::UnknownRule(period.id.to_string()).into());
                }
                PeriodOverlapValidator::check(period, &next.special_periods)?;
                if let Some(slot) = next.special_periods.iter_mut().find(|p| p.id == period.id) {
                    *slot = period.clone();
                }
            }
            RateMutation::RemoveSpecialPeriod { id } => {
                remove_by_id(&mut next.special_periods, id, |p| &p.id)?;
            }
        }

        next.version = config.version + 1;
        debug!(
            coach_id = %config.coach_id,
            version = next.version,
            "Applied rate mutation"
        );
        Ok(next)
    }
}

fn check_amount(config: &RateConfig, rate: &Money, field: &'static str) -> Result<(), ValidationError> {
    if &rate.currency != config.currency() {
        return Err(ValidationError::ForeignCurrency(
            field,
            config.currency().to_string(),
        ));
    }
    if rate.is_negative() {
        return Err(ValidationError::NegativeAmount(field));
    }
    Ok(())
}

fn remove_by_id<T>(
    items: &mut Vec<T>,
    id: &RuleId,
    key: impl Fn(&T) -> &RuleId,
) -> Result<(), ValidationError> {
    let before = items.len();
    items.retain(|item| key(item) != id);
    if items.len() == before {
        return Err(ValidationError::UnknownRule(id.to_string()));
    }
    Ok(())
}
