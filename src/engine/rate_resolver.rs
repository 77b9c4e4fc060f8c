use crate::domain::{Money, Percent, RateConfig, RuleId, SessionKind, SessionTypeId};
use crate::error::PricingError;
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// The rule that produced a resolved price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", content = "id", rename_all = "snake_case")]
pub enum RateSource {
    SpecialPeriod(RuleId),
    TimeBasedRate(RuleId),
    SessionTypeRate(SessionTypeId),
    BaseRate,
    LiveSessionRate,
}

/// Effective pre-discount price for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedRate {
    /// Price after any special-period or time-based discount.
    pub price: Money,
    /// Session-type rate or base rate the discount was taken from.
    pub list_price: Money,
    pub source: RateSource,
    pub discount_percent: Option<Percent>,
}

/// Resolves the effective price of a session against a coach's rate config.
///
/// Precedence: special period > time-based rate > session-type rate > base
/// (or live-session) rate. Rule discounts apply to the list price and never
/// stack with each other.
pub struct RateResolver<'a> {
    config: &'a RateConfig,
}

impl<'a> RateResolver<'a> {
    pub fn new(config: &'a RateConfig) -> Self {
        Self { config }
    }

    /// Resolve the price of a session starting at `start`, expressed with the
    /// coach's UTC offset so both the absolute instant and the local
    /// weekday/time are known.
    pub fn resolve(
        &self,
        session_type: &SessionTypeId,
        kind: SessionKind,
        start: &DateTime<FixedOffset>,
    ) -> Result<ResolvedRate, PricingError> {
        let (list_price, fallback_source) = self.list_price(session_type, kind);

        let rule = self
            .special_period(session_type, start.with_timezone(&Utc))
            .or_else(|| self.time_based_rate(session_type, start));

        let Some((source, pct)) = rule else {
            debug!(
                coach_id = %self.config.coach_id,
                session_type = %session_type,
                source = ?fallback_source,
                "Resolved list price"
            );
            return Ok(ResolvedRate {
                price: list_price.clone(),
                list_price,
                source: fallback_source,
                discount_percent: None,
            });
        };

        let discount = list_price.percent(pct)?;
        let price = list_price.checked_sub(&discount)?;

        debug!(
            coach_id = %self.config.coach_id,
            session_type = %session_type,
            source = ?source,
            discount_percent = %pct,
            price = %price,
            "Resolved discounted price"
        );

        Ok(ResolvedRate {
            price,
            list_price,
            source,
            discount_percent: Some(pct),
        })
    }

    fn list_price(&self, session_type: &SessionTypeId, kind: SessionKind) -> (Money, RateSource) {
        if let Some(rate) = self.config.session_type_rates.get(session_type) {
            return (rate.clone(), RateSource::SessionTypeRate(session_type.clone()));
        }
        match kind {
            SessionKind::Standard => (self.config.base_rate.clone(), RateSource::BaseRate),
            SessionKind::Live => (
                self.config.live_session_rate.clone(),
                RateSource::LiveSessionRate,
            ),
        }
    }

    fn special_period(
        &self,
        session_type: &SessionTypeId,
        at: DateTime<Utc>,
    ) -> Option<(RateSource, Percent)> {
        let matching: Vec<_> = self
            .config
            .special_periods
            .iter()
            .filter(|p| p.matches(session_type, at))
            .map(|p| (&p.id, p.discount_percent))
            .collect();

        if matching.len() > 1 {
            // Write-time validation should make this unreachable.
            let ids: Vec<&str> = matching.iter().map(|(id, _)| id.as_str()).collect();
            warn!(
                coach_id = %self.config.coach_id,
                session_type = %session_type,
                periods = ?ids,
                "Multiple special periods match one session"
            );
        }

        pick_largest(matching).map(|(id, pct)| (RateSource::SpecialPeriod(id), pct))
    }

    fn time_based_rate(
        &self,
        session_type: &SessionTypeId,
        at: &DateTime<FixedOffset>,
    ) -> Option<(RateSource, Percent)> {
        let matching = self
            .config
            .time_based_rates
            .iter()
            .filter(|r| r.matches(session_type, at))
            .map(|r| (&r.id, r.discount_percent))
            .collect();

        pick_largest(matching).map(|(id, pct)| (RateSource::TimeBasedRate(id), pct))
    }
}

/// Largest discount wins; equal discounts go to the smallest rule id.
fn pick_largest(mut rules: Vec<(&RuleId, Percent)>) -> Option<(RuleId, Percent)> {
    rules.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    rules.into_iter().next().map(|(id, pct)| (id.clone(), pct))
}
