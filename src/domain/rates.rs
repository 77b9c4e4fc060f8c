//! Coach rate configuration: base rates, session-type overrides, time-based
//! rules and special periods.

use crate::domain::{CoachId, Currency, IdSet, Money, Percent, RuleId, SessionTypeId};
use crate::error::ValidationError;
use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Whether a session is a regular booking or a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Standard,
    Live,
}

/// Wall-clock time-of-day range in coach-local time, half-open `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRange<NaiveTime>")]
pub struct TimeRange {
    start: NaiveTime,
    end: NaiveTime,
}

/// Absolute instant range, half-open `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRange<DateTime<Utc>>")]
pub struct DateRange {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

/// Unvalidated `{start, end}` pair as it arrives over the wire.
#[derive(Deserialize)]
pub struct RawRange<T> {
    start: T,
    end: T,
}

impl TimeRange {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Result<Self, ValidationError> {
        if start >= end {
            return Err(ValidationError::InvalidRange {
                start: start.to_string(),
                end: end.to_string(),
            });
        }
        Ok(TimeRange { start, end })
    }

    pub fn start(&self) -> NaiveTime {
        self.start
    }

    pub fn end(&self) -> NaiveTime {
        self.end
    }

    pub fn contains(&self, t: NaiveTime) -> bool {
        self.start <= t && t < self.end
    }
}

impl TryFrom<RawRange<NaiveTime>> for TimeRange {
    type Error = ValidationError;

    fn try_from(raw: RawRange<NaiveTime>) -> Result<Self, Self::Error> {
        TimeRange::new(raw.start, raw.end)
    }
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, ValidationError> {
        if start >= end {
            return Err(ValidationError::InvalidRange {
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
            });
        }
        Ok(DateRange { start, end })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }

    /// Open-interval intersection: touching ranges do not overlap.
    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start < other.end && self.end > other.start
    }
}

impl TryFrom<RawRange<DateTime<Utc>>> for DateRange {
    type Error = ValidationError;

    fn try_from(raw: RawRange<DateTime<Utc>>) -> Result<Self, Self::Error> {
        DateRange::new(raw.start, raw.end)
    }
}

/// Non-empty set of weekdays, `0 = Sunday` through `6 = Saturday`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct DaysOfWeek(BTreeSet<u8>);

impl DaysOfWeek {
    pub fn new(days: impl IntoIterator<Item = u8>) -> Result<Self, ValidationError> {
        let set: BTreeSet<u8> = days.into_iter().collect();
        if set.is_empty() {
            return Err(ValidationError::EmptySet("daysOfWeek"));
        }
        if let Some(bad) = set.iter().find(|d| **d > 6) {
            return Err(ValidationError::InvalidDayOfWeek(*bad));
        }
        Ok(DaysOfWeek(set))
    }

    pub fn contains(&self, day: u8) -> bool {
        self.0.contains(&day)
    }
}

impl TryFrom<Vec<u8>> for DaysOfWeek {
    type Error = ValidationError;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        DaysOfWeek::new(value)
    }
}

impl From<DaysOfWeek> for Vec<u8> {
    fn from(value: DaysOfWeek) -> Self {
        value.0.into_iter().collect()
    }
}

/// Day/time-of-week discount for a set of session types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeBasedRate {
    pub id: RuleId,
    pub name: String,
    pub session_type_ids: IdSet<SessionTypeId>,
    pub days_of_week: DaysOfWeek,
    pub time_range: TimeRange,
    pub discount_percent: Percent,
    pub is_active: bool,
}

impl TimeBasedRate {
    /// True if the rule is active, covers the session type, and the coach-local
    /// weekday and time of `at` fall inside its window.
    pub fn matches(&self, session_type: &SessionTypeId, at: &DateTime<FixedOffset>) -> bool {
        if !self.is_active || !self.session_type_ids.contains(session_type) {
            return false;
        }
        let weekday = at.weekday().num_days_from_sunday() as u8;
        self.days_of_week.contains(weekday) && self.time_range.contains(at.time())
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        Percent::discount(self.discount_percent.inner()).map(|_| ())
    }
}

/// Date-ranged promotion for a set of session types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecialPeriod {
    pub id: RuleId,
    pub name: String,
    pub session_type_ids: IdSet<SessionTypeId>,
    pub date_range: DateRange,
    pub discount_percent: Percent,
    pub is_active: bool,
}

impl SpecialPeriod {
    pub fn matches(&self, session_type: &SessionTypeId, at: DateTime<Utc>) -> bool {
        self.is_active && self.session_type_ids.contains(session_type) && self.date_range.contains(at)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        Percent::discount(self.discount_percent.inner()).map(|_| ())
    }
}

/// A coach's complete rate configuration.
///
/// Every amount shares the base rate's currency. `version` increments on each
/// accepted mutation and guards optimistic-concurrency writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateConfig {
    pub coach_id: CoachId,
    pub base_rate: Money,
    pub live_session_rate: Money,
    pub session_type_rates: BTreeMap<SessionTypeId, Money>,
    pub time_based_rates: Vec<TimeBasedRate>,
    pub special_periods: Vec<SpecialPeriod>,
    pub version: u64,
}

impl RateConfig {
    /// Configuration created on coach onboarding: zero rates, no rules.
    pub fn onboarding_default(coach_id: CoachId, currency: Currency) -> Self {
        RateConfig {
            coach_id,
            base_rate: Money::zero(currency.clone()),
            live_session_rate: Money::zero(currency),
            session_type_rates: BTreeMap::new(),
            time_based_rates: Vec::new(),
            special_periods: Vec::new(),
            version: 0,
        }
    }

    pub fn currency(&self) -> &Currency {
        &self.base_rate.currency
    }

    /// Active special periods covering a session type, in id order.
    pub fn active_periods_for(&self, session_type: &SessionTypeId) -> Vec<&SpecialPeriod> {
        let mut periods: Vec<_> = self
            .special_periods
            .iter()
            .filter(|p| p.is_active && p.session_type_ids.contains(session_type))
            .collect();
        periods.sort_by(|a, b| a.id.cmp(&b.id));
        periods
    }
}

/// A single validated change to a [`RateConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RateMutation {
    SetBaseRate { rate: Money },
    SetLiveSessionRate { rate: Money },
    SetSessionTypeRate { session_type_id: SessionTypeId, rate: Money },
    RemoveSessionTypeRate { session_type_id: SessionTypeId },
    AddTimeBasedRate { rule: TimeBasedRate },
    UpdateTimeBasedRate { rule: TimeBasedRate },
    RemoveTimeBasedRate { id: RuleId },
    AddSpecialPeriod { period: SpecialPeriod },
    UpdateSpecialPeriod { period: SpecialPeriod },
    RemoveSpecialPeriod { id: RuleId },
}
