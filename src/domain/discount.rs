//! Discount codes: activation, value, scope and eligibility as tagged variants.

use crate::domain::{
    BuyerId, CoachId, DiscountId, IdSet, Money, Percent, ProgramId, SegmentId, SessionTypeId,
};
use crate::error::{FinancialInvariantError, ValidationError};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal as RustDecimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The item being priced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum EntityRef {
    Session(SessionTypeId),
    Program(ProgramId),
}

impl EntityRef {
    pub fn kind(&self) -> &'static str {
        match self {
            EntityRef::Session(_) => "session",
            EntityRef::Program(_) => "program",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            EntityRef::Session(id) => id.as_str(),
            EntityRef::Program(id) => id.as_str(),
        }
    }
}

/// The buyer a quote is computed for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buyer {
    pub id: BuyerId,
    #[serde(default)]
    pub segments: BTreeSet<SegmentId>,
}

impl Buyer {
    pub fn new(id: BuyerId) -> Self {
        Buyer {
            id,
            segments: BTreeSet::new(),
        }
    }

    pub fn with_segment(mut self, segment: SegmentId) -> Self {
        self.segments.insert(segment);
        self
    }
}

/// How a discount is triggered. Only automatic discounts may lack a code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Activation {
    Code { code: String },
    Automatic { code: Option<String> },
}

impl Activation {
    pub fn code(&self) -> Option<&str> {
        match self {
            Activation::Code { code } => Some(code),
            Activation::Automatic { code } => code.as_deref(),
        }
    }

    pub fn is_automatic(&self) -> bool {
        matches!(self, Activation::Automatic { .. })
    }

    /// Case-insensitive comparison against a code entered by a buyer.
    pub fn matches_code(&self, entered: &str) -> bool {
        self.code()
            .map(|c| c.trim().to_lowercase() == entered.trim().to_lowercase())
            .unwrap_or(false)
    }
}

/// Discount value: percentage of the price or a fixed amount off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum DiscountValue {
    Percent(Percent),
    Fixed(Money),
}

impl DiscountValue {
    pub fn percent(value: RustDecimal) -> Result<Self, ValidationError> {
        Ok(DiscountValue::Percent(Percent::discount(value)?))
    }

    pub fn fixed(amount: Money) -> Result<Self, ValidationError> {
        if amount.amount <= 0 {
            return Err(ValidationError::NonPositiveAmount("fixed discount value"));
        }
        Ok(DiscountValue::Fixed(amount))
    }

    fn validate(&self) -> Result<(), ValidationError> {
        match self {
            DiscountValue::Percent(p) => Percent::discount(p.inner()).map(|_| ()),
            DiscountValue::Fixed(m) => DiscountValue::fixed(m.clone()).map(|_| ()),
        }
    }

    /// Amount taken off `price`; never more than the price itself.
    pub fn amount_off(&self, price: &Money) -> Result<Money, FinancialInvariantError> {
        match self {
            DiscountValue::Percent(p) => price.percent(*p)?.min(price),
            DiscountValue::Fixed(m) => m.min(price),
        }
    }
}

/// Which entities a discount applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "entityIds", rename_all = "snake_case")]
pub enum AppliesTo {
    PlatformWide,
    AllPrograms,
    AllSessions,
    SpecificPrograms(IdSet<ProgramId>),
    SpecificSessionTypes(IdSet<SessionTypeId>),
}

impl AppliesTo {
    pub fn matches(&self, entity: &EntityRef) -> bool {
        match (self, entity) {
            (AppliesTo::PlatformWide, _) => true,
            (AppliesTo::AllPrograms, EntityRef::Program(_)) => true,
            (AppliesTo::AllSessions, EntityRef::Session(_)) => true,
            (AppliesTo::SpecificPrograms(ids), EntityRef::Program(id)) => ids.contains(id),
            (AppliesTo::SpecificSessionTypes(ids), EntityRef::Session(id)) => ids.contains(id),
            _ => false,
        }
    }

    /// Rank used to break ties between equally valuable automatic discounts.
    pub fn specificity(&self) -> u8 {
        match self {
            AppliesTo::PlatformWide => 0,
            AppliesTo::AllPrograms | AppliesTo::AllSessions => 1,
            AppliesTo::SpecificPrograms(_) | AppliesTo::SpecificSessionTypes(_) => 2,
        }
    }
}

/// Which buyers may redeem a discount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "entityIds", rename_all = "snake_case")]
pub enum Eligibility {
    All,
    Segments(IdSet<SegmentId>),
    Individuals(IdSet<BuyerId>),
}

impl Eligibility {
    pub fn admits(&self, buyer: &Buyer) -> bool {
        match self {
            Eligibility::All => true,
            Eligibility::Segments(ids) => buyer.segments.iter().any(|s| ids.contains(s)),
            Eligibility::Individuals(ids) => ids.contains(&buyer.id),
        }
    }
}

/// A coach-defined discount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscountCode {
    pub id: DiscountId,
    pub coach_id: CoachId,
    pub activation: Activation,
    pub value: DiscountValue,
    pub applies_to: AppliesTo,
    pub eligibility: Eligibility,
    pub is_active: bool,
    pub start_date: Option<DateTime<Utc>>,
    pub expiry_date: Option<DateTime<Utc>>,
    pub usage_limit: Option<u32>,
    pub usage_count: u32,
    pub limit_to_one_per_customer: bool,
    pub minimum_purchase_amount: Option<Money>,
}

impl DiscountCode {
    /// Check the shape of a code before it is stored.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Activation::Code { code } = &self.activation {
            if code.trim().is_empty() {
                return Err(ValidationError::BlankCode);
            }
        }
        if let Activation::Automatic { code: Some(code) } = &self.activation {
            if code.trim().is_empty() {
                return Err(ValidationError::BlankCode);
            }
        }
        self.value.validate()?;
        if let (Some(start), Some(end)) = (self.start_date, self.expiry_date) {
            if start > end {
                return Err(ValidationError::InvalidRange {
                    start: start.to_rfc3339(),
                    end: end.to_rfc3339(),
                });
            }
        }
        if let Some(min) = &self.minimum_purchase_amount {
            if min.is_negative() {
                return Err(ValidationError::NegativeAmount("minimum purchase amount"));
            }
            if let DiscountValue::Fixed(value) = &self.value {
                if value.currency != min.currency {
                    return Err(ValidationError::ForeignCurrency(
                        "minimum purchase amount",
                        value.currency.to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn not_started(&self, now: DateTime<Utc>) -> bool {
        self.start_date.map(|s| now < s).unwrap_or(false)
    }

    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry_date.map(|e| now > e).unwrap_or(false)
    }

    pub fn exhausted(&self) -> bool {
        self.usage_limit
            .map(|limit| self.usage_count >= limit)
            .unwrap_or(false)
    }
}
