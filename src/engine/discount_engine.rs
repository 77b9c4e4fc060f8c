use crate::domain::{Buyer, CoachId, DiscountCode, DiscountId, EntityRef, Money};
use crate::error::{PricingError, RedemptionError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use tracing::{debug, error};

/// A cart line to find a discount for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscountRequest {
    pub coach_id: CoachId,
    pub entity: EntityRef,
    pub buyer: Buyer,
    pub raw_price: Money,
    pub entered_code: Option<String>,
    /// Evaluation instant; passed in so quotes are reproducible.
    pub now: DateTime<Utc>,
}

/// Result of a discount quote. Quoting never redeems.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscountQuote {
    pub discount: Option<DiscountCode>,
    pub discount_amount: Money,
    pub discounted_price: Money,
}

/// Selects the discount that applies to a cart from a coach's catalog.
///
/// An entered code takes absolute precedence: automatic discounts are not
/// considered when the buyer typed a code, even if one would be worth more.
pub struct DiscountEngine<'a> {
    catalog: &'a [DiscountCode],
    redeemed: &'a BTreeSet<DiscountId>,
}

impl<'a> DiscountEngine<'a> {
    /// `redeemed` holds the discounts the buyer has already redeemed.
    pub fn new(catalog: &'a [DiscountCode], redeemed: &'a BTreeSet<DiscountId>) -> Self {
        Self { catalog, redeemed }
    }

    pub fn quote(&self, request: &DiscountRequest) -> Result<DiscountQuote, PricingError> {
        match request.entered_code.as_deref() {
            Some(code) => self.quote_entered(request, code),
            None => self.quote_automatic(request),
        }
    }

    fn quote_entered(
        &self,
        request: &DiscountRequest,
        entered: &str,
    ) -> Result<DiscountQuote, PricingError> {
        let code = self
            .catalog
            .iter()
            .filter(|c| c.coach_id == request.coach_id && c.is_active)
            .filter(|c| c.activation.matches_code(entered))
            .min_by(|a, b| a.id.cmp(&b.id))
            .ok_or(RedemptionError::CodeNotFound)?;

        self.check(code, request)?;
        let amount = code.value.amount_off(&request.raw_price)?;
        let discounted_price = request.raw_price.checked_sub(&amount)?;

        debug!(
            coach_id = %request.coach_id,
            discount_id = %code.id,
            amount = %amount,
            "Applied entered discount code"
        );

        Ok(DiscountQuote {
            discount: Some(code.clone()),
            discount_amount: amount,
            discounted_price,
        })
    }

    fn quote_automatic(&self, request: &DiscountRequest) -> Result<DiscountQuote, PricingError> {
        let mut best: Option<(&DiscountCode, Money)> = None;

        for code in self.catalog.iter().filter(|c| {
            c.coach_id == request.coach_id && c.is_active && c.activation.is_automatic()
        }) {
            match self.check(code, request) {
                Ok(()) => {}
                Err(PricingError::Redemption(reason)) => {
                    debug!(discount_id = %code.id, reason = %reason, "Automatic discount skipped");
                    continue;
                }
                Err(e) => {
                    error!(
                        discount_id = %code.id,
                        coach_id = %request.coach_id,
                        price = %request.raw_price,
                        error = %e,
                        "Automatic discount has inconsistent minimum purchase, skipped"
                    );
                    continue;
                }
            }

            let amount = match code.value.amount_off(&request.raw_price) {
                Ok(amount) => amount,
                Err(e) => {
                    // A misconfigured code must not block every other discount.
                    error!(
                        discount_id = %code.id,
                        coach_id = %request.coach_id,
                        price = %request.raw_price,
                        error = %e,
                        "Automatic discount has inconsistent value, skipped"
                    );
                    continue;
                }
            };

            let better = match &best {
                None => true,
                Some((current, current_amount)) => {
                    compare_candidates(code, &amount, current, current_amount) == Ordering::Less
                }
            };
            if better {
                best = Some((code, amount));
            }
        }

        let Some((code, amount)) = best else {
            return Ok(DiscountQuote {
                discount: None,
                discount_amount: Money::zero(request.raw_price.currency.clone()),
                discounted_price: request.raw_price.clone(),
            });
        };

        let discounted_price = request.raw_price.checked_sub(&amount)?;
        debug!(
            coach_id = %request.coach_id,
            discount_id = %code.id,
            amount = %amount,
            "Applied automatic discount"
        );
        Ok(DiscountQuote {
            discount: Some(code.clone()),
            discount_amount: amount,
            discounted_price,
        })
    }

    /// Candidate checks in reporting order. Existence and `is_active` are
    /// checked by the caller.
    fn check(&self, code: &DiscountCode, request: &DiscountRequest) -> Result<(), PricingError> {
        if code.not_started(request.now) {
            return Err(RedemptionError::CodeNotYetActive.into());
        }
        if code.expired(request.now) {
            return Err(RedemptionError::CodeExpired.into());
        }
        if code.exhausted() {
            return Err(RedemptionError::CodeExhausted.into());
        }
        if let Some(minimum) = &code.minimum_purchase_amount {
            if request.raw_price.lt(minimum)? {
                return Err(RedemptionError::MinimumPurchaseNotMet {
                    minimum: minimum.to_string(),
                }
                .into());
            }
        }
        if code.limit_to_one_per_customer && self.redeemed.contains(&code.id) {
            return Err(RedemptionError::AlreadyUsed.into());
        }
        if !code.applies_to.matches(&request.entity) {
            return Err(RedemptionError::ScopeMismatch.into());
        }
        if !code.eligibility.admits(&request.buyer) {
            return Err(RedemptionError::NotEligible.into());
        }
        Ok(())
    }
}

/// Orders candidates best-first: larger discount, then more specific scope,
/// then smaller id.
fn compare_candidates(a: &DiscountCode, a_amount: &Money, b: &DiscountCode, b_amount: &Money) -> Ordering {
    b_amount
        .amount
        .cmp(&a_amount.amount)
        .then_with(|| b.applies_to.specificity().cmp(&a.applies_to.specificity()))
        .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        Activation, AppliesTo, BuyerId, DiscountValue, Eligibility, IdSet, ProgramId,
        SessionTypeId,
    };
    use chrono::TimeZone;
    use rust_decimal::Decimal as RustDecimal;

    fn chf(amount: i64) -> Money {
        Money::from_minor(amount, "CHF").unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn code(id: &str, activation: Activation, value: DiscountValue) -> DiscountCode {
        DiscountCode {
            id: DiscountId::new(id),
            coach_id: CoachId::new("c1"),
            activation,
            value,
            applies_to: AppliesTo::PlatformWide,
            eligibility: Eligibility::All,
            is_active: true,
            start_date: None,
            expiry_date: None,
            usage_limit: None,
            usage_count: 0,
            limit_to_one_per_customer: false,
            minimum_purchase_amount: None,
        }
    }

    fn entered(id: &str, text: &str, pct: i64) -> DiscountCode {
        code(
            id,
            Activation::Code {
                code: text.to_string(),
            },
            DiscountValue::percent(RustDecimal::from(pct)).unwrap(),
        )
    }

    fn automatic(id: &str, value: DiscountValue) -> DiscountCode {
        code(id, Activation::Automatic { code: None }, value)
    }

    fn request(code: Option<&str>) -> DiscountRequest {
        DiscountRequest {
            coach_id: CoachId::new("c1"),
            entity: EntityRef::Session(SessionTypeId::new("yoga")),
            buyer: Buyer::new(BuyerId::new("b1")),
            raw_price: chf(10_000),
            entered_code: code.map(str::to_string),
            now: now(),
        }
    }

    fn quote(catalog: &[DiscountCode], req: &DiscountRequest) -> Result<DiscountQuote, PricingError> {
        let redeemed = BTreeSet::new();
        DiscountEngine::new(catalog, &redeemed).quote(req)
    }

    #[test]
    fn test_entered_code_applied() {
        let catalog = vec![entered("d1", "SPRING", 20)];
        let q = quote(&catalog, &request(Some("spring"))).unwrap();
        assert_eq!(q.discount.unwrap().id, DiscountId::new("d1"));
        assert_eq!(q.discount_amount, chf(2_000));
        assert_eq!(q.discounted_price, chf(8_000));
    }

    #[test]
    fn test_unknown_or_inactive_code_not_found() {
        let mut inactive = entered("d1", "SPRING", 20);
        inactive.is_active = false;
        let catalog = vec![inactive];
        assert_eq!(
            quote(&catalog, &request(Some("SPRING"))).unwrap_err(),
            PricingError::Redemption(RedemptionError::CodeNotFound)
        );
        assert_eq!(
            quote(&catalog, &request(Some("OTHER"))).unwrap_err(),
            PricingError::Redemption(RedemptionError::CodeNotFound)
        );
    }

    #[test]
    fn test_other_coach_codes_not_visible() {
        let mut foreign = entered("d1", "SPRING", 20);
        foreign.coach_id = CoachId::new("c2");
        assert_eq!(
            quote(&[foreign], &request(Some("SPRING"))).unwrap_err(),
            PricingError::Redemption(RedemptionError::CodeNotFound)
        );
    }

    #[test]
    fn test_first_violated_reason_reported() {
        let mut c = entered("d1", "SPRING", 20);
        c.expiry_date = Some(now() - chrono::Duration::days(1));
        c.usage_limit = Some(1);
        c.usage_count = 1;
        assert_eq!(
            quote(&[c.clone()], &request(Some("SPRING"))).unwrap_err(),
            PricingError::Redemption(RedemptionError::CodeExpired)
        );

        c.expiry_date = None;
        assert_eq!(
            quote(&[c.clone()], &request(Some("SPRING"))).unwrap_err(),
            PricingError::Redemption(RedemptionError::CodeExhausted)
        );

        c.usage_limit = None;
        c.start_date = Some(now() + chrono::Duration::days(1));
        assert_eq!(
            quote(&[c], &request(Some("SPRING"))).unwrap_err(),
            PricingError::Redemption(RedemptionError::CodeNotYetActive)
        );
    }

    #[test]
    fn test_minimum_purchase() {
        let mut c = entered("d1", "BIG", 10);
        c.minimum_purchase_amount = Some(chf(20_000));
        assert_eq!(
            quote(&[c.clone()], &request(Some("BIG"))).unwrap_err(),
            PricingError::Redemption(RedemptionError::MinimumPurchaseNotMet {
                minimum: "200.00 CHF".to_string()
            })
        );

        c.minimum_purchase_amount = Some(chf(10_000));
        assert!(quote(&[c], &request(Some("BIG"))).is_ok());
    }

    #[test]
    fn test_one_per_customer() {
        let mut c = entered("d1", "ONCE", 10);
        c.limit_to_one_per_customer = true;
        let catalog = vec![c];
        let redeemed: BTreeSet<_> = [DiscountId::new("d1")].into_iter().collect();
        let err = DiscountEngine::new(&catalog, &redeemed)
            .quote(&request(Some("ONCE")))
            .unwrap_err();
        assert_eq!(err, PricingError::Redemption(RedemptionError::AlreadyUsed));
    }

    #[test]
    fn test_scope_and_eligibility() {
        let mut c = entered("d1", "PROG", 10);
        c.applies_to =
            AppliesTo::SpecificPrograms(IdSet::new(vec![ProgramId::new("p1")], "p").unwrap());
        assert_eq!(
            quote(&[c.clone()], &request(Some("PROG"))).unwrap_err(),
            PricingError::Redemption(RedemptionError::ScopeMismatch)
        );

        c.applies_to = AppliesTo::AllSessions;
        c.eligibility = Eligibility::Individuals(IdSet::new(vec![BuyerId::new("b9")], "i").unwrap());
        assert_eq!(
            quote(&[c], &request(Some("PROG"))).unwrap_err(),
            PricingError::Redemption(RedemptionError::NotEligible)
        );
    }

    #[test]
    fn test_fixed_discount_never_negative() {
        let c = code(
            "d1",
            Activation::Code {
                code: "FLAT".to_string(),
            },
            DiscountValue::fixed(chf(15_000)).unwrap(),
        );
        let q = quote(&[c], &request(Some("FLAT"))).unwrap();
        assert_eq!(q.discounted_price, chf(0));
        assert_eq!(q.discount_amount, chf(10_000));
    }

    #[test]
    fn test_best_automatic_discount_selected() {
        let catalog = vec![
            automatic("a", DiscountValue::percent(RustDecimal::from(10)).unwrap()),
            automatic("b", DiscountValue::fixed(chf(1_500)).unwrap()),
            entered("c", "HUGE", 90),
        ];
        let q = quote(&catalog, &request(None)).unwrap();
        assert_eq!(q.discount.unwrap().id, DiscountId::new("b"));
        assert_eq!(q.discounted_price, chf(8_500));
    }

    #[test]
    fn test_automatic_tie_break_by_specificity_then_id() {
        let mut specific = automatic("z", DiscountValue::fixed(chf(1_000)).unwrap());
        specific.applies_to = AppliesTo::SpecificSessionTypes(
            IdSet::new(vec![SessionTypeId::new("yoga")], "s").unwrap(),
        );
        let mut all = automatic("y", DiscountValue::fixed(chf(1_000)).unwrap());
        all.applies_to = AppliesTo::AllSessions;
        let wide = automatic("a", DiscountValue::fixed(chf(1_000)).unwrap());

        let q = quote(&[wide.clone(), all.clone(), specific], &request(None)).unwrap();
        assert_eq!(q.discount.unwrap().id, DiscountId::new("z"));

        let q = quote(&[wide.clone(), all], &request(None)).unwrap();
        assert_eq!(q.discount.unwrap().id, DiscountId::new("y"));

        let wide_b = automatic("b", DiscountValue::fixed(chf(1_000)).unwrap());
        let q = quote(&[wide_b, wide], &request(None)).unwrap();
        assert_eq!(q.discount.unwrap().id, DiscountId::new("a"));
    }

    #[test]
    fn test_entered_code_suppresses_automatic() {
        let catalog = vec![
            automatic("auto", DiscountValue::percent(RustDecimal::from(50)).unwrap()),
            entered("code", "SMALL", 5),
        ];
        let q = quote(&catalog, &request(Some("SMALL"))).unwrap();
        assert_eq!(q.discount.unwrap().id, DiscountId::new("code"));
        assert_eq!(q.discounted_price, chf(9_500));
    }

    #[test]
    fn test_no_automatic_candidates_returns_raw_price() {
        let mut expired = automatic("a", DiscountValue::fixed(chf(100)).unwrap());
        expired.expiry_date = Some(now() - chrono::Duration::hours(1));
        let q = quote(&[expired], &request(None)).unwrap();
        assert!(q.discount.is_none());
        assert_eq!(q.discounted_price, chf(10_000));
        assert_eq!(q.discount_amount, chf(0));
    }

    #[test]
    fn test_foreign_currency_automatic_skipped() {
        let eur = Money::from_minor(5_000, "EUR").unwrap();
        let catalog = vec![
            automatic("eur", DiscountValue::fixed(eur).unwrap()),
            automatic("chf", DiscountValue::fixed(chf(100)).unwrap()),
        ];
        let q = quote(&catalog, &request(None)).unwrap();
        assert_eq!(q.discount.unwrap().id, DiscountId::new("chf"));
    }

    #[test]
    fn test_foreign_currency_minimum_skipped_for_automatic() {
        let mut misconfigured = automatic("eur-min", DiscountValue::percent(RustDecimal::from(50)).unwrap());
        misconfigured.minimum_purchase_amount = Some(Money::from_minor(100, "EUR").unwrap());
        let catalog = vec![
            misconfigured,
            automatic("ten", DiscountValue::percent(RustDecimal::from(10)).unwrap()),
        ];
        let q = quote(&catalog, &request(None)).unwrap();
        assert_eq!(q.discount.unwrap().id, DiscountId::new("ten"));
        assert_eq!(q.discounted_price, chf(9_000));
    }
}
