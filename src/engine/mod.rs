//! Pure computation engines for pricing and earnings.
//!
//! Everything here is synchronous and side-effect free: the same inputs always
//! produce the same outputs, so engines can be called from any number of
//! concurrent tasks without locking.

pub mod discount_engine;
pub mod earnings;
pub mod overlap;
pub mod payout;
pub mod rate_editor;
pub mod rate_resolver;

pub use discount_engine::{DiscountEngine, DiscountQuote, DiscountRequest};
pub use earnings::{EarningsBreakdown, EarningsCalculator};
pub use overlap::PeriodOverlapValidator;
pub use payout::{PayoutBatchPlan, PayoutPlanner};
pub use rate_editor::RateEditor;
pub use rate_resolver::{RateResolver, RateSource, ResolvedRate};
