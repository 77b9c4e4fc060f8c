//! Request-level flows that combine the engines with a store.

pub mod service;

pub use service::{PricingService, Quote, QuoteItem, QuoteRequest, RefundOutcome, ServiceError};
