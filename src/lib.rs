pub mod config;
pub mod db;
pub mod domain;
pub mod engine;
pub mod error;
pub mod orchestration;
pub mod repository;

pub use config::Config;
pub use db::{init_db, Repository};
pub use domain::{Currency, Money, Percent};
pub use error::PricingError;
pub use orchestration::{PricingService, ServiceError};
pub use repository::{MemoryStore, PricingStore, StoreError};
