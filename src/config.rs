use crate::domain::{Currency, Percent, RateSnapshot};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    /// Currency of rate configs created on coach onboarding.
    pub default_currency: Currency,
    pub platform_fee_rate: Percent,
    pub vat_rate: Percent,
    pub processing_fee_rate: Percent,
    /// Retries of a rate mutation that lost an optimistic-concurrency race.
    pub rate_write_retries: u32,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(std::env::vars().collect())
    }

    pub fn from_env_map(env_map: HashMap<String, String>) -> Result<Self, ConfigError> {
        let database_path = env_map
            .get("DATABASE_PATH")
            .cloned()
            .ok_or_else(|| ConfigError::MissingEnv("DATABASE_PATH".to_string()))?;

        let default_currency = Currency::new(
            env_map
                .get("DEFAULT_CURRENCY")
                .map(|s| s.as_str())
                .unwrap_or("CHF"),
        )
        .map_err(|e| ConfigError::InvalidValue("DEFAULT_CURRENCY".to_string(), e.to_string()))?;

        let platform_fee_rate = parse_percent(&env_map, "PLATFORM_FEE_RATE", "9.9")?;
        let vat_rate = parse_percent(&env_map, "VAT_RATE", "0")?;
        let processing_fee_rate = parse_percent(&env_map, "PROCESSING_FEE_RATE", "0")?;

        let rate_write_retries = env_map
            .get("RATE_WRITE_RETRIES")
            .map(|s| s.as_str())
            .unwrap_or("3")
            .parse::<u32>()
            .map_err(|_| {
                ConfigError::InvalidValue(
                    "RATE_WRITE_RETRIES".to_string(),
                    "must be a valid u32".to_string(),
                )
            })?;

        Ok(Config {
            database_path,
            default_currency,
            platform_fee_rate,
            vat_rate,
            processing_fee_rate,
            rate_write_retries,
        })
    }

    /// Platform rates to capture on a new sale.
    pub fn rate_snapshot(&self) -> RateSnapshot {
        RateSnapshot {
            platform_fee_rate: self.platform_fee_rate,
            vat_rate: self.vat_rate,
            processing_fee_rate: self.processing_fee_rate,
        }
    }
}

fn parse_percent(
    env_map: &HashMap<String, String>,
    key: &str,
    default: &str,
) -> Result<Percent, ConfigError> {
    let raw = env_map.get(key).map(|s| s.as_str()).unwrap_or(default);
    Percent::from_str_canonical(raw)
        .map_err(|e| ConfigError::InvalidValue(key.to_string(), e.to_string()))
}
