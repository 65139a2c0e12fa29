//! Configuration module
//!
//! Loads configuration from environment variables.

use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::jobs::SchedulerConfig;
use crate::reconciliation::{CheckTolerances, ReconciliationConfig};

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection URL
    pub database_url: String,

    /// Maximum database connections in pool
    pub database_max_connections: u32,

    /// Ops server host
    pub host: String,

    /// Ops server port
    pub port: u16,

    /// Environment (development, production)
    pub environment: String,

    pub hourly_interval: Duration,
    pub daily_interval: Duration,
    pub check_timeout: Duration,
    pub shutdown_timeout: Duration,

    /// Allowed gap between the USDC buffer and the custodian total
    pub custodian_tolerance: Decimal,

    /// Allowed gap between fiat exposure and brokerage buying power
    pub brokerage_tolerance: Decimal,

    pub auto_correct_low: bool,
    pub enable_alerting: bool,

    /// Alerts go to the log when unset
    pub alert_webhook_url: Option<String>,

    pub custodian_balance_url: Option<String>,
    pub brokerage_balance_url: Option<String>,
    pub provider_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::MissingEnv("DATABASE_URL"))?;

        let custodian_tolerance = parse_or(&lookup, "RECON_CUSTODIAN_TOLERANCE", Decimal::from(10))?;
        let brokerage_tolerance = parse_or(&lookup, "RECON_BROKERAGE_TOLERANCE", Decimal::from(100))?;
        if custodian_tolerance.is_sign_negative() {
            return Err(ConfigError::InvalidValue("RECON_CUSTODIAN_TOLERANCE"));
        }
        if brokerage_tolerance.is_sign_negative() {
            return Err(ConfigError::InvalidValue("RECON_BROKERAGE_TOLERANCE"));
        }

        Ok(Self {
            database_url,
            database_max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 10)?,
            host: lookup("HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse_or(&lookup, "PORT", 3000)?,
            environment: lookup("ENVIRONMENT").unwrap_or_else(|| "development".to_string()),
            hourly_interval: secs_or(&lookup, "RECON_HOURLY_INTERVAL_SECS", 3600)?,
            daily_interval: secs_or(&lookup, "RECON_DAILY_INTERVAL_SECS", 86_400)?,
            check_timeout: secs_or(&lookup, "RECON_CHECK_TIMEOUT_SECS", 30)?,
            shutdown_timeout: secs_or(&lookup, "RECON_SHUTDOWN_TIMEOUT_SECS", 30)?,
            custodian_tolerance,
            brokerage_tolerance,
            auto_correct_low: parse_or(&lookup, "RECON_AUTO_CORRECT_LOW", true)?,
            enable_alerting: parse_or(&lookup, "RECON_ENABLE_ALERTING", true)?,
            alert_webhook_url: non_empty(&lookup, "RECON_ALERT_WEBHOOK_URL"),
            custodian_balance_url: non_empty(&lookup, "CUSTODIAN_BALANCE_URL"),
            brokerage_balance_url: non_empty(&lookup, "BROKERAGE_BALANCE_URL"),
            provider_timeout: secs_or(&lookup, "PROVIDER_TIMEOUT_SECS", 10)?,
        })
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            hourly_interval: self.hourly_interval,
            daily_interval: self.daily_interval,
            shutdown_timeout: self.shutdown_timeout,
        }
    }

    pub fn reconciliation(&self) -> ReconciliationConfig {
        ReconciliationConfig {
            check_timeout: self.check_timeout,
            auto_correct_low: self.auto_correct_low,
            enable_alerting: self.enable_alerting,
        }
    }

    pub fn tolerances(&self) -> CheckTolerances {
        CheckTolerances {
            custodian: self.custodian_tolerance,
            brokerage: self.brokerage_tolerance,
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue(key)),
        None => Ok(default),
    }
}

fn secs_or<F>(lookup: &F, key: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let secs: u64 = parse_or(lookup, key, default)?;
    if secs == 0 {
        return Err(ConfigError::InvalidValue(key));
    }
    Ok(Duration::from_secs(secs))
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).filter(|v| !v.trim().is_empty())
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}
