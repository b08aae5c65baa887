use std::env;
use std::time::Duration;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub timeouts: DispatchTimeouts,
    pub fees: FeeSchedule,
}

/// Wall-clock limits used by the expiry timer and the reaper.
#[derive(Debug, Clone, Copy)]
pub struct DispatchTimeouts {
    pub search_timeout: Duration,
    pub stale_search: Duration,
    pub stuck_accepted: Duration,
    pub lock_stale: Duration,
    pub cancelled_retention: Duration,
    pub reaper_interval: Duration,
}

impl Default for DispatchTimeouts {
    fn default() -> Self {
        Self {
            search_timeout: Duration::from_secs(60),
            stale_search: Duration::from_secs(5 * 60),
            stuck_accepted: Duration::from_secs(10 * 60),
            lock_stale: Duration::from_secs(30),
            cancelled_retention: Duration::from_secs(5 * 60),
            reaper_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeeSchedule {
    pub rider_accepted: f64,
    pub rider_arrived: f64,
    pub driver_arrived: f64,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            rider_accepted: 25.0,
            rider_arrived: 50.0,
            driver_arrived: 50.0,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 9092,
            log_level: "info".to_string(),
            timeouts: DispatchTimeouts::default(),
            fees: FeeSchedule::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let defaults = DispatchTimeouts::default();
        let timeouts = DispatchTimeouts {
            search_timeout: secs_or_default("SEARCH_TIMEOUT_SECS", defaults.search_timeout)?,
            stale_search: secs_or_default("STALE_SEARCH_SECS", defaults.stale_search)?,
            stuck_accepted: secs_or_default("STUCK_ACCEPTED_SECS", defaults.stuck_accepted)?,
            lock_stale: secs_or_default("LOCK_STALE_SECS", defaults.lock_stale)?,
            cancelled_retention: secs_or_default(
                "CANCELLED_RETENTION_SECS",
                defaults.cancelled_retention,
            )?,
            reaper_interval: secs_or_default("REAPER_INTERVAL_SECS", defaults.reaper_interval)?,
        };

        let fee_defaults = FeeSchedule::default();
        let fees = FeeSchedule {
            rider_accepted: parse_or_default("RIDER_FEE_ACCEPTED", fee_defaults.rider_accepted)?,
            rider_arrived: parse_or_default("RIDER_FEE_ARRIVED", fee_defaults.rider_arrived)?,
            driver_arrived: parse_or_default("DRIVER_FEE_ARRIVED", fee_defaults.driver_arrived)?,
        };

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 9092)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            timeouts,
            fees,
        })
    }
}

fn secs_or_default(key: &str, default: Duration) -> Result<Duration, AppError> {
    parse_or_default(key, default.as_secs()).map(Duration::from_secs)
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
