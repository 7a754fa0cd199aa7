use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDate;
use chrono_tz::Tz;
use thiserror::Error;

use crate::business_hours::BusinessHoursConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),

    #[error("{key}: cannot parse {value:?}")]
    Parse { key: &'static str, value: String },

    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),
}

/// Worker settings, read from `TANDEM_*` environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub sweep_interval: Duration,
    pub compact_threshold: u64,
    pub business_hours: BusinessHoursConfig,
    /// Directory of `<account>.json` raw event files, if any.
    pub calendar_dir: Option<PathBuf>,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. `from_env` is this over the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let data_dir = lookup("TANDEM_DATA_DIR").unwrap_or_else(|| "./data".into());
        let metrics_port = parse_opt::<u16>(&lookup, "TANDEM_METRICS_PORT")?;
        let sweep_secs = parse_opt::<u64>(&lookup, "TANDEM_SWEEP_INTERVAL_SECS")?.unwrap_or(300);
        if sweep_secs == 0 {
            return Err(ConfigError::Invalid("TANDEM_SWEEP_INTERVAL_SECS must be positive"));
        }
        let compact_threshold =
            parse_opt::<u64>(&lookup, "TANDEM_COMPACT_THRESHOLD")?.unwrap_or(1000);

        let timezone = match lookup("TANDEM_TIMEZONE") {
            Some(name) => name
                .parse::<Tz>()
                .map_err(|_| ConfigError::UnknownTimezone(name.clone()))?,
            None => Tz::UTC,
        };
        let start_hour = parse_opt::<u32>(&lookup, "TANDEM_BUSINESS_START_HOUR")?.unwrap_or(9);
        let end_hour = parse_opt::<u32>(&lookup, "TANDEM_BUSINESS_END_HOUR")?.unwrap_or(17);
        let business_days = match lookup("TANDEM_BUSINESS_DAYS") {
            Some(list) => parse_list::<u32>("TANDEM_BUSINESS_DAYS", &list)?,
            None => (1..=5).collect(),
        };

        let mut business_hours =
            BusinessHoursConfig::new(start_hour, end_hour, business_days, timezone)?;
        if let Some(list) = lookup("TANDEM_HOLIDAYS") {
            let holidays = parse_list::<NaiveDate>("TANDEM_HOLIDAYS", &list)?;
            // Empty keeps the default US calendar.
            if !holidays.is_empty() {
                business_hours = business_hours.with_holidays(holidays);
            }
        }

        Ok(Self {
            data_dir: PathBuf::from(data_dir),
            metrics_port,
            sweep_interval: Duration::from_secs(sweep_secs),
            compact_threshold,
            business_hours,
            calendar_dir: lookup("TANDEM_CALENDAR_DIR").map(PathBuf::from),
        })
    }
}

fn parse_opt<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Parse { key, value: raw }),
        None => Ok(None),
    }
}

/// Comma-separated list; blank entries are ignored.
fn parse_list<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<Vec<T>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<T>().map_err(|_| ConfigError::Parse {
                key,
                value: s.to_string(),
            })
        })
        .collect()
}
