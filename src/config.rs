use std::path::PathBuf;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};

use crate::engine::EngineSettings;
use crate::model::{HOUR_MS, Ms};

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { var: &'static str, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { var, value } => write!(f, "invalid value for {var}: {value:?}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Daemon configuration, read from `TUTORBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub utc_offset: FixedOffset,
    pub negotiation_ttl_hours: u32,
    pub lock_ttl: Duration,
    pub sweep_interval: Duration,
    pub activation_window: Duration,
    pub compact_threshold: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            utc_offset: Utc.fix(),
            negotiation_ttl_hours: 168,
            lock_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            activation_window: Duration::from_secs(5 * 60),
            compact_threshold: 1000,
        }
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value: raw }),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any key lookup; unset keys fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let data_dir = lookup("TUTORBOOK_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);
        let metrics_port = parse::<u16>(&lookup, "TUTORBOOK_METRICS_PORT")?;

        let utc_offset = match parse::<i32>(&lookup, "TUTORBOOK_UTC_OFFSET_MINUTES")? {
            None => defaults.utc_offset,
            Some(minutes) => FixedOffset::east_opt(minutes * 60).ok_or(ConfigError::Invalid {
                var: "TUTORBOOK_UTC_OFFSET_MINUTES",
                value: minutes.to_string(),
            })?,
        };

        let negotiation_ttl_hours = parse(&lookup, "TUTORBOOK_NEGOTIATION_TTL_HOURS")?
            .unwrap_or(defaults.negotiation_ttl_hours);
        let lock_ttl = parse(&lookup, "TUTORBOOK_LOCK_TTL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.lock_ttl);
        let sweep_interval = parse(&lookup, "TUTORBOOK_SWEEP_INTERVAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.sweep_interval);
        let activation_window = parse::<u64>(&lookup, "TUTORBOOK_ACTIVATION_WINDOW_MINS")?
            .map(|m| Duration::from_secs(m * 60))
            .unwrap_or(defaults.activation_window);
        let compact_threshold = parse(&lookup, "TUTORBOOK_COMPACT_THRESHOLD")?
            .unwrap_or(defaults.compact_threshold);

        if lock_ttl.is_zero() {
            return Err(ConfigError::Invalid {
                var: "TUTORBOOK_LOCK_TTL_SECS",
                value: "0".into(),
            });
        }
        if sweep_interval.is_zero() {
            return Err(ConfigError::Invalid {
                var: "TUTORBOOK_SWEEP_INTERVAL_SECS",
                value: "0".into(),
            });
        }

        Ok(Self {
            data_dir,
            metrics_port,
            utc_offset,
            negotiation_ttl_hours,
            lock_ttl,
            sweep_interval,
            activation_window,
            compact_threshold,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("tutorbook.wal")
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            reference_offset: self.utc_offset,
            negotiation_ttl_ms: self.negotiation_ttl_hours as Ms * HOUR_MS,
            lock_ttl_ms: self.lock_ttl.as_millis() as Ms,
        }
    }
}
