//! Configuration loading and representation.
//!
//! Everything comes from environment variables. Tests use
//! [`PulseConfig::from_lookup`] with a map instead of mutating the process
//! environment.
//!
//! | variable | default |
//! |---|---|
//! | `PULSE_BUS_BACKEND` | `memory` (`memory`, `log`, `redis`) |
//! | `PULSE_REDIS_URL` | required when the backend is `redis` |
//! | `PULSE_STREAM_PREFIX` | `pulse:events` |
//! | `DATABASE_URL` | unset: in-memory ledger |
//! | `PULSE_SCHEMA_DIR` | `schemas` |
//! | `PULSE_RETRY_MAX_ATTEMPTS` | `5` |
//! | `PULSE_RETRY_BASE_DELAY_MS` | `500` |
//! | `PULSE_RETRY_MAX_DELAY_MS` | `60000` |
//! | `PULSE_RETRY_STRATEGY` | `exponential` (`fixed`, `linear`, `exponential`) |
//! | `PULSE_HANDLER_TIMEOUT_MS` | `30000` |
//! | `PULSE_PUBLISH_TIMEOUT_MS` | unset: no publish deadline |
//! | `PULSE_LOG_FORMAT` | `json` (`json`, `pretty`) |

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use pulse_events::{BackoffStrategy, DeliveryPolicy, RetryPolicy};
use pulse_observability::LogFormat;

pub const DEFAULT_STREAM_PREFIX: &str = "pulse:events";
pub const DEFAULT_SCHEMA_DIR: &str = "schemas";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Which [`EventBus`](pulse_events::EventBus) backend to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusBackend {
    #[default]
    Memory,
    Log,
    Redis,
}

impl FromStr for BusBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "in-memory" | "inmemory" => Ok(Self::Memory),
            "log" => Ok(Self::Log),
            "redis" => Ok(Self::Redis),
            other => Err(format!("unknown bus backend '{other}'")),
        }
    }
}

impl fmt::Display for BusBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BusBackend::Memory => "memory",
            BusBackend::Log => "log",
            BusBackend::Redis => "redis",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PulseConfig {
    pub bus_backend: BusBackend,
    pub redis_url: Option<String>,
    pub stream_prefix: String,
    pub database_url: Option<String>,
    pub schema_dir: PathBuf,
    pub delivery: DeliveryPolicy,
    pub publish_timeout: Option<Duration>,
    pub log_format: LogFormat,
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            bus_backend: BusBackend::Memory,
            redis_url: None,
            stream_prefix: DEFAULT_STREAM_PREFIX.to_string(),
            database_url: None,
            schema_dir: PathBuf::from(DEFAULT_SCHEMA_DIR),
            delivery: DeliveryPolicy::default(),
            publish_timeout: None,
            log_format: LogFormat::Json,
        }
    }
}

impl PulseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();
        let retry_defaults = &defaults.delivery.retry;

        let bus_backend = parse_or(&get, "PULSE_BUS_BACKEND", defaults.bus_backend)?;
        let redis_url = get("PULSE_REDIS_URL");
        if bus_backend == BusBackend::Redis && redis_url.is_none() {
            return Err(ConfigError::Missing("PULSE_REDIS_URL"));
        }

        let retry = RetryPolicy {
            max_attempts: parse_or(&get, "PULSE_RETRY_MAX_ATTEMPTS", retry_defaults.max_attempts)?,
            base_delay: millis_or(&get, "PULSE_RETRY_BASE_DELAY_MS", retry_defaults.base_delay)?,
            max_delay: millis_or(&get, "PULSE_RETRY_MAX_DELAY_MS", retry_defaults.max_delay)?,
            strategy: parse_or::<BackoffStrategy, _>(
                &get,
                "PULSE_RETRY_STRATEGY",
                retry_defaults.strategy,
            )?,
            jitter: retry_defaults.jitter,
        };
        if retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "PULSE_RETRY_MAX_ATTEMPTS",
                value: "0".into(),
                reason: "at least one delivery attempt is required".into(),
            });
        }
        if retry.max_delay < retry.base_delay {
            return Err(ConfigError::Invalid {
                key: "PULSE_RETRY_MAX_DELAY_MS",
                value: retry.max_delay.as_millis().to_string(),
                reason: "must not be smaller than PULSE_RETRY_BASE_DELAY_MS".into(),
            });
        }

        let handler_timeout = millis_or(
            &get,
            "PULSE_HANDLER_TIMEOUT_MS",
            defaults.delivery.handler_timeout,
        )?;
        if handler_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                key: "PULSE_HANDLER_TIMEOUT_MS",
                value: "0".into(),
                reason: "must be positive".into(),
            });
        }

        let publish_timeout = match get("PULSE_PUBLISH_TIMEOUT_MS") {
            None => None,
            Some(raw) => Some(parse_millis("PULSE_PUBLISH_TIMEOUT_MS", &raw)?),
        };

        Ok(Self {
            bus_backend,
            redis_url,
            stream_prefix: get("PULSE_STREAM_PREFIX").unwrap_or(defaults.stream_prefix),
            database_url: get("DATABASE_URL"),
            schema_dir: get("PULSE_SCHEMA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.schema_dir),
            delivery: DeliveryPolicy::new(retry, handler_timeout),
            publish_timeout,
            log_format: parse_or(&get, "PULSE_LOG_FORMAT", defaults.log_format)?,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn millis_or<G>(get: &G, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => parse_millis(key, &raw),
    }
}

fn parse_millis(key: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| ConfigError::Invalid {
            key,
            value: raw.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<PulseConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PulseConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg, PulseConfig::default());
        assert_eq!(cfg.delivery.retry.max_attempts, 5);
        assert_eq!(cfg.delivery.handler_timeout, Duration::from_secs(30));
        assert_eq!(cfg.stream_prefix, "pulse:events");
    }

    #[test]
    fn reads_every_variable() {
        let cfg = config(&[
            ("PULSE_BUS_BACKEND", "redis"),
            ("PULSE_REDIS_URL", "redis://localhost:6379"),
            ("PULSE_STREAM_PREFIX", "hr:events"),
            ("DATABASE_URL", "postgres://localhost/hr"),
            ("PULSE_SCHEMA_DIR", "/etc/pulse/schemas"),
            ("PULSE_RETRY_MAX_ATTEMPTS", "3"),
            ("PULSE_RETRY_BASE_DELAY_MS", "100"),
            ("PULSE_RETRY_MAX_DELAY_MS", "2000"),
            ("PULSE_RETRY_STRATEGY", "linear"),
            ("PULSE_HANDLER_TIMEOUT_MS", "1500"),
            ("PULSE_PUBLISH_TIMEOUT_MS", "250"),
            ("PULSE_LOG_FORMAT", "pretty"),
        ])
        .unwrap();

        assert_eq!(cfg.bus_backend, BusBackend::Redis);
        assert_eq!(cfg.redis_url.as_deref(), Some("redis://localhost:6379"));
        assert_eq!(cfg.stream_prefix, "hr:events");
        assert_eq!(cfg.database_url.as_deref(), Some("postgres://localhost/hr"));
        assert_eq!(cfg.schema_dir, PathBuf::from("/etc/pulse/schemas"));
        assert_eq!(cfg.delivery.retry.max_attempts, 3);
        assert_eq!(cfg.delivery.retry.base_delay, Duration::from_millis(100));
        assert_eq!(cfg.delivery.retry.strategy, BackoffStrategy::Linear);
        assert_eq!(cfg.delivery.handler_timeout, Duration::from_millis(1500));
        assert_eq!(cfg.publish_timeout, Some(Duration::from_millis(250)));
        assert_eq!(cfg.log_format, LogFormat::Pretty);
    }

    #[test]
    fn redis_requires_a_url() {
        assert_eq!(
            config(&[("PULSE_BUS_BACKEND", "redis")]).unwrap_err(),
            ConfigError::Missing("PULSE_REDIS_URL")
        );
    }

    #[test]
    fn rejects_invalid_values() {
        let err = config(&[("PULSE_BUS_BACKEND", "kafka")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "PULSE_BUS_BACKEND", .. }));

        let err = config(&[("PULSE_RETRY_MAX_ATTEMPTS", "many")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "PULSE_RETRY_MAX_ATTEMPTS", .. }));

        let err = config(&[("PULSE_RETRY_MAX_ATTEMPTS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        let err = config(&[
            ("PULSE_RETRY_BASE_DELAY_MS", "5000"),
            ("PULSE_RETRY_MAX_DELAY_MS", "10"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "PULSE_RETRY_MAX_DELAY_MS", .. }));

        let err = config(&[("PULSE_LOG_FORMAT", "xml")]).unwrap_err();
        assert!(err.to_string().contains("PULSE_LOG_FORMAT"));
    }

    #[test]
    fn blank_values_count_as_unset() {
        let cfg = config(&[("DATABASE_URL", "  "), ("PULSE_BUS_BACKEND", "")]).unwrap();
        assert_eq!(cfg.database_url, None);
        assert_eq!(cfg.bus_backend, BusBackend::Memory);
    }
}
