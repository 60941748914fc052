//! Configuration for the status controller.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use mlplane_reconcile::{BackoffPolicy, RetryPolicy, DEFAULT_MAX_RETRIES};

use crate::retry_poller::PollerConfig;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Status controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Log level used when `RUST_LOG` is not set.
    pub log_level: String,

    pub log_format: LogFormat,

    /// Newline-delimited event file. Stdin when unset.
    pub events_path: Option<PathBuf>,

    /// Resources to create at startup.
    pub manifest_path: Option<PathBuf>,

    /// Bound on each conflict-retried store write.
    pub retry: RetryPolicy,

    pub failed_ops: PollerConfig,

    /// Capacity of each per-kind event channel.
    pub channel_capacity: usize,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let log_level = lookup("MLPLANE_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let log_format = match lookup("MLPLANE_LOG_FORMAT").as_deref() {
            None | Some("json") => LogFormat::Json,
            Some("pretty") => LogFormat::Pretty,
            Some(other) => bail!("MLPLANE_LOG_FORMAT must be 'json' or 'pretty', got '{other}'"),
        };

        let events_path = lookup("MLPLANE_EVENTS_PATH").map(PathBuf::from);
        let manifest_path = lookup("MLPLANE_MANIFEST_PATH").map(PathBuf::from);

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: parse(&lookup, "MLPLANE_RETRY_MAX_ATTEMPTS")?.unwrap_or(defaults.max_attempts),
            backoff: BackoffPolicy {
                base: parse(&lookup, "MLPLANE_RETRY_BASE_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.backoff.base),
                ..defaults.backoff
            },
            deadline: parse(&lookup, "MLPLANE_RETRY_DEADLINE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.deadline),
        };
        if retry.max_attempts == 0 {
            bail!("MLPLANE_RETRY_MAX_ATTEMPTS must be at least 1");
        }

        let poller_defaults = PollerConfig::default();
        let failed_ops = PollerConfig {
            interval: parse(&lookup, "MLPLANE_FAILED_OP_POLL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(poller_defaults.interval),
            max_retries: parse(&lookup, "MLPLANE_FAILED_OP_MAX_RETRIES")?.unwrap_or(DEFAULT_MAX_RETRIES),
            window: poller_defaults.window,
        };
        if failed_ops.interval.is_zero() {
            bail!("MLPLANE_FAILED_OP_POLL_SECS must be at least 1");
        }

        let channel_capacity = parse(&lookup, "MLPLANE_CHANNEL_CAPACITY")?.unwrap_or(1024);
        if channel_capacity == 0 {
            bail!("MLPLANE_CHANNEL_CAPACITY must be at least 1");
        }

        Ok(Self {
            log_level,
            log_format,
            events_path,
            manifest_path,
            retry,
            failed_ops,
            channel_capacity,
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|value| value.trim().parse::<T>().with_context(|| format!("invalid {key}: '{value}'")))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(config.events_path.is_none());
        assert!(config.manifest_path.is_none());
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.failed_ops.interval, Duration::from_secs(5));
        assert_eq!(config.failed_ops.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(config.channel_capacity, 1024);
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("MLPLANE_LOG_FORMAT", "pretty"),
            ("MLPLANE_EVENTS_PATH", "/tmp/events.ndjson"),
            ("MLPLANE_RETRY_MAX_ATTEMPTS", "8"),
            ("MLPLANE_RETRY_BASE_MS", "25"),
            ("MLPLANE_RETRY_DEADLINE_MS", "2000"),
            ("MLPLANE_FAILED_OP_POLL_SECS", "30"),
            ("MLPLANE_FAILED_OP_MAX_RETRIES", "1"),
            ("MLPLANE_CHANNEL_CAPACITY", "16"),
        ])
        .unwrap();

        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.events_path, Some(PathBuf::from("/tmp/events.ndjson")));
        assert_eq!(config.retry.max_attempts, 8);
        assert_eq!(config.retry.backoff.base, Duration::from_millis(25));
        assert_eq!(config.retry.backoff.multiplier, 1.0);
        assert_eq!(config.retry.deadline, Duration::from_secs(2));
        assert_eq!(config.failed_ops.interval, Duration::from_secs(30));
        assert_eq!(config.failed_ops.max_retries, 1);
        assert_eq!(config.channel_capacity, 16);
    }

    #[rstest]
    #[case("MLPLANE_RETRY_MAX_ATTEMPTS", "many")]
    #[case("MLPLANE_RETRY_MAX_ATTEMPTS", "0")]
    #[case("MLPLANE_RETRY_BASE_MS", "-5")]
    #[case("MLPLANE_LOG_FORMAT", "xml")]
    #[case("MLPLANE_FAILED_OP_POLL_SECS", "0")]
    #[case("MLPLANE_CHANNEL_CAPACITY", "0")]
    fn test_invalid_values_rejected(#[case] key: &str, #[case] value: &str) {
        assert!(config(&[(key, value)]).is_err());
    }
}
