//! Worker configuration from the environment.

use std::time::Duration;

use crate::jobs::types::{DEFAULT_MAX_ATTEMPTS, MAX_ATTEMPTS_LIMIT, RetryPolicy};

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("missing required setting {0}")]
    Missing(&'static str),
}

/// Parse `key` with `FromStr`, falling back to `default` when unset or blank.
pub fn parse_or<T, F>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            })
        }
        _ => Ok(default),
    }
}

/// Settings of the job worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging
    pub name: String,
    /// Idle wait between polls
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Budget of each external capability call
    pub capability_timeout: Duration,
    /// Attempts given to jobs whose creator does not specify any
    pub default_max_attempts: u32,
    pub retry_policy: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "job-worker".to_string(),
            poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            capability_timeout: Duration::from_secs(180),
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment in production, a
    /// map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let ms = |key, default: Duration| -> Result<Duration, ConfigError> {
            parse_or(&lookup, key, default.as_millis() as u64).map(Duration::from_millis)
        };

        let poll_interval = ms("TROUBADOUR_POLL_INTERVAL_MS", defaults.poll_interval)?;
        let heartbeat_interval = ms("TROUBADOUR_HEARTBEAT_INTERVAL_MS", defaults.heartbeat_interval)?;
        let capability_timeout = parse_or(
            &lookup,
            "TROUBADOUR_CAPABILITY_TIMEOUT_SECS",
            defaults.capability_timeout.as_secs(),
        )
        .map(Duration::from_secs)?;
        let default_max_attempts =
            parse_or(&lookup, "TROUBADOUR_MAX_ATTEMPTS", defaults.default_max_attempts)?;
        let base_delay = ms(
            "TROUBADOUR_RETRY_BASE_DELAY_MS",
            defaults.retry_policy.base_delay,
        )?;
        let max_delay = ms(
            "TROUBADOUR_RETRY_MAX_DELAY_MS",
            defaults.retry_policy.max_delay,
        )?;

        if default_max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "TROUBADOUR_MAX_ATTEMPTS",
                value: "0".into(),
                reason: "at least one attempt is required".into(),
            });
        }
        if default_max_attempts > MAX_ATTEMPTS_LIMIT {
            return Err(ConfigError::Invalid {
                key: "TROUBADOUR_MAX_ATTEMPTS",
                value: default_max_attempts.to_string(),
                reason: format!("at most {MAX_ATTEMPTS_LIMIT} attempts are allowed"),
            });
        }
        if poll_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "TROUBADOUR_POLL_INTERVAL_MS",
                value: "0".into(),
                reason: "must be positive".into(),
            });
        }
        if max_delay < base_delay {
            return Err(ConfigError::Invalid {
                key: "TROUBADOUR_RETRY_MAX_DELAY_MS",
                value: max_delay.as_millis().to_string(),
                reason: "smaller than the base delay".into(),
            });
        }

        Ok(Self {
            name: defaults.name,
            poll_interval,
            heartbeat_interval,
            capability_timeout,
            default_max_attempts,
            retry_policy: RetryPolicy::exponential(base_delay, max_delay),
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = WorkerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.poll_interval, Duration::from_secs(5));
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(cfg.capability_timeout, Duration::from_secs(180));
        assert_eq!(cfg.default_max_attempts, 3);
        assert_eq!(cfg.retry_policy.base_delay, Duration::from_secs(5));
        assert_eq!(cfg.retry_policy.max_delay, Duration::from_secs(300));
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = WorkerConfig::from_lookup(lookup(&[
            ("TROUBADOUR_POLL_INTERVAL_MS", "250"),
            ("TROUBADOUR_MAX_ATTEMPTS", " 5 "),
            ("TROUBADOUR_CAPABILITY_TIMEOUT_SECS", "30"),
        ]))
        .unwrap();
        assert_eq!(cfg.poll_interval, Duration::from_millis(250));
        assert_eq!(cfg.default_max_attempts, 5);
        assert_eq!(cfg.capability_timeout, Duration::from_secs(30));
    }

    #[test]
    fn garbage_is_reported_with_its_key() {
        let err = WorkerConfig::from_lookup(lookup(&[("TROUBADOUR_MAX_ATTEMPTS", "three")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "TROUBADOUR_MAX_ATTEMPTS",
                ..
            }
        ));
    }

    #[test]
    fn zero_attempts_is_rejected() {
        assert!(WorkerConfig::from_lookup(lookup(&[("TROUBADOUR_MAX_ATTEMPTS", "0")])).is_err());
    }

    #[test]
    fn attempt_budget_above_limit_is_rejected() {
        let err = WorkerConfig::from_lookup(lookup(&[("TROUBADOUR_MAX_ATTEMPTS", "4000000000")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "TROUBADOUR_MAX_ATTEMPTS",
                ..
            }
        ));
    }

    #[test]
    fn inverted_backoff_bounds_are_rejected() {
        let err = WorkerConfig::from_lookup(lookup(&[
            ("TROUBADOUR_RETRY_BASE_DELAY_MS", "10000"),
            ("TROUBADOUR_RETRY_MAX_DELAY_MS", "1000"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "TROUBADOUR_RETRY_MAX_DELAY_MS",
                ..
            }
        ));
    }
}
