// ABOUTME: Admission ceilings and rate limits shared by the gateway components.
// ABOUTME: Loaded from environment variables (and an optional .env file).

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::error::ConfigError;

/// Concurrency and rate ceilings enforced by the
/// [`ConcurrencyManager`](crate::admission::ConcurrencyManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// Units admitted at once across every user.
    pub max_global_concurrent_units: usize,
    /// Calls in flight against the external generator API.
    pub max_api_concurrent_calls: usize,
    /// Active tasks one user may hold.
    pub max_units_per_user: usize,
    pub api_calls_per_minute: usize,
    pub api_calls_per_hour: usize,
    /// How long finished bookkeeping entries are kept. Zero disables pruning.
    pub cleanup_completed_after: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_global_concurrent_units: 20,
            max_api_concurrent_calls: 10,
            max_units_per_user: 5,
            api_calls_per_minute: 60,
            api_calls_per_hour: 1000,
            cleanup_completed_after: Duration::from_secs(3600),
        }
    }
}

impl Limits {
    /// Load limits from environment variables, falling back to defaults for
    /// anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok(); // Load .env file if it exists
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build limits from an arbitrary key lookup, falling back to defaults
    /// for missing keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let limits = Self {
            max_global_concurrent_units: var_or(
                &lookup,
                "MAX_GLOBAL_CONCURRENT_UNITS",
                defaults.max_global_concurrent_units,
            )?,
            max_api_concurrent_calls: var_or(
                &lookup,
                "MAX_API_CONCURRENT_CALLS",
                defaults.max_api_concurrent_calls,
            )?,
            max_units_per_user: var_or(
                &lookup,
                "MAX_UNITS_PER_USER",
                defaults.max_units_per_user,
            )?,
            api_calls_per_minute: var_or(
                &lookup,
                "API_CALLS_PER_MINUTE",
                defaults.api_calls_per_minute,
            )?,
            api_calls_per_hour: var_or(
                &lookup,
                "API_CALLS_PER_HOUR",
                defaults.api_calls_per_hour,
            )?,
            cleanup_completed_after: Duration::from_secs(var_or(
                &lookup,
                "CLEANUP_COMPLETED_AFTER_SECONDS",
                defaults.cleanup_completed_after.as_secs(),
            )?),
        };

        limits.validate()?;
        Ok(limits)
    }

    /// Reject zero capacities and capacities a semaphore cannot hold. Only
    /// the cleanup window may be zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let capacities = [
            ("MAX_GLOBAL_CONCURRENT_UNITS", self.max_global_concurrent_units),
            ("MAX_API_CONCURRENT_CALLS", self.max_api_concurrent_calls),
            ("MAX_UNITS_PER_USER", self.max_units_per_user),
            ("API_CALLS_PER_MINUTE", self.api_calls_per_minute),
            ("API_CALLS_PER_HOUR", self.api_calls_per_hour),
        ];
        for (key, value) in capacities {
            if value == 0 {
                return Err(ConfigError::Zero(key));
            }
            if value > Semaphore::MAX_PERMITS {
                return Err(ConfigError::TooLarge {
                    key,
                    value,
                    max: Semaphore::MAX_PERMITS,
                });
            }
        }
        Ok(())
    }

    /// The highest number of units that can ever be admitted at once.
    pub fn effective_concurrency(&self) -> usize {
        self.max_global_concurrent_units
            .min(self.max_api_concurrent_calls)
    }
}

fn var_or<T: FromStr>(
    lookup: impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T: FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    /// Sets an environment variable for the lifetime of the guard.
    struct EnvVarGuard {
        key: &'static str,
        original: Option<String>,
    }

    impl EnvVarGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let original = env::var(key).ok();
            unsafe {
                env::set_var(key, value);
            }
            Self { key, original }
        }
    }

    impl Drop for EnvVarGuard {
        fn drop(&mut self) {
            unsafe {
                match &self.original {
                    Some(value) => env::set_var(self.key, value),
                    None => env::remove_var(self.key),
                }
            }
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let limits = Limits::default();
        assert!(limits.validate().is_ok());
        assert_eq!(limits.effective_concurrency(), 10);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let limits = Limits {
            max_units_per_user: 0,
            ..Limits::default()
        };
        assert_eq!(
            limits.validate(),
            Err(ConfigError::Zero("MAX_UNITS_PER_USER"))
        );
    }

    #[test]
    fn test_zero_cleanup_window_allowed() {
        let limits = Limits {
            cleanup_completed_after: Duration::ZERO,
            ..Limits::default()
        };
        assert!(limits.validate().is_ok());
    }

    #[test]
    fn test_parse_value_trims_whitespace() {
        let parsed: usize = parse_value("MAX_UNITS_PER_USER", " 7 ").unwrap();
        assert_eq!(parsed, 7);
    }

    #[test]
    fn test_parse_value_reports_key() {
        let err = parse_value::<usize>("API_CALLS_PER_HOUR", "lots").unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "API_CALLS_PER_HOUR",
                value: "lots".to_string(),
            }
        );
        assert!(err.to_string().contains("API_CALLS_PER_HOUR"));
    }

    #[test]
    fn test_capacity_above_semaphore_max_rejected() {
        let limits = Limits {
            max_global_concurrent_units: Semaphore::MAX_PERMITS + 1,
            ..Limits::default()
        };
        assert_eq!(
            limits.validate(),
            Err(ConfigError::TooLarge {
                key: "MAX_GLOBAL_CONCURRENT_UNITS",
                value: Semaphore::MAX_PERMITS + 1,
                max: Semaphore::MAX_PERMITS,
            })
        );
    }

    #[test]
    fn test_from_lookup_overrides_and_defaults() {
        let vars: HashMap<&str, &str> = [
            ("MAX_UNITS_PER_USER", "3"),
            ("API_CALLS_PER_MINUTE", " 30 "),
            ("CLEANUP_COMPLETED_AFTER_SECONDS", "0"),
        ]
        .into_iter()
        .collect();

        let limits = Limits::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(
            limits,
            Limits {
                max_units_per_user: 3,
                api_calls_per_minute: 30,
                cleanup_completed_after: Duration::ZERO,
                ..Limits::default()
            }
        );
    }

    #[test]
    fn test_from_lookup_rejects_bad_values() {
        let err = Limits::from_lookup(|key| {
            (key == "MAX_API_CONCURRENT_CALLS").then(|| "ten".to_string())
        })
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "MAX_API_CONCURRENT_CALLS",
                ..
            }
        ));

        let err = Limits::from_lookup(|key| (key == "API_CALLS_PER_HOUR").then(|| "0".to_string()))
            .unwrap_err();
        assert_eq!(err, ConfigError::Zero("API_CALLS_PER_HOUR"));
    }

    #[test]
    fn test_from_env_reads_process_environment() {
        let _guard = EnvVarGuard::set("MAX_GLOBAL_CONCURRENT_UNITS", "7");
        let limits = Limits::from_env().unwrap();
        assert_eq!(limits.max_global_concurrent_units, 7);
        assert_eq!(limits.effective_concurrency(), 7);
    }
}
