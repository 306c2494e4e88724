use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{GovernorError, Result};

/// Retry timing for rate-limited executor calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Physical attempts per request, first call included
    pub max_attempts: u32,
    pub jitter_enabled: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            max_attempts: 3,
            jitter_enabled: true,
        }
    }
}

impl BackoffConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Quotas enforced per endpoint by the rate limiter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    pub minute_window_ms: u64,
    pub hour_window_ms: u64,
    pub backoff: BackoffConfig,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            requests_per_hour: 1000,
            minute_window_ms: 60_000,
            hour_window_ms: 3_600_000,
            backoff: BackoffConfig::default(),
        }
    }
}

impl RateLimiterConfig {
    pub fn minute_window(&self) -> Duration {
        Duration::from_millis(self.minute_window_ms)
    }

    pub fn hour_window(&self) -> Duration {
        Duration::from_millis(self.hour_window_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.requests_per_minute == 0 || self.requests_per_hour == 0 {
            return Err(GovernorError::Config(
                "request quotas must be greater than zero".to_string(),
            ));
        }
        if self.minute_window_ms == 0 || self.hour_window_ms == 0 {
            return Err(GovernorError::Config(
                "window durations must be greater than zero".to_string(),
            ));
        }
        let backoff = &self.backoff;
        if backoff.max_attempts == 0 {
            return Err(GovernorError::Config(
                "backoff.max_attempts must be at least 1".to_string(),
            ));
        }
        if backoff.multiplier < 1.0 || !backoff.multiplier.is_finite() {
            return Err(GovernorError::Config(format!(
                "backoff.multiplier must be >= 1.0, got {}",
                backoff.multiplier
            )));
        }
        if backoff.max_delay_ms < backoff.base_delay_ms {
            return Err(GovernorError::Config(format!(
                "backoff.max_delay_ms ({}) is below backoff.base_delay_ms ({})",
                backoff.max_delay_ms, backoff.base_delay_ms
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    pub max_batch_size: usize,
    /// Batch window: time from the first member joining to the flush
    pub batch_delay_ms: u64,
    pub eligible_types: Vec<String>,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            batch_delay_ms: 100,
            eligible_types: vec![
                "insights".to_string(),
                "search".to_string(),
                "tags".to_string(),
            ],
        }
    }
}

impl BatchingConfig {
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn is_eligible(&self, request_type: &str) -> bool {
        self.eligible_types.iter().any(|t| t == request_type)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub batching: BatchingConfig,
    pub enable_result_cache: bool,
    /// Base TTL before the type, richness and scope multipliers
    pub result_cache_ttl_ms: u64,
    pub cache_max_size: usize,
    pub cache_sweep_interval_ms: u64,
    /// Request type -> API path used as the rate-limit endpoint
    pub endpoints: HashMap<String, String>,
    pub default_endpoint: String,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        let endpoints = [
            ("insights", "/v2/insights"),
            ("search", "/search"),
            ("tags", "/v2/tags"),
            ("audiences", "/v2/audiences"),
            ("recommendations", "/recommendations"),
        ]
        .into_iter()
        .map(|(t, p)| (t.to_string(), p.to_string()))
        .collect();

        Self {
            batching: BatchingConfig::default(),
            enable_result_cache: true,
            result_cache_ttl_ms: 300_000,
            cache_max_size: 1000,
            cache_sweep_interval_ms: 60_000,
            endpoints,
            default_endpoint: "/v2/insights".to_string(),
        }
    }
}

impl OptimizerConfig {
    pub fn endpoint_for(&self, request_type: &str) -> &str {
        self.endpoints
            .get(request_type)
            .map(String::as_str)
            .unwrap_or(&self.default_endpoint)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batching.max_batch_size == 0 {
            return Err(GovernorError::Config(
                "batching.max_batch_size must be at least 1".to_string(),
            ));
        }
        if self.enable_result_cache && self.cache_max_size == 0 {
            return Err(GovernorError::Config(
                "cache_max_size must be at least 1 when the result cache is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

/// Everything the governance layer needs at construction time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub rate_limiter: RateLimiterConfig,
    pub optimizer: OptimizerConfig,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl GovernorConfig {
    /// Builds the config from `GOVERNOR_*` variables, keeping defaults for
    /// anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let rl = defaults.rate_limiter;
        let opt = defaults.optimizer;

        GovernorConfig {
            rate_limiter: RateLimiterConfig {
                requests_per_minute: env_or("GOVERNOR_REQUESTS_PER_MINUTE", rl.requests_per_minute),
                requests_per_hour: env_or("GOVERNOR_REQUESTS_PER_HOUR", rl.requests_per_hour),
                minute_window_ms: env_or("GOVERNOR_MINUTE_WINDOW_MS", rl.minute_window_ms),
                hour_window_ms: env_or("GOVERNOR_HOUR_WINDOW_MS", rl.hour_window_ms),
                backoff: BackoffConfig {
                    base_delay_ms: env_or("GOVERNOR_BACKOFF_BASE_DELAY_MS", rl.backoff.base_delay_ms),
                    max_delay_ms: env_or("GOVERNOR_BACKOFF_MAX_DELAY_MS", rl.backoff.max_delay_ms),
                    multiplier: env_or("GOVERNOR_BACKOFF_MULTIPLIER", rl.backoff.multiplier),
                    max_attempts: env_or("GOVERNOR_BACKOFF_MAX_ATTEMPTS", rl.backoff.max_attempts),
                    jitter_enabled: env_or("GOVERNOR_BACKOFF_JITTER", rl.backoff.jitter_enabled),
                },
            },
            optimizer: OptimizerConfig {
                batching: BatchingConfig {
                    max_batch_size: env_or("GOVERNOR_MAX_BATCH_SIZE", opt.batching.max_batch_size),
                    batch_delay_ms: env_or("GOVERNOR_BATCH_DELAY_MS", opt.batching.batch_delay_ms),
                    eligible_types: env::var("GOVERNOR_ELIGIBLE_TYPES")
                        .ok()
                        .map(|s| {
                            s.split(',')
                                .map(|t| t.trim().to_string())
                                .filter(|t| !t.is_empty())
                                .collect()
                        })
                        .unwrap_or(opt.batching.eligible_types),
                },
                enable_result_cache: env_or("GOVERNOR_ENABLE_RESULT_CACHE", opt.enable_result_cache),
                result_cache_ttl_ms: env_or("GOVERNOR_RESULT_CACHE_TTL_MS", opt.result_cache_ttl_ms),
                cache_max_size: env_or("GOVERNOR_CACHE_MAX_SIZE", opt.cache_max_size),
                cache_sweep_interval_ms: opt.cache_sweep_interval_ms,
                endpoints: opt.endpoints,
                default_endpoint: opt.default_endpoint,
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.rate_limiter.validate()?;
        self.optimizer.validate()
    }

    pub fn validate_and_log(&self) -> Result<()> {
        self.validate()?;
        log::info!("Governor configuration loaded: {:?}", self);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_are_valid() {
        let config = GovernorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rate_limiter.minute_window(), Duration::from_secs(60));
        assert_eq!(config.optimizer.batching.batch_window(), Duration::from_millis(100));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = RateLimiterConfig::default();
        config.requests_per_minute = 0;
        assert!(config.validate().is_err());

        let mut config = RateLimiterConfig::default();
        config.backoff.max_delay_ms = 10;
        config.backoff.base_delay_ms = 100;
        assert!(config.validate().is_err());

        let mut config = RateLimiterConfig::default();
        config.backoff.multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = OptimizerConfig::default();
        config.batching.max_batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_endpoint_lookup() {
        let config = OptimizerConfig::default();
        assert_eq!(config.endpoint_for("search"), "/search");
        assert_eq!(config.endpoint_for("unknown"), "/v2/insights");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{"rate_limiter": {"requests_per_minute": 2, "minute_window_ms": 1000}}"#;
        let config: GovernorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.rate_limiter.requests_per_minute, 2);
        assert_eq!(config.rate_limiter.minute_window_ms, 1000);
        assert_eq!(config.rate_limiter.requests_per_hour, 1000);
        assert_eq!(config.optimizer, OptimizerConfig::default());
    }

    #[test]
    fn test_from_env_overrides() {
        env::set_var("GOVERNOR_REQUESTS_PER_HOUR", "123");
        env::set_var("GOVERNOR_ELIGIBLE_TYPES", "search, tags");
        let config = GovernorConfig::from_env();
        env::remove_var("GOVERNOR_REQUESTS_PER_HOUR");
        env::remove_var("GOVERNOR_ELIGIBLE_TYPES");

        assert_eq!(config.rate_limiter.requests_per_hour, 123);
        assert_eq!(
            config.optimizer.batching.eligible_types,
            vec!["search".to_string(), "tags".to_string()]
        );
    }
}
