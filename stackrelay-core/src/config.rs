//! Configuration types

use crate::error::ConfigError;
use crate::AccessMode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry and backoff tuning for failed upstream calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the initial attempt.
    pub max_attempts: u32,
    /// Base backoff; attempt `n` waits `base * multiplier^n`, plus jitter.
    pub base_backoff: Duration,
    /// Ceiling on any single backoff delay.
    pub max_backoff: Duration,
    /// Growth factor between attempts.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            multiplier: 2.0,
        }
    }
}

/// Master configuration for the dispatch layer.
///
/// Supplied fully-formed at construction time by an external loader; the
/// dispatch layer reads nothing from the environment itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Upstream API credential. Absent means anonymous-only operation.
    pub api_key: Option<String>,
    /// Upstream API root, without a trailing slash.
    pub base_url: String,
    /// Stack Exchange site parameter attached to every call.
    pub site: String,
    /// Configured transport preference.
    pub access_mode: AccessMode,
    /// Number of concurrent dispatch workers.
    pub concurrency: usize,
    /// How long completed responses stay visible in the cache.
    pub cache_ttl: Duration,
    /// Maximum number of cached responses before LRU eviction.
    pub cache_capacity: usize,
    /// Remaining-quota threshold below which Auto mode falls back to
    /// anonymous calls.
    pub quota_low_water: u32,
    /// Client-side pacing budget for physical calls.
    pub requests_per_minute: u32,
    /// Upper bound on pending queue entries; `None` disables the bound.
    pub max_queue_depth: Option<usize>,
    /// Per-call HTTP timeout.
    pub request_timeout: Duration,
    /// Retry and backoff tuning.
    pub retry: RetryConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.stackexchange.com/2.3".to_string(),
            site: "stackoverflow".to_string(),
            access_mode: AccessMode::Auto,
            concurrency: 5,
            cache_ttl: Duration::from_secs(300),
            cache_capacity: 500,
            quota_low_water: 50,
            requests_per_minute: 30,
            max_queue_depth: None,
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the configured access mode.
    pub fn with_access_mode(mut self, mode: AccessMode) -> Self {
        self.access_mode = mode;
        self
    }

    /// Set the worker count.
    pub fn with_concurrency(mut self, workers: usize) -> Self {
        self.concurrency = workers;
        self
    }

    /// Set the cache TTL.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Set the cache capacity.
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Set the low-water quota threshold.
    pub fn with_quota_low_water(mut self, threshold: u32) -> Self {
        self.quota_low_water = threshold;
        self
    }

    /// Bound the pending queue.
    pub fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = Some(depth);
        self
    }

    /// Set the retry tuning.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Whether a non-empty credential is configured.
    pub fn credentials_present(&self) -> bool {
        self.api_key.as_deref().is_some_and(|key| !key.is_empty())
    }

    /// Validate the configuration, returning the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "base_url".to_string(),
            });
        }
        if self.site.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "site".to_string(),
            });
        }
        if self.concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "concurrency".to_string(),
                value: "0".to_string(),
                reason: "at least one worker is required".to_string(),
            });
        }
        if self.cache_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cache_capacity".to_string(),
                value: "0".to_string(),
                reason: "cache must hold at least one entry".to_string(),
            });
        }
        if self.requests_per_minute == 0 {
            return Err(ConfigError::InvalidValue {
                field: "requests_per_minute".to_string(),
                value: "0".to_string(),
                reason: "pacing budget must be positive".to_string(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_attempts".to_string(),
                value: "0".to_string(),
                reason: "at least one attempt is required".to_string(),
            });
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.multiplier".to_string(),
                value: self.retry.multiplier.to_string(),
                reason: "backoff must not shrink between attempts".to_string(),
            });
        }
        if self.max_queue_depth == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "max_queue_depth".to_string(),
                value: "0".to_string(),
                reason: "a zero-depth queue cannot accept work".to_string(),
            });
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(RelayConfig::default().validate().is_ok());
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let config = RelayConfig::default();
        assert_eq!(config.cache_ttl, Duration::from_secs(300));
        assert_eq!(config.cache_capacity, 500);
        assert_eq!(config.concurrency, 5);
        assert_eq!(config.quota_low_water, 50);
        assert_eq!(config.requests_per_minute, 30);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.access_mode, AccessMode::Auto);
        assert!(config.max_queue_depth.is_none());
    }

    #[test]
    fn test_builder_chains() {
        let config = RelayConfig::new()
            .with_api_key("key123")
            .with_concurrency(2)
            .with_cache_ttl(Duration::from_secs(60))
            .with_max_queue_depth(16);
        assert!(config.credentials_present());
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.cache_ttl, Duration::from_secs(60));
        assert_eq!(config.max_queue_depth, Some(16));
    }

    #[test]
    fn test_empty_api_key_is_not_credentials() {
        let config = RelayConfig::new().with_api_key("");
        assert!(!config.credentials_present());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = RelayConfig::new().with_concurrency(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field, .. }) if field == "concurrency"
        ));
    }

    #[test]
    fn test_validate_rejects_zero_queue_depth() {
        let config = RelayConfig::new().with_max_queue_depth(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_shrinking_backoff() {
        let config = RelayConfig::new().with_retry(RetryConfig {
            multiplier: 0.5,
            ..RetryConfig::default()
        });
        assert!(config.validate().is_err());
    }
}
