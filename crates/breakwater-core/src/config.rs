//! Service parameter tables.
//!
//! These are the serde-able halves of a service's configuration: breaker
//! thresholds, retry policy, rate-limiter policy, recovery criteria. They
//! can be parsed from a YAML or JSON document at process start and are
//! never mutated afterwards. The programmatic pieces (error classifier,
//! health check, fallback chain) are attached through
//! [`crate::registry::RegistryBuilder`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors from loading or validating a parameter table.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("service {service}: {field} {reason}")]
    InvalidValue {
        service: String,
        field: &'static str,
        reason: String,
    },

    #[error("service {0} is configured more than once")]
    DuplicateService(String),

    #[error("parameter table defines no services")]
    EmptyTable,
}

/// Serde support for durations given either as integer milliseconds or as
/// a humantime string ("250ms", "30s", "5m").
pub mod duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Millis(u64),
        Human(String),
    }

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Repr::deserialize(deserializer)? {
            Repr::Millis(ms) => Ok(Duration::from_millis(ms)),
            Repr::Human(text) => {
                humantime::parse_duration(&text).map_err(serde::de::Error::custom)
            }
        }
    }
}

/// Retry policy for one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryParams {
    /// Total attempts, counting the first call.
    pub max_retries: u32,

    /// Delay before the first re-attempt, prior to multipliers.
    #[serde(with = "duration")]
    pub base_delay: Duration,

    /// Hard cap on a single computed delay.
    #[serde(with = "duration")]
    pub max_delay: Duration,

    /// Exponential growth factor across attempts.
    pub backoff_multiplier: f64,

    /// Fraction of the computed delay added as random jitter, in [0, 1].
    pub jitter_factor: f64,

    /// Error codes the default classifier treats as retryable.
    #[serde(default)]
    pub retryable_errors: Vec<String>,

    /// Error codes the default classifier treats as terminal.
    #[serde(default)]
    pub non_retryable_errors: Vec<String>,
}

impl Default for RetryParams {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
            retryable_errors: Vec::new(),
            non_retryable_errors: Vec::new(),
        }
    }
}

/// Shared retry budget across all calls to one service.
///
/// The window resets on a fixed boundary rather than sliding, so bursts
/// that straddle a boundary are under-counted. Kept as documented
/// behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalRetryLimits {
    /// Retries allowed per window, summed over all concurrent callers.
    pub max_retries: u32,

    /// Budget window length.
    #[serde(with = "duration")]
    pub window: Duration,
}

impl Default for GlobalRetryLimits {
    fn default() -> Self {
        Self {
            max_retries: 50,
            window: Duration::from_secs(60),
        }
    }
}

/// Token-bucket admission policy for one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterParams {
    /// Bucket capacity.
    pub max_tokens: u32,

    /// Tokens added per second.
    pub refill_rate: f64,

    /// Storm-protection budget shared by the retry strategy.
    #[serde(default)]
    pub global_limits: GlobalRetryLimits,
}

impl Default for RateLimiterParams {
    fn default() -> Self {
        Self {
            max_tokens: 20,
            refill_rate: 10.0,
            global_limits: GlobalRetryLimits::default(),
        }
    }
}

/// Criteria for flipping a degraded service back to healthy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryCriteria {
    /// Consecutive successful probes required.
    pub consecutive_successes: u32,

    /// Window the successes must land in.
    #[serde(with = "duration")]
    pub time_window: Duration,

    /// Minimum spacing between probes of one service.
    #[serde(with = "duration")]
    pub health_check_interval: Duration,
}

impl Default for RecoveryCriteria {
    fn default() -> Self {
        Self {
            consecutive_successes: 2,
            time_window: Duration::from_secs(120),
            health_check_interval: Duration::from_secs(30),
        }
    }
}

/// Operational parameters for one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceParams {
    /// Qualifying failures within [`Self::timeout`] that open the circuit.
    /// A threshold of zero opens on the very first qualifying failure.
    pub failure_threshold: u32,

    /// Failure-counting window.
    #[serde(with = "duration")]
    pub timeout: Duration,

    /// How long an open circuit waits before admitting a probe call.
    #[serde(with = "duration")]
    pub reset_timeout: Duration,

    /// Concurrent probe calls admitted while half-open.
    pub half_open_max_calls: u32,

    /// Retry policy.
    #[serde(default)]
    pub retry: RetryParams,

    /// Admission policy.
    #[serde(default)]
    pub rate_limiter: RateLimiterParams,

    /// Recovery criteria for the degradation manager.
    #[serde(default)]
    pub recovery: RecoveryCriteria,

    /// Serve the last good response as a terminal fallback when the whole
    /// stack fails.
    #[serde(default)]
    pub serve_stale: bool,
}

impl Default for ServiceParams {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(10),
            reset_timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
            retry: RetryParams::default(),
            rate_limiter: RateLimiterParams::default(),
            recovery: RecoveryCriteria::default(),
            serve_stale: false,
        }
    }
}

impl ServiceParams {
    /// Check closed-form bounds. Called for every service at registry
    /// build time.
    pub fn validate(&self, service: &str) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: &str| ConfigError::InvalidValue {
            service: service.to_string(),
            field,
            reason: reason.to_string(),
        };

        if self.timeout.is_zero() {
            return Err(invalid("timeout", "must be positive"));
        }
        if self.half_open_max_calls == 0 {
            return Err(invalid("half_open_max_calls", "must be at least 1"));
        }
        if self.retry.max_retries == 0 {
            return Err(invalid("retry.max_retries", "must be at least 1"));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(invalid("retry.backoff_multiplier", "must be at least 1.0"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(invalid("retry.jitter_factor", "must be within [0, 1]"));
        }
        if self.retry.max_delay < self.retry.base_delay {
            return Err(invalid("retry.max_delay", "must be at least base_delay"));
        }
        if self.rate_limiter.max_tokens == 0 {
            return Err(invalid("rate_limiter.max_tokens", "must be at least 1"));
        }
        if self.rate_limiter.refill_rate <= 0.0 || !self.rate_limiter.refill_rate.is_finite() {
            return Err(invalid("rate_limiter.refill_rate", "must be positive"));
        }
        if self.rate_limiter.global_limits.window.is_zero() {
            return Err(invalid("rate_limiter.global_limits.window", "must be positive"));
        }
        if self.recovery.consecutive_successes == 0 {
            return Err(invalid("recovery.consecutive_successes", "must be at least 1"));
        }
        Ok(())
    }
}

/// A parameter table keyed by service name, as parsed from YAML or JSON.
///
/// Keys are normalized to uppercase on load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParamsTable {
    #[serde(default)]
    pub services: BTreeMap<String, ServiceParams>,
}

impl ParamsTable {
    /// Parse a table from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let table: ParamsTable = serde_yaml::from_str(yaml)?;
        table.normalized()
    }

    /// Parse a table from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let table: ParamsTable = serde_json::from_str(json)?;
        table.normalized()
    }

    /// Read and parse a YAML table from disk.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Validate every entry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.services.is_empty() {
            return Err(ConfigError::EmptyTable);
        }
        for (name, params) in &self.services {
            params.validate(name)?;
        }
        Ok(())
    }

    fn normalized(self) -> Result<Self, ConfigError> {
        let mut services = BTreeMap::new();
        for (name, params) in self.services {
            let upper = name.to_ascii_uppercase();
            if services.insert(upper.clone(), params).is_some() {
                return Err(ConfigError::DuplicateService(upper));
            }
        }
        let table = Self { services };
        table.validate()?;
        Ok(table)
    }
}
