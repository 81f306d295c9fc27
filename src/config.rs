//! Declarative YAML configuration for retry/hedging policies.
//!
//! Mirrors the source's `cfg.go`: a document lists services, each with an optional throttle and
//! a retry-or-hedging policy, optionally overridden per method. Decoded with `serde`, then
//! defaulted with a `repair()` pass per section so a minimal document (just a name and a handful
//! of error codes) is enough to get sane behavior.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use uuid::Uuid;

fn default_max_tokens() -> f64 {
    10.0
}

fn default_token_ratio() -> f64 {
    0.1
}

/// Top-level document: `services:` is the only required key.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub services: Vec<ServiceCfg>,
}

/// One service's retry/hedging configuration, optionally specialized per method.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceCfg {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub callee: String,
    #[serde(default)]
    pub throttle: Option<ThrottleCfg>,
    #[serde(default)]
    pub retry_hedging: RetryHedgingCfg,
    #[serde(default)]
    pub methods: Vec<MethodCfg>,
}

impl ServiceCfg {
    /// This engine only dispatches by naming-service name; if `name` is absent, `callee` (the
    /// proto service identity) stands in for it.
    pub fn repair(&mut self) {
        if self.name.is_empty() {
            self.name = self.callee.clone();
        }
    }
}

/// Per-method override of the service-level retry/hedging policy.
#[derive(Debug, Clone, Deserialize)]
pub struct MethodCfg {
    pub callee: String,
    #[serde(default)]
    pub retry_hedging: Option<RetryHedgingCfg>,
}

/// Throttle parameters for a service. An explicitly-empty block (`max_tokens: 0` and
/// `token_ratio: 0`) disables throttling for that service.
#[derive(Debug, Clone, Deserialize)]
pub struct ThrottleCfg {
    #[serde(default)]
    pub max_tokens: f64,
    #[serde(default)]
    pub token_ratio: f64,
}

/// Retry and hedging are mutually exclusive per service/method; when both are present, retry
/// wins (matching the source's documented priority).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetryHedgingCfg {
    #[serde(default)]
    pub retry: Option<RetryCfg>,
    #[serde(default)]
    pub hedging: Option<HedgingCfg>,
}

fn default_retry_max_attempts() -> usize {
    2
}

/// Default retryable error codes, matching the source's network/timeout-class defaults.
pub fn default_retryable_error_codes() -> Vec<i32> {
    vec![101, 111, 121, 131]
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryCfg {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: usize,
    #[serde(default)]
    pub backoff: BackoffCfg,
    #[serde(default)]
    pub retryable_error_codes: Vec<i32>,
    #[serde(default)]
    pub skip_visited_nodes: Option<bool>,
}

impl RetryCfg {
    pub fn repair(&mut self) {
        if self.max_attempts == 0 {
            self.max_attempts = default_retry_max_attempts();
        }
        if self.name.is_empty() {
            self.name = format!("retry-{}", Uuid::new_v4());
        }
        if self.retryable_error_codes.is_empty() {
            self.retryable_error_codes = default_retryable_error_codes();
        }
    }
}

fn default_hedging_max_attempts() -> usize {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub struct HedgingCfg {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_hedging_max_attempts")]
    pub max_attempts: usize,
    #[serde(with = "humantime_serde", default)]
    pub hedging_delay: Duration,
    #[serde(default)]
    pub non_fatal_error_codes: Vec<i32>,
    #[serde(default)]
    pub skip_visited_nodes: Option<bool>,
}

impl HedgingCfg {
    pub fn repair(&mut self) {
        if self.max_attempts == 0 {
            self.max_attempts = default_hedging_max_attempts();
        }
        if self.name.is_empty() {
            self.name = format!("hedging-{}", Uuid::new_v4());
        }
        if self.non_fatal_error_codes.is_empty() {
            self.non_fatal_error_codes = default_retryable_error_codes();
        }
    }
}

/// Exactly one of `linear`/`exponential` should be set; `exponential` wins if both are present
/// (matching [`crate::backoff::Backoff`]'s own priority when a user function is also supplied).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackoffCfg {
    #[serde(default)]
    pub linear: Vec<HumanDuration>,
    #[serde(default)]
    pub exponential: Option<ExponentialBackoffCfg>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExponentialBackoffCfg {
    #[serde(with = "humantime_serde")]
    pub initial: Duration,
    #[serde(with = "humantime_serde")]
    pub maximum: Duration,
    pub multiplier: f64,
}

/// A `Duration` parsed from a human-readable string (`"100ms"`, `"1s"`), matching the YAML
/// surface of `linear:` lists.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(transparent)]
pub struct HumanDuration(#[serde(with = "humantime_serde")] pub Duration);

mod humantime_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

impl ThrottleCfg {
    pub fn or_default() -> Self {
        Self { max_tokens: default_max_tokens(), token_ratio: default_token_ratio() }
    }

    /// Fill in zeroed fields with the service-level defaults.
    pub fn repair(&mut self) {
        if self.max_tokens == 0.0 {
            self.max_tokens = default_max_tokens();
        }
        if self.token_ratio == 0.0 {
            self.token_ratio = default_token_ratio();
        }
    }
}

/// Errors raised decoding or validating an [`EngineConfig`] document.
#[derive(Debug)]
pub enum ConfigError {
    /// The YAML document could not be parsed.
    Decode(serde_yaml::Error),
    /// A backoff/throttle/policy value failed downstream validation.
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "failed to parse retry/hedging configuration: {}", e),
            Self::Invalid(msg) => write!(f, "invalid retry/hedging configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Decode(e) => Some(e),
            Self::Invalid(_) => None,
        }
    }
}

impl EngineConfig {
    /// Parse a YAML document into a config, without running `repair()`.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(raw).map_err(ConfigError::Decode)
    }
}
