//! Pipeline configuration consumed by the remote-access core.
//!
//! Configuration is layered: a global [`HttpSettings`] block supplies defaults and
//! every [`SourceConfig`] may override any field. [`PipelineConfig::resolve_client`]
//! merges both layers, applies built-in defaults and validates the result into a
//! [`ClientConfig`] ready for [`ApiClientFactory`](crate::ApiClientFactory).
//!
//! ```yaml
//! http:
//!   timeout_sec: 30
//!   retries: { total: 3, backoff_multiplier: 2.0 }
//!   rate_limit: { max_calls: 10, period: 1.0 }
//! sources:
//!   pubmed:
//!     base_url: https://eutils.ncbi.nlm.nih.gov/entrez/eutils
//!     max_batch_size: 200
//!     batch: { endpoint: /esummary.fcgi, id_param: id, records_pointer: /result/records }
//!     identifier: { kind: numeric }
//! ```

use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::ConfigError;
use crate::identifier::IdentifierKind;
use crate::retry::{Backoff, RetryPolicy};
use crate::throttling::RateLimitBudget;

const DEFAULT_TIMEOUT_SEC: f64 = 30.0;
const DEFAULT_CONNECT_TIMEOUT_SEC: f64 = 10.0;
const DEFAULT_READ_TIMEOUT_SEC: f64 = 30.0;
const DEFAULT_RETRIES: u32 = 3;
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_BACKOFF_BASE_MS: u64 = 500;
const DEFAULT_BACKOFF_MAX_SEC: f64 = 30.0;
const DEFAULT_MAX_RETRY_AFTER_SEC: f64 = 120.0;
const DEFAULT_MAX_CALLS: u32 = 10;
const DEFAULT_PERIOD_SEC: f64 = 1.0;
const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_COOL_DOWN_SEC: f64 = 60.0;
const DEFAULT_MAX_BATCH_SIZE: usize = 100;
const DEFAULT_MAX_URL_LENGTH: usize = 2000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub total: Option<u32>,
    pub backoff_multiplier: Option<f64>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_max_sec: Option<f64>,
    pub max_retry_after_sec: Option<f64>,
}

impl RetrySettings {
    fn merged_over(&self, base: &Self) -> Self {
        Self {
            total: self.total.or(base.total),
            backoff_multiplier: self.backoff_multiplier.or(base.backoff_multiplier),
            backoff_base_ms: self.backoff_base_ms.or(base.backoff_base_ms),
            backoff_max_sec: self.backoff_max_sec.or(base.backoff_max_sec),
            max_retry_after_sec: self.max_retry_after_sec.or(base.max_retry_after_sec),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub max_calls: Option<u32>,
    /// Window length in seconds.
    pub period: Option<f64>,
}

impl RateLimitSettings {
    fn merged_over(&self, base: &Self) -> Self {
        Self {
            max_calls: self.max_calls.or(base.max_calls),
            period: self.period.or(base.period),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: Option<bool>,
    /// Entry lifetime in seconds; absent means "for the whole run".
    pub ttl: Option<u64>,
    pub maxsize: Option<usize>,
}

impl CacheSettings {
    fn merged_over(&self, base: &Self) -> Self {
        Self {
            enabled: self.enabled.or(base.enabled),
            ttl: self.ttl.or(base.ttl),
            maxsize: self.maxsize.or(base.maxsize),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: Option<u32>,
    pub cool_down_sec: Option<f64>,
}

impl CircuitBreakerSettings {
    fn merged_over(&self, base: &Self) -> Self {
        Self {
            failure_threshold: self.failure_threshold.or(base.failure_threshold),
            cool_down_sec: self.cool_down_sec.or(base.cool_down_sec),
        }
    }
}

/// HTTP knobs shared by the global block and every source block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub timeout_sec: Option<f64>,
    pub connect_timeout_sec: Option<f64>,
    pub read_timeout_sec: Option<f64>,
    pub user_agent: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub retries: RetrySettings,
    pub rate_limit: RateLimitSettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub cache: CacheSettings,
    pub max_batch_size: Option<usize>,
    pub max_url_length: Option<usize>,
}

impl HttpSettings {
    /// Field-wise merge where `self` wins; headers merge key by key.
    pub fn merged_over(&self, base: &Self) -> Self {
        let mut headers = base.headers.clone();
        headers.extend(
            self.headers
                .iter()
                .map(|(name, value)| (name.clone(), value.clone())),
        );

        Self {
            timeout_sec: self.timeout_sec.or(base.timeout_sec),
            connect_timeout_sec: self.connect_timeout_sec.or(base.connect_timeout_sec),
            read_timeout_sec: self.read_timeout_sec.or(base.read_timeout_sec),
            user_agent: self.user_agent.clone().or_else(|| base.user_agent.clone()),
            headers,
            retries: self.retries.merged_over(&base.retries),
            rate_limit: self.rate_limit.merged_over(&base.rate_limit),
            circuit_breaker: self.circuit_breaker.merged_over(&base.circuit_breaker),
            cache: self.cache.merged_over(&base.cache),
            max_batch_size: self.max_batch_size.or(base.max_batch_size),
            max_url_length: self.max_url_length.or(base.max_url_length),
        }
    }
}

fn default_id_param() -> String {
    String::from("ids")
}

fn default_id_separator() -> String {
    String::from(",")
}

fn default_release_tag() -> String {
    String::from("unversioned")
}

/// How one bulk endpoint is addressed and how its response is unpacked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSettings {
    /// Path appended to the source `base_url`.
    pub endpoint: String,
    #[serde(default = "default_id_param")]
    pub id_param: String,
    #[serde(default = "default_id_separator")]
    pub id_separator: String,
    /// Static query parameters sent with every batch.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// JSON pointer to the record array; the body itself when absent.
    #[serde(default)]
    pub records_pointer: Option<String>,
    /// Record field holding the entity id used as cache key.
    #[serde(default)]
    pub id_field: Option<String>,
    #[serde(default = "default_release_tag")]
    pub release_tag: String,
}

impl BatchSettings {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            id_param: default_id_param(),
            id_separator: default_id_separator(),
            params: BTreeMap::new(),
            records_pointer: None,
            id_field: None,
            release_tag: default_release_tag(),
        }
    }
}

/// Identifier extraction rules of one adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierSettings {
    pub kind: IdentifierKind,
    #[serde(default)]
    pub match_fields: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

/// One named upstream source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub base_url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub http: HttpSettings,
    #[serde(default)]
    pub batch: Option<BatchSettings>,
    #[serde(default)]
    pub identifier: Option<IdentifierSettings>,
    #[serde(default)]
    pub fallback: Option<BatchSettings>,
}

impl SourceConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            enabled: true,
            http: HttpSettings::default(),
            batch: None,
            identifier: None,
            fallback: None,
        }
    }
}

fn default_max_workers() -> usize {
    4
}

fn default_task_timeout_sec() -> f64 {
    120.0
}

fn default_fallback_timeout_sec() -> f64 {
    60.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_task_timeout_sec")]
    pub task_timeout_sec: f64,
    #[serde(default = "default_fallback_timeout_sec")]
    pub fallback_timeout_sec: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            task_timeout_sec: default_task_timeout_sec(),
            fallback_timeout_sec: default_fallback_timeout_sec(),
        }
    }
}

impl OrchestratorConfig {
    pub fn task_timeout(&self) -> Duration {
        seconds(self.task_timeout_sec)
    }

    pub fn fallback_timeout(&self) -> Duration {
        seconds(self.fallback_timeout_sec)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::invalid(
                "orchestrator",
                "max_workers must be at least 1",
            ));
        }
        positive_seconds("orchestrator", "task_timeout_sec", Some(self.task_timeout_sec), 0.0)?;
        positive_seconds(
            "orchestrator",
            "fallback_timeout_sec",
            Some(self.fallback_timeout_sec),
            0.0,
        )?;
        Ok(())
    }
}

/// Root configuration object handed to the core.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub http: HttpSettings,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

impl PipelineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.orchestrator.validate()?;
        Ok(config)
    }

    pub fn source(&self, name: &str) -> Result<&SourceConfig, ConfigError> {
        self.sources
            .get(name)
            .ok_or_else(|| ConfigError::UnknownSource(name.to_owned()))
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = (&String, &SourceConfig)> {
        self.sources.iter().filter(|(_, source)| source.enabled)
    }

    /// Merges global and per-source settings and validates the result.
    pub fn resolve_client(&self, name: &str) -> Result<ClientConfig, ConfigError> {
        let source = self.source(name)?;
        let merged = source.http.merged_over(&self.http);
        ClientConfig::resolve(name, &source.base_url, &merged)
    }
}

/// Cache policy of one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CachePolicy {
    pub enabled: bool,
    pub ttl: Option<Duration>,
    pub maxsize: Option<usize>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: None,
            maxsize: None,
        }
    }
}

/// Fully resolved configuration of one named client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub name: String,
    pub base_url: String,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub user_agent: String,
    /// Raw header values; `env:NAME` values are resolved by [`ClientConfig::resolved_headers`].
    pub headers: BTreeMap<String, String>,
    pub retry: RetryPolicy,
    pub rate_limit: RateLimitBudget,
    pub circuit_breaker: CircuitBreakerConfig,
    pub cache: CachePolicy,
    pub max_batch_size: usize,
    pub max_url_length: usize,
}

impl ClientConfig {
    /// Built-in defaults for a client without any configuration.
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            timeout: seconds(DEFAULT_TIMEOUT_SEC),
            connect_timeout: seconds(DEFAULT_CONNECT_TIMEOUT_SEC),
            read_timeout: seconds(DEFAULT_READ_TIMEOUT_SEC),
            user_agent: default_user_agent(),
            headers: BTreeMap::new(),
            retry: RetryPolicy::exponential(DEFAULT_RETRIES, DEFAULT_BACKOFF_MULTIPLIER),
            rate_limit: RateLimitBudget::per_period(DEFAULT_MAX_CALLS, seconds(DEFAULT_PERIOD_SEC)),
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: DEFAULT_FAILURE_THRESHOLD,
                cool_down: seconds(DEFAULT_COOL_DOWN_SEC),
            },
            cache: CachePolicy::default(),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_url_length: DEFAULT_MAX_URL_LENGTH,
        }
    }

    pub fn resolve(name: &str, base_url: &str, http: &HttpSettings) -> Result<Self, ConfigError> {
        let base_url = base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(ConfigError::invalid(name, "base_url must not be empty"));
        }
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ConfigError::invalid(
                name,
                format!("base_url must be an http(s) url: '{base_url}'"),
            ));
        }

        let timeout = positive_seconds(name, "timeout_sec", http.timeout_sec, DEFAULT_TIMEOUT_SEC)?;
        let connect_timeout = positive_seconds(
            name,
            "connect_timeout_sec",
            http.connect_timeout_sec,
            DEFAULT_CONNECT_TIMEOUT_SEC,
        )?;
        let read_timeout = positive_seconds(
            name,
            "read_timeout_sec",
            http.read_timeout_sec,
            DEFAULT_READ_TIMEOUT_SEC,
        )?;

        let multiplier = http
            .retries
            .backoff_multiplier
            .unwrap_or(DEFAULT_BACKOFF_MULTIPLIER);
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(ConfigError::invalid(
                name,
                format!("retries.backoff_multiplier must be >= 1.0, got {multiplier}"),
            ));
        }
        let retry = RetryPolicy {
            total: http.retries.total.unwrap_or(DEFAULT_RETRIES),
            backoff: Backoff::Exponential {
                base: Duration::from_millis(
                    http.retries.backoff_base_ms.unwrap_or(DEFAULT_BACKOFF_BASE_MS),
                ),
                factor: multiplier,
                max: positive_seconds(
                    name,
                    "retries.backoff_max_sec",
                    http.retries.backoff_max_sec,
                    DEFAULT_BACKOFF_MAX_SEC,
                )?,
                jitter: true,
            },
            max_retry_after: positive_seconds(
                name,
                "retries.max_retry_after_sec",
                http.retries.max_retry_after_sec,
                DEFAULT_MAX_RETRY_AFTER_SEC,
            )?,
        };

        let max_calls = http.rate_limit.max_calls.unwrap_or(DEFAULT_MAX_CALLS);
        if max_calls == 0 {
            return Err(ConfigError::invalid(name, "rate_limit.max_calls must be > 0"));
        }
        let period = positive_seconds(
            name,
            "rate_limit.period",
            http.rate_limit.period,
            DEFAULT_PERIOD_SEC,
        )?;

        let failure_threshold = http
            .circuit_breaker
            .failure_threshold
            .unwrap_or(DEFAULT_FAILURE_THRESHOLD);
        if failure_threshold == 0 {
            return Err(ConfigError::invalid(
                name,
                "circuit_breaker.failure_threshold must be > 0",
            ));
        }

        let max_batch_size = http.max_batch_size.unwrap_or(DEFAULT_MAX_BATCH_SIZE);
        if max_batch_size == 0 {
            return Err(ConfigError::invalid(name, "max_batch_size must be > 0"));
        }
        let max_url_length = http.max_url_length.unwrap_or(DEFAULT_MAX_URL_LENGTH);
        if max_url_length == 0 {
            return Err(ConfigError::invalid(name, "max_url_length must be > 0"));
        }

        Ok(Self {
            name: name.to_owned(),
            base_url: base_url.to_owned(),
            timeout,
            connect_timeout,
            read_timeout,
            user_agent: http.user_agent.clone().unwrap_or_else(default_user_agent),
            headers: http.headers.clone(),
            retry,
            rate_limit: RateLimitBudget::per_period(max_calls, period),
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold,
                cool_down: positive_seconds(
                    name,
                    "circuit_breaker.cool_down_sec",
                    http.circuit_breaker.cool_down_sec,
                    DEFAULT_COOL_DOWN_SEC,
                )?,
            },
            cache: CachePolicy {
                enabled: http.cache.enabled.unwrap_or(true),
                ttl: http.cache.ttl.map(Duration::from_secs),
                maxsize: http.cache.maxsize,
            },
            max_batch_size,
            max_url_length,
        })
    }

    /// Header values with `env:NAME` references looked up in the process environment.
    pub fn resolved_headers(&self) -> Result<BTreeMap<String, String>, ConfigError> {
        self.headers
            .iter()
            .map(|(header, value)| {
                let value = match value.strip_prefix("env:") {
                    Some(var) => env::var(var.trim()).map_err(|_| ConfigError::MissingEnv {
                        source_name: self.name.clone(),
                        header: header.clone(),
                        var: var.trim().to_owned(),
                    })?,
                    None => value.clone(),
                };
                Ok((header.to_ascii_lowercase(), value))
            })
            .collect()
    }
}

fn default_user_agent() -> String {
    format!("bioetl/{}", env!("CARGO_PKG_VERSION"))
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

fn positive_seconds(
    source: &str,
    field: &str,
    value: Option<f64>,
    default: f64,
) -> Result<Duration, ConfigError> {
    let value = value.unwrap_or(default);
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::invalid(
            source,
            format!("{field} must be a positive number of seconds, got {value}"),
        ));
    }
    Duration::try_from_secs_f64(value).map_err(|_| {
        ConfigError::invalid(
            source,
            format!("{field} is too large to be a duration, got {value}"),
        )
    })
}
