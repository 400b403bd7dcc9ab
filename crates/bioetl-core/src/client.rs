//! Single-request execution pipeline shared by every upstream source.
//!
//! Each attempt runs: breaker admission, token acquisition, the network call
//! under the client timeout, classification, breaker bookkeeping and, for
//! retryable classifications, a backoff sleep before the next attempt.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;

use crate::circuit_breaker::{CircuitBreaker, CircuitSnapshot};
use crate::config::ClientConfig;
use crate::error::{ApiError, ApiErrorKind, ConfigError, OutcomeStatus, RequestOutcome};
use crate::http_client::{
    HttpClient, HttpMethod, HttpRequest, HttpResponse, TransportError, TransportErrorKind,
};
use crate::retry::parse_retry_after;
use crate::throttling::TokenBucketLimiter;

/// Successful upstream response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub url: String,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub outcome: RequestOutcome,
}

impl ApiResponse {
    /// Decodes the opaque body as JSON.
    pub fn json(&self) -> Result<Value, ApiError> {
        serde_json::from_str(&self.body).map_err(|error| {
            ApiError::unknown(format!("response from {} is not valid json: {error}", self.url))
                .with_outcome(self.outcome)
        })
    }
}

/// Diagnostics view of one client.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClientHealth {
    pub circuit: CircuitSnapshot,
    pub tokens_remaining: u32,
}

/// Resilient client for one named upstream source.
pub struct ApiClient {
    config: ClientConfig,
    headers: BTreeMap<String, String>,
    transport: Arc<dyn HttpClient>,
    breaker: CircuitBreaker,
    limiter: TokenBucketLimiter,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("name", &self.config.name)
            .field("base_url", &self.config.base_url)
            .field("breaker", &self.breaker)
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    pub fn new(config: ClientConfig, transport: Arc<dyn HttpClient>) -> Result<Self, ConfigError> {
        let headers = config.resolved_headers()?;
        Ok(Self {
            breaker: CircuitBreaker::new(config.name.clone(), config.circuit_breaker),
            limiter: TokenBucketLimiter::new(config.rate_limit),
            headers,
            transport,
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub const fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub const fn limiter(&self) -> &TokenBucketLimiter {
        &self.limiter
    }

    pub fn health(&self) -> ClientHealth {
        ClientHealth {
            circuit: self.breaker.snapshot(),
            tokens_remaining: self.limiter.last_remaining(),
        }
    }

    /// Absolute URL for `endpoint` with percent-encoded query `params`.
    pub fn build_url(&self, endpoint: &str, params: &[(String, String)]) -> String {
        let mut url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_owned()
        } else if endpoint.is_empty() {
            self.config.base_url.clone()
        } else {
            format!(
                "{}/{}",
                self.config.base_url,
                endpoint.trim_start_matches('/')
            )
        };

        let query = params
            .iter()
            .map(|(name, value)| {
                format!("{}={}", urlencoding::encode(name), urlencoding::encode(value))
            })
            .collect::<Vec<_>>()
            .join("&");

        if !query.is_empty() {
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str(&query);
        }
        url
    }

    pub async fn get(
        &self,
        endpoint: &str,
        params: &[(String, String)],
    ) -> Result<ApiResponse, ApiError> {
        self.send(HttpMethod::Get, endpoint, params).await
    }

    /// Executes one logical request, retrying retryable failures per the
    /// client's policy. Fatal 4xx responses and an open breaker return at once.
    pub async fn send(
        &self,
        method: HttpMethod,
        endpoint: &str,
        params: &[(String, String)],
    ) -> Result<ApiResponse, ApiError> {
        let url = self.build_url(endpoint, params);
        let policy = &self.config.retry;
        let max_attempts = policy.max_attempts();
        let mut attempt = 0;

        loop {
            let Some(permit) = self.breaker.allow() else {
                tracing::debug!(
                    client = %self.config.name,
                    method = method.as_str(),
                    %url,
                    "failing fast, circuit open"
                );
                return Err(ApiError::circuit_open(&self.config.name));
            };

            if let Err(error) = self.limiter.acquire(1).await {
                self.breaker.record_failure(OutcomeStatus::FatalFailure);
                return Err(ApiError::unknown(error.to_string()));
            }

            let started = Instant::now();
            let result = self.execute_once(method, &url).await;
            let elapsed = started.elapsed();

            let (error, retry_after) = match result {
                Ok(response) => {
                    self.breaker.record_success();
                    let outcome = RequestOutcome {
                        status: OutcomeStatus::Success,
                        http_status: Some(response.status),
                        elapsed,
                        attempt,
                    };
                    tracing::debug!(
                        client = %self.config.name,
                        method = method.as_str(),
                        status = response.status,
                        attempt,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "request succeeded"
                    );
                    return Ok(ApiResponse {
                        url,
                        status: response.status,
                        headers: response.headers,
                        body: response.body,
                        outcome,
                    });
                }
                Err(failure) => failure,
            };

            let outcome = RequestOutcome {
                status: error.kind().outcome_status(),
                http_status: error.http_status(),
                elapsed,
                attempt,
            };
            self.breaker.record_failure(outcome.status);
            drop(permit);
            let error = error.with_outcome(outcome);

            let exhausted = attempt + 1 >= max_attempts;
            if !error.retryable() || exhausted {
                tracing::warn!(
                    client = %self.config.name,
                    method = method.as_str(),
                    code = error.code(),
                    attempts = attempt + 1,
                    error = %error.message(),
                    "request failed"
                );
                return Err(error);
            }

            let delay = policy.delay_for_attempt(attempt, retry_after);
            tracing::warn!(
                client = %self.config.name,
                code = error.code(),
                attempt = attempt + 1,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                "retrying request"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn execute_once(
        &self,
        method: HttpMethod,
        url: &str,
    ) -> Result<HttpResponse, (ApiError, Option<Duration>)> {
        let mut request = HttpRequest::new(method, url).with_timeout(self.config.timeout);
        for (name, value) in &self.headers {
            request = request.with_header(name.clone(), value.clone());
        }

        let response = tokio::time::timeout(self.config.timeout, self.transport.execute(request))
            .await
            .map_err(|_| {
                (
                    ApiError::timeout(format!(
                        "{url} did not respond within {:?}",
                        self.config.timeout
                    )),
                    None,
                )
            })?
            .map_err(|error| (classify_transport(&error), None))?;

        if response.is_success() {
            return Ok(response);
        }

        let retry_after = (response.status == 429)
            .then(|| response.header("retry-after").and_then(parse_retry_after))
            .flatten();
        let error = ApiError::http(
            response.status,
            format!("{url} returned status {}", response.status),
        );
        Err((error, retry_after))
    }
}

fn classify_transport(error: &TransportError) -> ApiError {
    let kind = match error.kind() {
        TransportErrorKind::Timeout => ApiErrorKind::Timeout,
        TransportErrorKind::Connect => ApiErrorKind::Connection,
        TransportErrorKind::Other => ApiErrorKind::Unknown,
    };
    ApiError::new(kind, error.message())
}
