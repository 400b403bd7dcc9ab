use std::fmt::{Display, Formatter};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status bucket of a single request attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    RetryableFailure,
    FatalFailure,
}

/// Record of one finished request attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOutcome {
    pub status: OutcomeStatus,
    pub http_status: Option<u16>,
    pub elapsed: Duration,
    /// Zero-based attempt index within one `send` call.
    pub attempt: u32,
}

/// Closed classification of request failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorKind {
    Timeout,
    RateLimited,
    ClientError,
    ServerError,
    Connection,
    CircuitOpen,
    Unknown,
}

impl ApiErrorKind {
    pub const fn code(self) -> &'static str {
        match self {
            Self::Timeout => "E_TIMEOUT",
            Self::RateLimited => "E_HTTP_429",
            Self::ClientError => "E_HTTP_4XX",
            Self::ServerError => "E_HTTP_5XX",
            Self::Connection => "E_CONNECTION",
            Self::CircuitOpen => "E_CIRCUIT_BREAKER_OPEN",
            Self::Unknown => "E_UNKNOWN",
        }
    }

    /// Whether the client-level retry loop may attempt the call again.
    pub const fn retryable(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::RateLimited | Self::ServerError | Self::Connection
        )
    }

    /// Maps an HTTP status outside the 2xx range to its failure kind.
    pub const fn from_status(status: u16) -> Self {
        match status {
            429 => Self::RateLimited,
            400..=499 => Self::ClientError,
            500..=599 => Self::ServerError,
            _ => Self::Unknown,
        }
    }

    pub const fn outcome_status(self) -> OutcomeStatus {
        if self.retryable() {
            OutcomeStatus::RetryableFailure
        } else {
            OutcomeStatus::FatalFailure
        }
    }
}

impl Display for ApiErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Typed error surfaced by [`ApiClient::send`](crate::ApiClient::send).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}: {message}", .kind.code())]
pub struct ApiError {
    kind: ApiErrorKind,
    message: String,
    http_status: Option<u16>,
    outcome: Option<RequestOutcome>,
}

impl ApiError {
    pub fn new(kind: ApiErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            http_status: None,
            outcome: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Timeout, message)
    }

    pub fn circuit_open(client: &str) -> Self {
        Self::new(
            ApiErrorKind::CircuitOpen,
            format!("circuit breaker for '{client}' is open; skipping upstream call"),
        )
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            http_status: Some(status),
            ..Self::new(ApiErrorKind::from_status(status), message)
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Unknown, message)
    }

    pub fn with_outcome(mut self, outcome: RequestOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub const fn kind(&self) -> ApiErrorKind {
        self.kind
    }

    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn http_status(&self) -> Option<u16> {
        self.http_status
    }

    pub const fn outcome(&self) -> Option<RequestOutcome> {
        self.outcome
    }

    pub const fn retryable(&self) -> bool {
        self.kind.retryable()
    }
}

/// Errors raised while merging or resolving pipeline configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("source '{0}' is not configured")]
    UnknownSource(String),

    #[error("source '{source_name}': {reason}")]
    Invalid { source_name: String, reason: String },

    #[error("source '{source_name}': header '{header}' references unset environment variable '{var}'")]
    MissingEnv {
        source_name: String,
        header: String,
        var: String,
    },

    #[error("failed to build http transport for '{source_name}': {message}")]
    Transport { source_name: String, message: String },

    #[error("invalid yaml configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ConfigError {
    pub fn invalid(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_closed_taxonomy() {
        assert_eq!(ApiErrorKind::from_status(429), ApiErrorKind::RateLimited);
        assert_eq!(ApiErrorKind::from_status(404), ApiErrorKind::ClientError);
        assert_eq!(ApiErrorKind::from_status(503), ApiErrorKind::ServerError);
        assert_eq!(ApiErrorKind::from_status(302), ApiErrorKind::Unknown);
    }

    #[test]
    fn fatal_kinds_are_not_retryable() {
        assert!(!ApiErrorKind::ClientError.retryable());
        assert!(!ApiErrorKind::CircuitOpen.retryable());
        assert!(!ApiErrorKind::Unknown.retryable());
        assert!(ApiErrorKind::RateLimited.retryable());
        assert_eq!(
            ApiErrorKind::Connection.outcome_status(),
            OutcomeStatus::RetryableFailure
        );
    }

    #[test]
    fn display_prefixes_error_code() {
        let error = ApiError::http(503, "upstream returned status 503");
        assert_eq!(error.to_string(), "E_HTTP_5XX: upstream returned status 503");
        assert_eq!(error.http_status(), Some(503));
    }
}
