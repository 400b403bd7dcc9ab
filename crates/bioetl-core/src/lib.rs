//! # bioetl Core
//!
//! Resilient remote-access core and multi-source enrichment orchestrator for
//! the bioetl acquisition pipeline.
//!
//! ## Overview
//!
//! This crate protects the rest of the pipeline from unreliable upstream
//! services:
//!
//! - **Token bucket** rate limiting per named client
//! - **Circuit breaker** isolation of repeatedly failing dependencies
//! - **Unified API client** with retry, backoff and a closed error taxonomy
//! - **Adaptive batch fetching** that halves oversized or slow batches
//! - **Release-keyed response cache** shared within a run
//! - **Enrichment orchestrator** fanning bulk lookups out to several sources
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`adapter`] | Uniform fetch/fallback contract for sources |
//! | [`batch`] | Adaptive batch splitting over a work stack |
//! | [`cache`] | Run-scoped `(release_tag, id)` cache |
//! | [`circuit_breaker`] | Closed/Open/HalfOpen breaker |
//! | [`client`] | Single-request execution pipeline |
//! | [`config`] | Global/per-source configuration merging |
//! | [`error`] | Error taxonomy and request outcomes |
//! | [`factory`] | Per-source client, fetcher and adapter construction |
//! | [`http_client`] | Transport abstraction (reqwest, closure) |
//! | [`identifier`] | Numeric/DOI/title normalization |
//! | [`orchestrator`] | Concurrent enrichment runs and reports |
//! | [`record`] | Record maps and identifier extraction |
//! | [`retry`] | Backoff schedules and `Retry-After` parsing |
//! | [`throttling`] | Token bucket limiter |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use bioetl_core::{ApiClientFactory, EnrichmentRequest, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::from_yaml_str(&std::fs::read_to_string("sources.yaml")?)?;
//!     let orchestrator = ApiClientFactory::new(config).orchestrator()?;
//!
//!     let request = EnrichmentRequest::new().with_dois(["10.1000/xyz123"]);
//!     let report = orchestrator.run(&request).await;
//!
//!     for line in report.summary() {
//!         println!("{line}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────┐
//! │ EnrichmentOrchestrator│  one task per adapter, bounded pool
//! └──────────┬────────────┘
//!            │
//!            ▼
//! ┌───────────────────────┐     ┌──────────────────┐
//! │ AdaptiveBatchFetcher  │────▶│ ResponseCache    │
//! └──────────┬────────────┘     └──────────────────┘
//!            │
//!            ▼
//! ┌───────────────────────┐     ┌──────────────────┐
//! │ ApiClient             │────▶│ CircuitBreaker   │
//! │ (retry + classify)    │────▶│ TokenBucket      │
//! └──────────┬────────────┘     └──────────────────┘
//!            │
//!            ▼
//! ┌───────────────────────┐
//! │ HttpClient            │
//! │ (reqwest/closure)     │
//! └───────────────────────┘
//! ```
//!
//! ## Error Handling
//!
//! [`ApiClient::send`] returns a typed [`ApiError`]; callers branch on its kind:
//!
//! ```rust
//! use bioetl_core::{ApiError, ApiErrorKind};
//!
//! fn handle_error(error: &ApiError) {
//!     match error.kind() {
//!         ApiErrorKind::CircuitOpen => {
//!             // Upstream is isolated, skip it for now
//!         }
//!         ApiErrorKind::ClientError => {
//!             // Fatal request problem, report it
//!         }
//!         _ => {}
//!     }
//! }
//! ```

pub mod adapter;
pub mod batch;
pub mod cache;
pub mod circuit_breaker;
pub mod client;
pub mod config;
pub mod error;
pub mod factory;
pub mod http_client;
pub mod identifier;
pub mod orchestrator;
pub mod record;
pub mod retry;
pub mod throttling;

// Adapters
pub use adapter::{AdapterBatch, AdapterFuture, BatchAdapter, EnrichmentAdapter};

// Batch fetching
pub use batch::{AdaptiveBatchFetcher, BatchFailure, BatchRequest, FetchOutcome};

// Caching
pub use cache::{CacheStats, ResponseCache};

// Circuit breaker
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitPermit, CircuitSnapshot, CircuitState,
};

// Client
pub use client::{ApiClient, ApiResponse, ClientHealth};

// Configuration
pub use config::{
    BatchSettings, CachePolicy, CacheSettings, CircuitBreakerSettings, ClientConfig, HttpSettings,
    IdentifierSettings, OrchestratorConfig, PipelineConfig, RateLimitSettings, RetrySettings,
    SourceConfig,
};

// Error types
pub use error::{ApiError, ApiErrorKind, ConfigError, OutcomeStatus, RequestOutcome};

// Factory
pub use factory::ApiClientFactory;

// HTTP client types
pub use http_client::{
    FnHttpClient, HttpClient, HttpMethod, HttpRequest, HttpResponse, ReqwestHttpClient,
    TransportError, TransportErrorKind, TransportSettings,
};

// Identifiers
pub use identifier::IdentifierKind;

// Orchestration
pub use orchestrator::{
    AdapterResult, EnrichmentOrchestrator, EnrichmentReport, EnrichmentRequest, TaskState,
};

// Records
pub use record::Record;

// Retry logic
pub use retry::{Backoff, RetryPolicy};

// Throttling
pub use throttling::{RateLimitBudget, ThrottleError, TokenBucketLimiter};
