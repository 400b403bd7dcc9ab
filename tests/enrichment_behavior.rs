//! Behavior-driven tests for the enrichment orchestrator.
//!
//! These tests verify HOW a multi-source run isolates failures, bounds its
//! concurrency, computes coverage and recovers missing ids via fallback.

use bioetl_core::{
    AdapterBatch, AdapterFuture, ApiClientFactory, ApiError, EnrichmentAdapter,
    EnrichmentOrchestrator, EnrichmentRequest, FnHttpClient, HttpRequest, HttpResponse,
    IdentifierKind, OrchestratorConfig, PipelineConfig, Record, TaskState,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn record(value: serde_json::Value) -> Record {
    value.as_object().cloned().expect("object literal")
}

/// Adapter answering from a fixed record list after an optional delay.
struct ScriptedAdapter {
    name: &'static str,
    kind: IdentifierKind,
    records: Vec<Record>,
    delay: Duration,
}

impl ScriptedAdapter {
    fn numeric(name: &'static str, count: usize) -> Self {
        Self {
            name,
            kind: IdentifierKind::Numeric,
            records: (1..=count).map(|i| record(json!({"pmid": i}))).collect(),
            delay: Duration::ZERO,
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl EnrichmentAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        self.name
    }

    fn identifier_kind(&self) -> IdentifierKind {
        self.kind
    }

    fn fetch<'a>(&'a self, _ids: Vec<String>) -> AdapterFuture<'a> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            Ok(AdapterBatch::new(self.records.clone()))
        })
    }
}

struct RaisingAdapter;

impl EnrichmentAdapter for RaisingAdapter {
    fn name(&self) -> &str {
        "B"
    }

    fn identifier_kind(&self) -> IdentifierKind {
        IdentifierKind::Numeric
    }

    fn fetch<'a>(&'a self, _ids: Vec<String>) -> AdapterFuture<'a> {
        Box::pin(async { Err(ApiError::timeout("upstream never answered")) })
    }
}

struct PanickingAdapter;

impl EnrichmentAdapter for PanickingAdapter {
    fn name(&self) -> &str {
        "panics"
    }

    fn identifier_kind(&self) -> IdentifierKind {
        IdentifierKind::Numeric
    }

    fn fetch<'a>(&'a self, _ids: Vec<String>) -> AdapterFuture<'a> {
        Box::pin(async { panic!("adapter bug") })
    }
}

/// Counts how many fetches run at the same time.
struct ConcurrencyProbe {
    name: String,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl EnrichmentAdapter for ConcurrencyProbe {
    fn name(&self) -> &str {
        &self.name
    }

    fn identifier_kind(&self) -> IdentifierKind {
        IdentifierKind::Numeric
    }

    fn fetch<'a>(&'a self, _ids: Vec<String>) -> AdapterFuture<'a> {
        Box::pin(async move {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(40)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(AdapterBatch::default())
        })
    }
}

fn five_ids() -> EnrichmentRequest {
    EnrichmentRequest::new().with_numeric_ids(["1", "2", "3", "4", "5"])
}

// =============================================================================
// Failure isolation
// =============================================================================

#[tokio::test]
async fn when_one_adapter_raises_the_other_is_fully_populated() {
    // Given: Adapter A returning 5 records and adapter B raising
    let orchestrator = EnrichmentOrchestrator::new(OrchestratorConfig::default())
        .with_adapter(Arc::new(ScriptedAdapter::numeric("A", 5)))
        .with_adapter(Arc::new(RaisingAdapter));

    // When: The run completes
    let report = orchestrator.run(&five_ids()).await;

    // Then: A is complete, B only appears as an error
    let a = report.result("A").expect("A result");
    assert_eq!(a.records.len(), 5);
    assert_eq!(a.error, None);
    assert_eq!(a.matched, 5);
    assert_eq!(a.coverage, 1.0);

    let b_error = report.errors.get("B").expect("B error");
    assert!(!b_error.is_empty());
    assert!(b_error.starts_with("E_TIMEOUT"));
    assert!(!report.errors.contains_key("A"));
    assert_eq!(report.result("B").map(|b| b.state), Some(TaskState::Failed));
}

#[tokio::test]
async fn when_an_adapter_exceeds_its_task_timeout_it_is_marked_timed_out() {
    // Given: A slow adapter and a fast adapter under a 50ms task timeout
    let config = OrchestratorConfig {
        task_timeout_sec: 0.05,
        ..OrchestratorConfig::default()
    };
    let orchestrator = EnrichmentOrchestrator::new(config)
        .with_adapter(Arc::new(
            ScriptedAdapter::numeric("slow", 5).with_delay(Duration::from_secs(5)),
        ))
        .with_adapter(Arc::new(ScriptedAdapter::numeric("fast", 2)));

    // When: The run completes
    let started = std::time::Instant::now();
    let report = orchestrator.run(&five_ids()).await;

    // Then: The slow adapter is abandoned without delaying the fast one
    assert!(started.elapsed() < Duration::from_secs(2));
    let slow = report.result("slow").expect("slow result");
    assert_eq!(slow.state, TaskState::TimedOut);
    assert!(slow.records.is_empty());
    assert!(report.errors["slow"].starts_with("E_TIMEOUT"));

    let fast = report.result("fast").expect("fast result");
    assert_eq!(fast.state, TaskState::Succeeded);
    assert_eq!(fast.missing_ids, vec!["3", "4", "5"]);
}

#[tokio::test]
async fn when_an_adapter_panics_the_run_still_returns_a_report() {
    // Given: A panicking adapter next to a healthy one
    let orchestrator = EnrichmentOrchestrator::new(OrchestratorConfig::default())
        .with_adapter(Arc::new(PanickingAdapter))
        .with_adapter(Arc::new(ScriptedAdapter::numeric("A", 1)));

    // When: The run completes
    let report = orchestrator.run(&five_ids()).await;

    // Then: The panic is an ordinary adapter error
    assert!(report.errors["panics"].contains("panicked"));
    assert_eq!(report.result("A").map(|a| a.matched), Some(1));
    assert!(report.has_errors());
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test]
async fn when_more_adapters_than_workers_run_concurrency_is_bounded() {
    // Given: Six adapters and a pool of two workers
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut orchestrator = EnrichmentOrchestrator::new(OrchestratorConfig {
        max_workers: 2,
        ..OrchestratorConfig::default()
    });
    for i in 0..6 {
        orchestrator.register(Arc::new(ConcurrencyProbe {
            name: format!("probe-{i}"),
            active: Arc::clone(&active),
            peak: Arc::clone(&peak),
        }));
    }

    // When: The run completes
    let report = orchestrator.run(&five_ids()).await;

    // Then: Never more than two fetches overlapped and all six finished
    assert_eq!(report.results.len(), 6);
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(peak.load(Ordering::SeqCst) >= 1);
}

// =============================================================================
// Coverage and fallback through configured sources
// =============================================================================

const CROSSREF_YAML: &str = r#"
http:
  retries: { total: 0 }
  rate_limit: { max_calls: 100, period: 1 }
sources:
  crossref:
    base_url: https://crossref.example.test
    batch: { endpoint: works, records_pointer: /message/items }
    identifier: { kind: doi }
    fallback: { endpoint: works/search, records_pointer: /message/items }
orchestrator:
  task_timeout_sec: 5
  fallback_timeout_sec: 5
"#;

fn crossref_upstream(fallback_calls: Arc<AtomicUsize>) -> FnHttpClient {
    FnHttpClient::new(move |request: &HttpRequest| {
        let items = if request.url.contains("/works/search?") {
            fallback_calls.fetch_add(1, Ordering::SeqCst);
            json!([{"DOI": "10.1000/e", "title": "Recovered"}])
        } else {
            json!([
                {"DOI": "10.1000/a"},
                {"DOI": "10.1000/B"},
                {"doi": "https://doi.org/10.1000/c"}
            ])
        };
        Ok(HttpResponse::ok_json(json!({"message": {"items": items}}).to_string()))
    })
}

#[tokio::test]
async fn when_primary_lookup_misses_dois_fallback_recovers_what_it_can() {
    // Given: A configured source whose bulk endpoint resolves 3 of 5 DOIs
    let fallback_calls = Arc::new(AtomicUsize::new(0));
    let config = PipelineConfig::from_yaml_str(CROSSREF_YAML).expect("valid yaml");
    let factory = ApiClientFactory::new(config)
        .with_transport(Arc::new(crossref_upstream(Arc::clone(&fallback_calls))));
    let orchestrator = factory.orchestrator().expect("orchestrator");
    let request = EnrichmentRequest::new().with_dois([
        "10.1000/A",
        "doi:10.1000/b",
        "10.1000/c",
        "10.1000/d",
        "https://doi.org/10.1000/E",
    ]);

    // When: The run completes
    let report = orchestrator.run(&request).await;

    // Then: The fallback ran once and recovered exactly one DOI
    let result = report.result("crossref").expect("crossref result");
    assert_eq!(fallback_calls.load(Ordering::SeqCst), 1);
    assert!(result.fallback_attempted);
    assert_eq!(result.recovered_ids, vec!["https://doi.org/10.1000/E"]);
    assert_eq!(result.missing_ids, vec!["10.1000/d"]);
    assert_eq!(result.matched, 4);
    assert_eq!(result.records.len(), 4);
    assert!((result.coverage - 0.8).abs() < 1e-9);
    assert_eq!(result.state, TaskState::Succeeded);
    assert!(!report.has_errors());
}

#[tokio::test]
async fn when_every_id_is_matched_fallback_is_not_attempted() {
    // Given: A request limited to DOIs the bulk endpoint resolves
    let fallback_calls = Arc::new(AtomicUsize::new(0));
    let config = PipelineConfig::from_yaml_str(CROSSREF_YAML).expect("valid yaml");
    let orchestrator = ApiClientFactory::new(config)
        .with_transport(Arc::new(crossref_upstream(Arc::clone(&fallback_calls))))
        .orchestrator()
        .expect("orchestrator");

    // When: The run completes
    let report = orchestrator
        .run(&EnrichmentRequest::new().with_dois(["10.1000/a", "10.1000/b"]))
        .await;

    // Then: Coverage is complete and no fallback request was made
    let result = report.result("crossref").expect("crossref result");
    assert_eq!(result.coverage, 1.0);
    assert!(!result.fallback_attempted);
    assert_eq!(fallback_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn report_serializes_with_run_metadata() {
    // Given: A finished run
    let orchestrator = EnrichmentOrchestrator::new(OrchestratorConfig::default())
        .with_adapter(Arc::new(ScriptedAdapter::numeric("A", 2)));
    let report = orchestrator.run(&five_ids()).await;

    // When: The report is serialized
    let value = serde_json::to_value(&report).expect("serializable");

    // Then: Run metadata and per-adapter fields are present
    assert!(value["run_id"].as_str().is_some_and(|id| id.len() == 36));
    assert!(value["started_at"].as_str().is_some_and(|ts| ts.contains('T')));
    assert_eq!(value["results"]["A"]["state"], "succeeded");
    assert_eq!(value["results"]["A"]["identifier_kind"], "numeric");
    assert_eq!(value["results"]["A"]["missing_ids"], json!(["3", "4", "5"]));
    assert_eq!(report.summary(), vec!["A: 2/5 matched (40.0%), 0 recovered by fallback"]);
}
