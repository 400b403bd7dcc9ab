//! Concurrent multi-source enrichment.
//!
//! Every registered adapter runs as its own tokio task. A semaphore bounds the
//! pool to `min(max_workers, adapter_count)`, each task is wrapped in a hard
//! timeout and a failure in one adapter never touches its siblings. Results are
//! keyed by adapter name, not by arrival order.
//!
//! ```text
//!  EnrichmentRequest ──► dedupe ──► spawn one task per adapter (bounded pool)
//!                                          │
//!                           timeout(fetch) ─┼─► coverage ─► fallback(missing)?
//!                                          │
//!                        EnrichmentReport { results, errors } ◄── join all
//! ```

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tracing::Instrument;
use uuid::Uuid;

use crate::adapter::EnrichmentAdapter;
use crate::config::OrchestratorConfig;
use crate::identifier::{dedupe_preserving_order, IdentifierKind};
use crate::record::{identifier_values, merge_unique, Record};

/// Identifier collections an enrichment run is asked to resolve.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnrichmentRequest {
    pub numeric_ids: Vec<String>,
    pub dois: Vec<String>,
    pub titles: Vec<String>,
}

impl EnrichmentRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_numeric_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.numeric_ids = dedupe_preserving_order(ids);
        self
    }

    pub fn with_dois<I, S>(mut self, dois: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.dois = dedupe_preserving_order(dois);
        self
    }

    pub fn with_titles<I, S>(mut self, titles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.titles = dedupe_preserving_order(titles);
        self
    }

    /// Copy with every collection deduplicated in first-seen order.
    pub fn deduplicated(&self) -> Self {
        Self {
            numeric_ids: dedupe_preserving_order(&self.numeric_ids),
            dois: dedupe_preserving_order(&self.dois),
            titles: dedupe_preserving_order(&self.titles),
        }
    }

    pub fn ids_for(&self, kind: IdentifierKind) -> &[String] {
        match kind {
            IdentifierKind::Numeric => &self.numeric_ids,
            IdentifierKind::Doi => &self.dois,
            IdentifierKind::Title => &self.titles,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.numeric_ids.is_empty() && self.dois.is_empty() && self.titles.is_empty()
    }
}

/// Lifecycle of one adapter task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    FallbackAttempted,
    Succeeded,
    Failed,
    TimedOut,
}

/// Outcome of one adapter within one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdapterResult {
    pub source: String,
    pub identifier_kind: IdentifierKind,
    pub records: Vec<Record>,
    pub error: Option<String>,
    pub requested: usize,
    pub matched: usize,
    pub coverage: f64,
    pub missing_ids: Vec<String>,
    pub fallback_attempted: bool,
    pub recovered_ids: Vec<String>,
    pub state: TaskState,
    pub warnings: Vec<String>,
    pub elapsed_ms: u64,
}

impl AdapterResult {
    fn pending(source: &str, kind: IdentifierKind, requested: &[String]) -> Self {
        Self {
            source: source.to_owned(),
            identifier_kind: kind,
            records: Vec::new(),
            error: None,
            requested: requested.len(),
            matched: 0,
            coverage: 0.0,
            missing_ids: requested.to_vec(),
            fallback_attempted: false,
            recovered_ids: Vec::new(),
            state: TaskState::Pending,
            warnings: Vec::new(),
            elapsed_ms: 0,
        }
    }

    fn fail(mut self, state: TaskState, error: String) -> Self {
        self.state = state;
        self.error = Some(error);
        self
    }

    pub fn succeeded(&self) -> bool {
        self.state == TaskState::Succeeded
    }
}

/// Complete output of one orchestrator run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichmentReport {
    pub run_id: Uuid,
    /// RFC 3339 UTC timestamp.
    pub started_at: String,
    pub elapsed_ms: u64,
    pub results: BTreeMap<String, AdapterResult>,
    pub errors: BTreeMap<String, String>,
}

impl EnrichmentReport {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn result(&self, source: &str) -> Option<&AdapterResult> {
        self.results.get(source)
    }

    /// One human-readable line per adapter.
    pub fn summary(&self) -> Vec<String> {
        self.results
            .values()
            .map(|result| match &result.error {
                Some(error) => format!("{}: {:?} ({error})", result.source, result.state),
                None => format!(
                    "{}: {}/{} matched ({:.1}%), {} recovered by fallback",
                    result.source,
                    result.matched,
                    result.requested,
                    result.coverage * 100.0,
                    result.recovered_ids.len()
                ),
            })
            .collect()
    }
}

/// Runs every registered adapter concurrently and aggregates the results.
pub struct EnrichmentOrchestrator {
    config: OrchestratorConfig,
    adapters: BTreeMap<String, Arc<dyn EnrichmentAdapter>>,
}

impl std::fmt::Debug for EnrichmentOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnrichmentOrchestrator")
            .field("config", &self.config)
            .field("adapters", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl EnrichmentOrchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            adapters: BTreeMap::new(),
        }
    }

    /// Registers `adapter` under its name, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn EnrichmentAdapter>) -> &mut Self {
        self.adapters.insert(adapter.name().to_owned(), adapter);
        self
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn EnrichmentAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn adapter_names(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }

    pub const fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn pool_size(&self) -> usize {
        self.config.max_workers.max(1).min(self.adapters.len().max(1))
    }

    /// Never fails as a whole: adapter failures land in `errors`.
    pub async fn run(&self, request: &EnrichmentRequest) -> EnrichmentReport {
        let run_id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();
        let started_at = now
            .format(&Rfc3339)
            .unwrap_or_else(|_| now.unix_timestamp().to_string());
        let started = Instant::now();
        let span = tracing::info_span!("enrichment", %run_id);

        let request = request.deduplicated();
        let semaphore = Arc::new(Semaphore::new(self.pool_size()));
        let task_timeout = self.config.task_timeout();
        let fallback_timeout = self.config.fallback_timeout();

        tracing::info!(
            parent: &span,
            adapters = self.adapters.len(),
            workers = self.pool_size(),
            numeric_ids = request.numeric_ids.len(),
            dois = request.dois.len(),
            titles = request.titles.len(),
            "enrichment started"
        );

        let mut handles = Vec::with_capacity(self.adapters.len());
        for (name, adapter) in &self.adapters {
            let ids = request.ids_for(adapter.identifier_kind()).to_vec();
            let pending = AdapterResult::pending(name, adapter.identifier_kind(), &ids);
            let task = run_adapter(
                Arc::clone(adapter),
                ids,
                Arc::clone(&semaphore),
                task_timeout,
                fallback_timeout,
            )
            .instrument(tracing::info_span!(parent: &span, "adapter", source = %name));
            handles.push((pending, tokio::spawn(task)));
        }

        let mut results = BTreeMap::new();
        let mut errors = BTreeMap::new();
        for (pending, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_error) => {
                    let reason = if join_error.is_panic() {
                        "adapter task panicked"
                    } else {
                        "adapter task was cancelled"
                    };
                    pending.fail(TaskState::Failed, format!("E_UNKNOWN: {reason}"))
                }
            };

            if let Some(error) = &result.error {
                tracing::warn!(parent: &span, source = %result.source, %error, "adapter failed");
                errors.insert(result.source.clone(), error.clone());
            }
            results.insert(result.source.clone(), result);
        }

        let elapsed_ms = duration_ms(started.elapsed());
        tracing::info!(
            parent: &span,
            succeeded = results.len() - errors.len(),
            failed = errors.len(),
            elapsed_ms,
            "enrichment finished"
        );

        EnrichmentReport {
            run_id,
            started_at,
            elapsed_ms,
            results,
            errors,
        }
    }
}

async fn run_adapter(
    adapter: Arc<dyn EnrichmentAdapter>,
    ids: Vec<String>,
    semaphore: Arc<Semaphore>,
    task_timeout: Duration,
    fallback_timeout: Duration,
) -> AdapterResult {
    let mut result = AdapterResult::pending(adapter.name(), adapter.identifier_kind(), &ids);
    // The semaphore is never closed, so acquisition only fails if it were.
    let _permit = semaphore.acquire_owned().await.ok();
    let started = Instant::now();
    result.state = TaskState::Running;

    if ids.is_empty() {
        result.state = TaskState::Succeeded;
        result.missing_ids.clear();
        return result;
    }

    tracing::debug!(ids = ids.len(), "adapter running");
    let fetched = match tokio::time::timeout(task_timeout, adapter.fetch(ids.clone())).await {
        Ok(Ok(batch)) => batch,
        Ok(Err(error)) => {
            result.elapsed_ms = duration_ms(started.elapsed());
            return result.fail(TaskState::Failed, error.to_string());
        }
        Err(_) => {
            result.elapsed_ms = duration_ms(started.elapsed());
            return result.fail(
                TaskState::TimedOut,
                format!(
                    "E_TIMEOUT: adapter '{}' did not finish within {task_timeout:?}",
                    adapter.name()
                ),
            );
        }
    };

    result.records = fetched.records;
    result.warnings = fetched.warnings;
    apply_coverage(&mut result, adapter.as_ref(), &ids);

    if !result.missing_ids.is_empty() && adapter.has_fallback() {
        result.state = TaskState::FallbackAttempted;
        result.fallback_attempted = true;
        let missing_before = result.missing_ids.clone();
        tracing::debug!(missing = missing_before.len(), "running fallback");

        match tokio::time::timeout(fallback_timeout, adapter.fallback(missing_before.clone())).await
        {
            Ok(Ok(batch)) => {
                merge_unique(&mut result.records, batch.records);
                result.warnings.extend(batch.warnings);
                apply_coverage(&mut result, adapter.as_ref(), &ids);
                let still_missing = result.missing_ids.iter().collect::<HashSet<_>>();
                result.recovered_ids = missing_before
                    .into_iter()
                    .filter(|id| !still_missing.contains(id))
                    .collect();
            }
            Ok(Err(error)) => result.warnings.push(format!("fallback failed: {error}")),
            Err(_) => result
                .warnings
                .push(format!("fallback timed out after {fallback_timeout:?}")),
        }
    }

    result.state = TaskState::Succeeded;
    result.elapsed_ms = duration_ms(started.elapsed());
    tracing::debug!(
        matched = result.matched,
        requested = result.requested,
        recovered = result.recovered_ids.len(),
        "adapter finished"
    );
    result
}

/// Recomputes `matched`, `missing_ids` and `coverage` from the current records.
///
/// Requested ids that normalize to the same value count once; ids with no
/// normalized form can never match.
fn apply_coverage(result: &mut AdapterResult, adapter: &dyn EnrichmentAdapter, requested: &[String]) {
    let fields = adapter.match_fields();
    let found = result
        .records
        .iter()
        .flat_map(|record| identifier_values(record, &fields))
        .filter_map(|value| adapter.normalize(&value))
        .collect::<HashSet<_>>();

    let mut seen = HashSet::new();
    let mut distinct = 0;
    let mut matched = 0;
    let mut missing = Vec::new();
    for raw in requested {
        match adapter.normalize(raw) {
            Some(key) => {
                if !seen.insert(key.clone()) {
                    continue;
                }
                distinct += 1;
                if found.contains(&key) {
                    matched += 1;
                } else {
                    missing.push(raw.clone());
                }
            }
            None => {
                distinct += 1;
                missing.push(raw.clone());
            }
        }
    }

    result.requested = distinct;
    result.matched = matched;
    result.missing_ids = missing;
    result.coverage = if distinct == 0 {
        0.0
    } else {
        matched as f64 / distinct as f64
    };
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterBatch, AdapterFuture};
    use crate::error::ApiError;
    use serde_json::json;

    struct StaticAdapter {
        name: &'static str,
        kind: IdentifierKind,
        records: Vec<Record>,
        fallback: Option<Vec<Record>>,
    }

    impl EnrichmentAdapter for StaticAdapter {
        fn name(&self) -> &str {
            self.name
        }

        fn identifier_kind(&self) -> IdentifierKind {
            self.kind
        }

        fn fetch<'a>(&'a self, _ids: Vec<String>) -> AdapterFuture<'a> {
            Box::pin(async move { Ok(AdapterBatch::new(self.records.clone())) })
        }

        fn has_fallback(&self) -> bool {
            self.fallback.is_some()
        }

        fn fallback<'a>(&'a self, _missing_ids: Vec<String>) -> AdapterFuture<'a> {
            Box::pin(async move { Ok(AdapterBatch::new(self.fallback.clone().unwrap_or_default())) })
        }
    }

    struct FailingAdapter;

    impl EnrichmentAdapter for FailingAdapter {
        fn name(&self) -> &str {
            "broken"
        }

        fn identifier_kind(&self) -> IdentifierKind {
            IdentifierKind::Numeric
        }

        fn fetch<'a>(&'a self, _ids: Vec<String>) -> AdapterFuture<'a> {
            Box::pin(async { Err(ApiError::http(500, "upstream exploded")) })
        }
    }

    fn record(value: serde_json::Value) -> Record {
        value.as_object().cloned().expect("object literal")
    }

    #[test]
    fn request_builders_deduplicate() {
        let request = EnrichmentRequest::new()
            .with_numeric_ids(["1", "2", "1", " "])
            .with_dois(["10.1/a", "10.1/a"]);

        assert_eq!(request.numeric_ids, vec!["1", "2"]);
        assert_eq!(request.ids_for(IdentifierKind::Doi), ["10.1/a"]);
        assert!(request.ids_for(IdentifierKind::Title).is_empty());
    }

    #[test]
    fn pool_is_bounded_by_workers_and_adapters() {
        let orchestrator = EnrichmentOrchestrator::new(OrchestratorConfig::default())
            .with_adapter(Arc::new(FailingAdapter));
        assert_eq!(orchestrator.pool_size(), 1);

        let empty = EnrichmentOrchestrator::new(OrchestratorConfig::default());
        assert_eq!(empty.pool_size(), 1);
    }

    #[test]
    fn coverage_counts_normalized_matches() {
        let adapter = StaticAdapter {
            name: "docs",
            kind: IdentifierKind::Doi,
            records: Vec::new(),
            fallback: None,
        };
        let requested = vec![
            String::from("doi:10.1/A"),
            String::from("10.1/a"),
            String::from("10.1/b"),
        ];
        let mut result = AdapterResult::pending("docs", IdentifierKind::Doi, &requested);
        result.records = vec![record(json!({"doi": "https://doi.org/10.1/A"}))];

        apply_coverage(&mut result, &adapter, &requested);
        assert_eq!(result.requested, 2);
        assert_eq!(result.matched, 1);
        assert_eq!(result.missing_ids, vec!["10.1/b"]);
        assert!((result.coverage - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn failing_adapter_is_isolated() {
        let orchestrator = EnrichmentOrchestrator::new(OrchestratorConfig::default())
            .with_adapter(Arc::new(FailingAdapter))
            .with_adapter(Arc::new(StaticAdapter {
                name: "good",
                kind: IdentifierKind::Numeric,
                records: vec![record(json!({"pmid": 1}))],
                fallback: None,
            }));

        let report = orchestrator
            .run(&EnrichmentRequest::new().with_numeric_ids(["1"]))
            .await;

        assert_eq!(report.errors.len(), 1);
        assert!(report.errors["broken"].starts_with("E_HTTP_5XX"));
        let good = report.result("good").expect("good result");
        assert!(good.succeeded());
        assert_eq!(good.matched, 1);
        assert_eq!(report.summary().len(), 2);
    }

    #[tokio::test]
    async fn adapters_without_ids_succeed_with_zero_coverage() {
        let orchestrator = EnrichmentOrchestrator::new(OrchestratorConfig::default()).with_adapter(
            Arc::new(StaticAdapter {
                name: "titles",
                kind: IdentifierKind::Title,
                records: Vec::new(),
                fallback: None,
            }),
        );

        let report = orchestrator
            .run(&EnrichmentRequest::new().with_numeric_ids(["1"]))
            .await;
        let result = report.result("titles").expect("result");
        assert_eq!(result.state, TaskState::Succeeded);
        assert_eq!(result.requested, 0);
        assert_eq!(result.coverage, 0.0);
    }
}
