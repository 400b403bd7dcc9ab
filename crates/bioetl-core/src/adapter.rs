//! Uniform adapter contract consumed by the enrichment orchestrator.
//!
//! An adapter exposes one bulk `fetch` operation and, optionally, one
//! `fallback(missing_ids)` entry point. Both share the same signature so the
//! orchestrator never has to know which upstream source it is driving.

use std::future::Future;
use std::pin::Pin;

use crate::batch::{AdaptiveBatchFetcher, FetchOutcome};
use crate::config::IdentifierSettings;
use crate::error::ApiError;
use crate::identifier::IdentifierKind;
use crate::record::Record;

/// Records returned by one adapter call, with non-fatal problems noted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdapterBatch {
    pub records: Vec<Record>,
    pub warnings: Vec<String>,
}

impl AdapterBatch {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records,
            warnings: Vec::new(),
        }
    }
}

impl From<Vec<Record>> for AdapterBatch {
    fn from(records: Vec<Record>) -> Self {
        Self::new(records)
    }
}

pub type AdapterFuture<'a> = Pin<Box<dyn Future<Output = Result<AdapterBatch, ApiError>> + Send + 'a>>;

/// One external source as seen by the orchestrator.
pub trait EnrichmentAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Which request identifier collection this adapter consumes.
    fn identifier_kind(&self) -> IdentifierKind;

    /// Record fields examined when computing coverage.
    fn match_fields(&self) -> Vec<String> {
        self.identifier_kind()
            .default_match_fields()
            .iter()
            .map(|field| (*field).to_owned())
            .collect()
    }

    fn normalize(&self, raw: &str) -> Option<String> {
        self.identifier_kind().normalize(raw)
    }

    /// Bulk lookup for `ids`. An `Err` marks the whole adapter as failed.
    fn fetch<'a>(&'a self, ids: Vec<String>) -> AdapterFuture<'a>;

    fn has_fallback(&self) -> bool {
        false
    }

    /// Second chance for ids the primary lookup did not resolve.
    fn fallback<'a>(&'a self, missing_ids: Vec<String>) -> AdapterFuture<'a> {
        let _ = missing_ids;
        Box::pin(async { Ok(AdapterBatch::default()) })
    }
}

/// Adapter backed by configured batch endpoints.
#[derive(Debug, Clone)]
pub struct BatchAdapter {
    name: String,
    identifier: IdentifierSettings,
    fetcher: AdaptiveBatchFetcher,
    fallback: Option<AdaptiveBatchFetcher>,
}

impl BatchAdapter {
    pub fn new(
        name: impl Into<String>,
        identifier: IdentifierSettings,
        fetcher: AdaptiveBatchFetcher,
    ) -> Self {
        Self {
            name: name.into(),
            identifier,
            fetcher,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: AdaptiveBatchFetcher) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub const fn fetcher(&self) -> &AdaptiveBatchFetcher {
        &self.fetcher
    }
}

impl EnrichmentAdapter for BatchAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn identifier_kind(&self) -> IdentifierKind {
        self.identifier.kind
    }

    fn match_fields(&self) -> Vec<String> {
        if self.identifier.match_fields.is_empty() {
            return self
                .identifier
                .kind
                .default_match_fields()
                .iter()
                .map(|field| (*field).to_owned())
                .collect();
        }
        self.identifier.match_fields.clone()
    }

    fn fetch<'a>(&'a self, ids: Vec<String>) -> AdapterFuture<'a> {
        Box::pin(async move { into_adapter_batch(self.fetcher.fetch_detailed(&ids).await) })
    }

    fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    fn fallback<'a>(&'a self, missing_ids: Vec<String>) -> AdapterFuture<'a> {
        Box::pin(async move {
            match &self.fallback {
                Some(fetcher) => into_adapter_batch(fetcher.fetch_detailed(&missing_ids).await),
                None => Ok(AdapterBatch::default()),
            }
        })
    }
}

/// Partial failures become warnings; only a fully failed lookup is an error.
fn into_adapter_batch(outcome: FetchOutcome) -> Result<AdapterBatch, ApiError> {
    let FetchOutcome {
        records, failures, ..
    } = outcome;

    if records.is_empty() {
        if let Some(failure) = failures.last() {
            return Err(failure.error.clone());
        }
    }

    let warnings = failures
        .iter()
        .map(|failure| {
            format!(
                "{} id(s) unresolved after splitting: {}",
                failure.ids.len(),
                failure.error
            )
        })
        .collect();

    Ok(AdapterBatch { records, warnings })
}
