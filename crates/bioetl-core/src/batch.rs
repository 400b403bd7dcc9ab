//! Bulk identifier lookups with adaptive batch splitting.
//!
//! Oversized batches (too many ids or too long a URL) are halved before they
//! are sent; a batch that times out, hits an open breaker or is rejected as too
//! large is halved after the fact. Splitting runs on an explicit work stack, so
//! depth is bounded by `log2(len)` and no recursion is involved.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::cache::ResponseCache;
use crate::client::ApiClient;
use crate::config::BatchSettings;
use crate::error::{ApiError, ApiErrorKind};
use crate::identifier::dedupe_preserving_order;
use crate::record::{records_at, scalar_field, Record};

/// One unit of work: an ordered slice of entity ids and the limits it must fit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRequest {
    ids: Vec<String>,
    max_batch_size: usize,
    max_url_length: usize,
}

impl BatchRequest {
    pub fn new(ids: Vec<String>, max_batch_size: usize, max_url_length: usize) -> Self {
        Self {
            ids,
            max_batch_size: max_batch_size.max(1),
            max_url_length,
        }
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Whether this batch must be halved before it is sent.
    pub fn exceeds_limits(&self, url_length: usize) -> bool {
        self.ids.len() > self.max_batch_size
            || (self.ids.len() > 1 && url_length > self.max_url_length)
    }

    /// Halves the batch at its midpoint, preserving id order.
    pub fn split(self) -> (Self, Self) {
        let Self {
            mut ids,
            max_batch_size,
            max_url_length,
        } = self;
        let right = ids.split_off(ids.len() / 2);
        (
            Self::new(ids, max_batch_size, max_url_length),
            Self::new(right, max_batch_size, max_url_length),
        )
    }
}

/// A sub-batch that could not be narrowed any further.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub ids: Vec<String>,
    pub error: ApiError,
}

/// Detailed result of one [`AdaptiveBatchFetcher::fetch_detailed`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchOutcome {
    /// Records in input id order, cache hits included, without duplicates.
    pub records: Vec<Record>,
    pub failures: Vec<BatchFailure>,
    pub requests_sent: usize,
    pub cache_hits: usize,
    /// Deepest split level reached.
    pub max_depth: u32,
}

impl FetchOutcome {
    pub fn failed_ids(&self) -> impl Iterator<Item = &String> {
        self.failures.iter().flat_map(|failure| failure.ids.iter())
    }
}

/// Executes bulk lookups for one endpoint through an [`ApiClient`].
#[derive(Debug, Clone)]
pub struct AdaptiveBatchFetcher {
    client: Arc<ApiClient>,
    cache: ResponseCache,
    settings: BatchSettings,
}

impl AdaptiveBatchFetcher {
    pub fn new(client: Arc<ApiClient>, cache: ResponseCache, settings: BatchSettings) -> Self {
        Self {
            client,
            cache,
            settings,
        }
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    pub const fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    pub fn release_tag(&self) -> &str {
        &self.settings.release_tag
    }

    fn params_for(&self, ids: &[String]) -> Vec<(String, String)> {
        let mut params = self
            .settings
            .params
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect::<Vec<_>>();
        params.push((
            self.settings.id_param.clone(),
            ids.join(&self.settings.id_separator),
        ));
        params
    }

    /// URL that a batch with `ids` would be sent to.
    pub fn url_for(&self, ids: &[String]) -> String {
        self.client
            .build_url(&self.settings.endpoint, &self.params_for(ids))
    }

    /// Fetches records for `ids`, failing only when every outstanding id failed.
    pub async fn fetch(&self, ids: &[String]) -> Result<Vec<Record>, ApiError> {
        let outcome = self.fetch_detailed(ids).await;
        if outcome.records.is_empty() {
            if let Some(failure) = outcome.failures.into_iter().last() {
                return Err(failure.error);
            }
        }
        Ok(outcome.records)
    }

    pub async fn fetch_detailed(&self, ids: &[String]) -> FetchOutcome {
        let ids = dedupe_preserving_order(ids);
        let mut outcome = FetchOutcome::default();
        if ids.is_empty() {
            return outcome;
        }

        let release_tag = self.settings.release_tag.as_str();
        let mut cached = HashMap::new();
        let mut outstanding = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.cache.get(release_tag, id).await {
                Some(record) => {
                    cached.insert(id.clone(), record);
                }
                None => outstanding.push(id.clone()),
            }
        }
        outcome.cache_hits = cached.len();

        let config = self.client.config();
        let mut fetched = Vec::new();
        let mut stack = vec![(
            BatchRequest::new(outstanding, config.max_batch_size, config.max_url_length),
            0_u32,
        )];

        while let Some((batch, depth)) = stack.pop() {
            if batch.is_empty() {
                continue;
            }
            outcome.max_depth = outcome.max_depth.max(depth);

            let url_length = self.url_for(batch.ids()).len();
            if batch.exceeds_limits(url_length) {
                push_halves(&mut stack, batch, depth);
                continue;
            }
            if batch.len() == 1 && url_length > config.max_url_length {
                tracing::warn!(
                    client = %self.client.name(),
                    id = %batch.ids()[0],
                    url_length,
                    max_url_length = config.max_url_length,
                    "single-id url exceeds limit, sending anyway"
                );
            }

            outcome.requests_sent += 1;
            let result = self
                .client
                .get(&self.settings.endpoint, &self.params_for(batch.ids()))
                .await
                .and_then(|response| response.json());

            match result {
                Ok(body) => {
                    fetched.extend(records_at(&body, self.settings.records_pointer.as_deref()));
                }
                Err(error) if batch.len() > 1 && splits_on(&error) => {
                    tracing::warn!(
                        client = %self.client.name(),
                        code = error.code(),
                        batch_size = batch.len(),
                        depth,
                        "batch failed, splitting"
                    );
                    push_halves(&mut stack, batch, depth);
                }
                Err(error) => {
                    outcome.failures.push(BatchFailure {
                        ids: batch.ids().to_vec(),
                        error,
                    });
                }
            }
        }

        outcome.records = self.assemble(&ids, cached, fetched).await;
        outcome
    }

    /// Orders records by input id, writes fresh ones to the cache and drops duplicates.
    async fn assemble(
        &self,
        ids: &[String],
        mut cached: HashMap<String, Record>,
        fetched: Vec<Record>,
    ) -> Vec<Record> {
        let release_tag = self.settings.release_tag.as_str();
        let requested = ids.iter().map(String::as_str).collect::<HashSet<_>>();
        let mut by_id: HashMap<String, Vec<Record>> = HashMap::new();
        let mut unkeyed = Vec::new();

        for record in fetched {
            let key = self
                .settings
                .id_field
                .as_deref()
                .and_then(|field| scalar_field(&record, field));
            match key {
                Some(key) => {
                    let record = self.cache.insert(release_tag, &key, record).await;
                    if requested.contains(key.as_str()) {
                        by_id.entry(key).or_default().push(record);
                    } else {
                        unkeyed.push(record);
                    }
                }
                None => unkeyed.push(record),
            }
        }

        let mut seen = HashSet::new();
        let mut records = Vec::new();
        let mut push_unique = |record: Record| {
            let fingerprint = serde_json::to_string(&record).unwrap_or_default();
            if seen.insert(fingerprint) {
                records.push(record);
            }
        };

        for id in ids {
            if let Some(record) = cached.remove(id) {
                push_unique(record);
            }
            for record in by_id.remove(id).unwrap_or_default() {
                push_unique(record);
            }
        }
        for record in unkeyed {
            push_unique(record);
        }

        records
    }
}

fn push_halves(stack: &mut Vec<(BatchRequest, u32)>, batch: BatchRequest, depth: u32) {
    let (left, right) = batch.split();
    // LIFO: push right first so the left half is processed first.
    stack.push((right, depth + 1));
    stack.push((left, depth + 1));
}

fn splits_on(error: &ApiError) -> bool {
    matches!(error.kind(), ApiErrorKind::Timeout | ApiErrorKind::CircuitOpen)
        || matches!(error.http_status(), Some(413 | 414))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| i.to_string()).collect()
    }

    #[test]
    fn split_halves_at_midpoint_preserving_order() {
        let batch = BatchRequest::new(ids(5), 2, 1000);
        let (left, right) = batch.split();

        assert_eq!(left.ids(), ["0", "1"]);
        assert_eq!(right.ids(), ["2", "3", "4"]);
    }

    #[test]
    fn limits_consider_size_and_url_length() {
        let batch = BatchRequest::new(ids(3), 2, 100);
        assert!(batch.exceeds_limits(10));

        let batch = BatchRequest::new(ids(2), 2, 100);
        assert!(!batch.exceeds_limits(100));
        assert!(batch.exceeds_limits(101));

        let single = BatchRequest::new(ids(1), 1, 10);
        assert!(!single.exceeds_limits(500), "a singleton cannot be split further");
    }

    #[test]
    fn split_only_on_size_related_failures() {
        assert!(splits_on(&ApiError::timeout("slow")));
        assert!(splits_on(&ApiError::circuit_open("x")));
        assert!(splits_on(&ApiError::http(414, "uri too long")));
        assert!(!splits_on(&ApiError::http(404, "missing")));
        assert!(!splits_on(&ApiError::http(500, "boom")));
    }
}
