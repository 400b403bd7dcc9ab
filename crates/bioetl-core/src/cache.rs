//! Run-scoped, release-keyed memo of fetched entities.
//!
//! Entries are keyed by `(release_tag, entity_id)`, so a new upstream release
//! never serves records cached for an older one. Within a run an entry is
//! written once: concurrent writers for the same live key keep the first value.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::config::CachePolicy;
use crate::record::Record;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    release_tag: String,
    entity_id: String,
}

impl CacheKey {
    fn new(release_tag: &str, entity_id: &str) -> Self {
        Self {
            release_tag: release_tag.to_owned(),
            entity_id: entity_id.to_owned(),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    record: Record,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |expires_at| now < expires_at)
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    map: HashMap<CacheKey, CacheEntry>,
    hits: u64,
    misses: u64,
}

/// Hit/miss counters for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Thread-safe response cache shared by every fetcher of a run.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    policy: CachePolicy,
    inner: Arc<RwLock<CacheInner>>,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(CachePolicy::default())
    }
}

impl ResponseCache {
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            policy,
            inner: Arc::new(RwLock::new(CacheInner::default())),
        }
    }

    pub fn disabled() -> Self {
        Self::new(CachePolicy {
            enabled: false,
            ttl: None,
            maxsize: None,
        })
    }

    pub const fn policy(&self) -> CachePolicy {
        self.policy
    }

    pub const fn is_enabled(&self) -> bool {
        self.policy.enabled
    }

    pub async fn get(&self, release_tag: &str, entity_id: &str) -> Option<Record> {
        if !self.policy.enabled {
            return None;
        }

        let key = CacheKey::new(release_tag, entity_id);
        let mut inner = self.inner.write().await;
        let found = inner
            .map
            .get(&key)
            .filter(|entry| entry.is_live(Instant::now()))
            .map(|entry| entry.record.clone());

        if found.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        found
    }

    /// Stores `record` unless a live entry already exists; returns the value
    /// now held for the key. Once `maxsize` is reached new keys are not stored.
    pub async fn insert(&self, release_tag: &str, entity_id: &str, record: Record) -> Record {
        if !self.policy.enabled {
            return record;
        }

        let key = CacheKey::new(release_tag, entity_id);
        let now = Instant::now();
        let mut inner = self.inner.write().await;

        if let Some(existing) = inner.map.get(&key).filter(|entry| entry.is_live(now)) {
            return existing.record.clone();
        }

        // Expired entries leave room before the size check.
        inner.map.remove(&key);
        if self
            .policy
            .maxsize
            .is_some_and(|maxsize| inner.map.len() >= maxsize)
        {
            return record;
        }

        inner.map.insert(
            key,
            CacheEntry {
                record: record.clone(),
                expires_at: self.policy.ttl.map(|ttl| now + ttl),
            },
        );
        record
    }

    /// Read-through lookup: a miss runs `fetch` and stores its value.
    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        release_tag: &str,
        entity_id: &str,
        fetch: F,
    ) -> Result<Record, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Record, E>>,
    {
        if let Some(record) = self.get(release_tag, entity_id).await {
            return Ok(record);
        }

        let record = fetch().await?;
        Ok(self.insert(release_tag, entity_id, record).await)
    }

    /// Test/reset hook.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        *inner = CacheInner::default();
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.map.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.read().await;
        CacheStats {
            entries: inner.map.len(),
            hits: inner.hits,
            misses: inner.misses,
        }
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.policy.ttl
    }
}
