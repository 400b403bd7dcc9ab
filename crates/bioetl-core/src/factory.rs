//! Builds configured clients, fetchers and adapters per named source.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::adapter::{BatchAdapter, EnrichmentAdapter};
use crate::batch::AdaptiveBatchFetcher;
use crate::cache::ResponseCache;
use crate::client::ApiClient;
use crate::config::{BatchSettings, ClientConfig, PipelineConfig};
use crate::error::ConfigError;
use crate::http_client::{HttpClient, ReqwestHttpClient, TransportSettings};
use crate::orchestrator::EnrichmentOrchestrator;

/// Owns the run-scoped client and cache instances for every source.
///
/// Clients are memoized, so every fetcher of one source shares the same
/// circuit breaker and token bucket.
pub struct ApiClientFactory {
    config: PipelineConfig,
    transport: Option<Arc<dyn HttpClient>>,
    clients: Mutex<HashMap<String, Arc<ApiClient>>>,
    caches: Mutex<HashMap<String, ResponseCache>>,
}

impl std::fmt::Debug for ApiClientFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClientFactory")
            .field("sources", &self.config.sources.keys().collect::<Vec<_>>())
            .field("shared_transport", &self.transport.is_some())
            .finish_non_exhaustive()
    }
}

impl ApiClientFactory {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            transport: None,
            clients: Mutex::new(HashMap::new()),
            caches: Mutex::new(HashMap::new()),
        }
    }

    /// Routes every client through `transport` instead of building reqwest clients.
    pub fn with_transport(mut self, transport: Arc<dyn HttpClient>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn client_config(&self, name: &str) -> Result<ClientConfig, ConfigError> {
        self.config.resolve_client(name)
    }

    pub fn client(&self, name: &str) -> Result<Arc<ApiClient>, ConfigError> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(name) {
            return Ok(Arc::clone(client));
        }

        let config = self.client_config(name)?;
        let transport = match &self.transport {
            Some(transport) => Arc::clone(transport),
            None => Arc::new(build_transport(&config)?),
        };
        let client = Arc::new(ApiClient::new(config, transport)?);
        tracing::debug!(source = name, "built api client");
        clients.insert(name.to_owned(), Arc::clone(&client));
        Ok(client)
    }

    /// Cache shared by every fetcher of `name`.
    pub fn cache(&self, name: &str) -> Result<ResponseCache, ConfigError> {
        let mut caches = self.caches.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cache) = caches.get(name) {
            return Ok(cache.clone());
        }

        let cache = ResponseCache::new(self.client_config(name)?.cache);
        caches.insert(name.to_owned(), cache.clone());
        Ok(cache)
    }

    pub fn fetcher(
        &self,
        name: &str,
        settings: BatchSettings,
    ) -> Result<AdaptiveBatchFetcher, ConfigError> {
        if settings.id_param.trim().is_empty() {
            return Err(ConfigError::invalid(name, "batch id_param must not be empty"));
        }
        Ok(AdaptiveBatchFetcher::new(
            self.client(name)?,
            self.cache(name)?,
            settings,
        ))
    }

    pub fn adapter(&self, name: &str) -> Result<BatchAdapter, ConfigError> {
        let source = self.config.source(name)?;
        let batch = source
            .batch
            .clone()
            .ok_or_else(|| ConfigError::invalid(name, "missing 'batch' block"))?;
        let identifier = source
            .identifier
            .clone()
            .ok_or_else(|| ConfigError::invalid(name, "missing 'identifier' block"))?;

        let mut adapter = BatchAdapter::new(name, identifier, self.fetcher(name, batch)?);
        if let Some(fallback) = source.fallback.clone() {
            adapter = adapter.with_fallback(self.fetcher(name, fallback)?);
        }
        Ok(adapter)
    }

    /// Adapters for every enabled source that declares a batch endpoint.
    pub fn adapters(&self) -> Result<Vec<Arc<dyn EnrichmentAdapter>>, ConfigError> {
        self.config
            .enabled_sources()
            .filter(|(_, source)| source.batch.is_some())
            .map(|(name, _)| {
                self.adapter(name)
                    .map(|adapter| Arc::new(adapter) as Arc<dyn EnrichmentAdapter>)
            })
            .collect()
    }

    pub fn orchestrator(&self) -> Result<EnrichmentOrchestrator, ConfigError> {
        let mut orchestrator = EnrichmentOrchestrator::new(self.config.orchestrator.clone());
        for adapter in self.adapters()? {
            orchestrator.register(adapter);
        }
        Ok(orchestrator)
    }
}

fn build_transport(config: &ClientConfig) -> Result<ReqwestHttpClient, ConfigError> {
    let settings = TransportSettings {
        connect_timeout: config.connect_timeout,
        read_timeout: config.read_timeout,
        user_agent: config.user_agent.clone(),
    };
    ReqwestHttpClient::from_settings(&settings).map_err(|error| ConfigError::Transport {
        source_name: config.name.clone(),
        message: error.to_string(),
    })
}
