use std::collections::BTreeMap;

use bioetl_core::{CachePolicy, ClientConfig, IdentifierKind, PipelineConfig};
use serde::Serialize;

use crate::cli::SourcesArgs;
use crate::error::CliError;

use super::{load_config, CommandOutput};

#[derive(Debug, Serialize)]
struct SourceView {
    name: String,
    enabled: bool,
    base_url: String,
    timeout_ms: u128,
    connect_timeout_ms: u128,
    read_timeout_ms: u128,
    user_agent: String,
    headers: BTreeMap<String, String>,
    max_attempts: u32,
    rate_limit_capacity: u32,
    rate_limit_refill_per_sec: f64,
    breaker_failure_threshold: u32,
    breaker_cool_down_ms: u128,
    cache: CachePolicy,
    max_batch_size: usize,
    max_url_length: usize,
    batch_endpoint: Option<String>,
    identifier_kind: Option<IdentifierKind>,
    has_fallback: bool,
}

pub fn run(args: &SourcesArgs) -> Result<CommandOutput, CliError> {
    let config = load_config(&args.config)?;
    let views = describe_sources(&config)?;
    Ok(CommandOutput::ok(serde_json::to_value(views)?))
}

fn describe_sources(config: &PipelineConfig) -> Result<Vec<SourceView>, CliError> {
    config
        .sources
        .iter()
        .map(|(name, source)| {
            let client = config.resolve_client(name)?;
            Ok(SourceView {
                name: name.clone(),
                enabled: source.enabled,
                headers: redact_headers(&client),
                base_url: client.base_url,
                timeout_ms: client.timeout.as_millis(),
                connect_timeout_ms: client.connect_timeout.as_millis(),
                read_timeout_ms: client.read_timeout.as_millis(),
                user_agent: client.user_agent,
                max_attempts: client.retry.max_attempts(),
                rate_limit_capacity: client.rate_limit.capacity,
                rate_limit_refill_per_sec: client.rate_limit.refill_rate,
                breaker_failure_threshold: client.circuit_breaker.failure_threshold,
                breaker_cool_down_ms: client.circuit_breaker.cool_down.as_millis(),
                cache: client.cache,
                max_batch_size: client.max_batch_size,
                max_url_length: client.max_url_length,
                batch_endpoint: source.batch.as_ref().map(|batch| batch.endpoint.clone()),
                identifier_kind: source.identifier.as_ref().map(|identifier| identifier.kind),
                has_fallback: source.fallback.is_some(),
            })
        })
        .collect()
}

/// Environment references are shown as-is; literal values never are.
fn redact_headers(client: &ClientConfig) -> BTreeMap<String, String> {
    client
        .headers
        .iter()
        .map(|(name, value)| {
            let shown = if value.starts_with("env:") {
                value.clone()
            } else {
                String::from("<redacted>")
            };
            (name.clone(), shown)
        })
        .collect()
}
