//! Behavior-driven tests for configuration loading and client construction.
//!
//! These tests verify HOW YAML files on disk become resolved per-source
//! clients: layering, validation and header resolution.

use bioetl_core::{ApiClientFactory, ConfigError, FnHttpClient, HttpResponse, PipelineConfig};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

fn write_config(yaml: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(yaml.as_bytes()).expect("write yaml");
    file
}

fn load(file: &tempfile::NamedTempFile) -> Result<PipelineConfig, ConfigError> {
    let yaml = std::fs::read_to_string(file.path()).expect("readable temp file");
    PipelineConfig::from_yaml_str(&yaml)
}

const PIPELINE_YAML: &str = r#"
http:
  timeout_sec: 20
  connect_timeout_sec: 4
  headers:
    accept: application/json
  retries: { total: 4, backoff_multiplier: 1.5 }
  rate_limit: { max_calls: 5, period: 1 }
  cache: { enabled: true, ttl: 3600, maxsize: 10000 }
sources:
  chembl:
    base_url: https://chembl.example.test/api/data/
    timeout_sec: 60
    max_batch_size: 25
    max_url_length: 1500
    rate_limit: { max_calls: 2 }
    headers:
      accept: application/xml
      x-client: bioetl
    circuit_breaker: { failure_threshold: 2, cool_down_sec: 15 }
    batch:
      endpoint: activity.json
      id_param: document_chembl_id__in
      records_pointer: /activities
      id_field: document_chembl_id
      release_tag: chembl_34
    identifier: { kind: numeric, match_fields: [document_chembl_id] }
  semantic_scholar:
    base_url: https://s2.example.test/graph/v1
    enabled: false
    cache: { enabled: false }
    batch: { endpoint: paper/batch }
    identifier: { kind: title }
"#;

#[test]
fn when_source_overrides_globals_only_named_fields_change() {
    // Given: A pipeline file with global defaults and a chembl override block
    let file = write_config(PIPELINE_YAML);

    // When: The chembl client configuration is resolved
    let config = load(&file).expect("valid file");
    let chembl = config.resolve_client("chembl").expect("resolves");

    // Then: Source values win field by field, everything else is inherited
    assert_eq!(chembl.base_url, "https://chembl.example.test/api/data");
    assert_eq!(chembl.timeout, Duration::from_secs(60));
    assert_eq!(chembl.connect_timeout, Duration::from_secs(4));
    assert_eq!(chembl.retry.total, 4);
    assert_eq!(chembl.rate_limit.capacity, 2);
    assert_eq!(chembl.max_batch_size, 25);
    assert_eq!(chembl.max_url_length, 1500);
    assert_eq!(chembl.circuit_breaker.failure_threshold, 2);
    assert_eq!(chembl.circuit_breaker.cool_down, Duration::from_secs(15));
    assert_eq!(chembl.cache.ttl, Some(Duration::from_secs(3600)));
    assert_eq!(chembl.cache.maxsize, Some(10_000));
    assert_eq!(chembl.headers["accept"], "application/xml");
    assert_eq!(chembl.headers["x-client"], "bioetl");
}

#[test]
fn when_source_disables_cache_global_cache_settings_do_not_apply() {
    // Given: A disabled source that also turns its cache off
    let config = load(&write_config(PIPELINE_YAML)).expect("valid file");

    // When: Its client configuration is resolved
    let s2 = config.resolve_client("semantic_scholar").expect("resolves");

    // Then: The cache is off but the global ttl is still inherited
    assert!(!s2.cache.enabled);
    assert_eq!(s2.cache.ttl, Some(Duration::from_secs(3600)));
    assert_eq!(s2.timeout, Duration::from_secs(20));
}

#[test]
fn when_factory_builds_adapters_disabled_sources_are_skipped() {
    // Given: A factory over the pipeline file with an offline transport
    let config = load(&write_config(PIPELINE_YAML)).expect("valid file");
    let factory = ApiClientFactory::new(config)
        .with_transport(Arc::new(FnHttpClient::new(|_| Ok(HttpResponse::ok_json("{}")))));

    // When: Adapters are built
    let adapters = factory.adapters().expect("adapters");

    // Then: Only the enabled source is present, with its configured match fields
    assert_eq!(adapters.len(), 1);
    assert_eq!(adapters[0].name(), "chembl");
    assert_eq!(adapters[0].match_fields(), vec!["document_chembl_id"]);
    assert!(!adapters[0].has_fallback());
}

#[test]
fn when_yaml_is_malformed_loading_fails_with_yaml_error() {
    // Given: A file that is not valid pipeline YAML
    let file = write_config("sources: [this, is, not, a, map]\n");

    // When: It is loaded
    let error = load(&file).expect_err("invalid structure");

    // Then: The error is a YAML error with a readable message
    assert!(matches!(error, ConfigError::Yaml(_)));
    assert!(error.to_string().starts_with("invalid yaml configuration"));
}

#[test]
fn when_values_are_out_of_range_resolution_names_the_field() {
    // Given: A source with a zero rate limit
    let file = write_config(
        r#"
sources:
  broken:
    base_url: https://broken.example.test
    rate_limit: { max_calls: 0 }
"#,
    );
    let config = load(&file).expect("parses");

    // When: The client is resolved
    let error = config.resolve_client("broken").expect_err("invalid");

    // Then: The message points at the offending field and source
    let message = error.to_string();
    assert!(message.contains("broken"));
    assert!(message.contains("rate_limit.max_calls"));
}

#[test]
fn when_header_references_environment_client_build_resolves_it() {
    // Given: A header pointing at an environment variable
    std::env::set_var("BIOETL_CONFIG_TEST_TOKEN_41C", "s3cret");
    let file = write_config(
        r#"
sources:
  pubchem:
    base_url: https://pubchem.example.test
    headers:
      Authorization: "env:BIOETL_CONFIG_TEST_TOKEN_41C"
      X-Missing: "env:BIOETL_CONFIG_TEST_UNSET_41C"
"#,
    );
    let config = load(&file).expect("parses");
    let mut client_config = config.resolve_client("pubchem").expect("resolves");

    // When: The headers are resolved with one variable unset
    let missing = client_config.resolved_headers().expect_err("unset variable");

    // Then: The unset variable is named, and the set one resolves once removed
    assert!(matches!(
        missing,
        ConfigError::MissingEnv { ref var, .. } if var == "BIOETL_CONFIG_TEST_UNSET_41C"
    ));
    client_config.headers.remove("X-Missing");
    let headers = client_config.resolved_headers().expect("resolves");
    assert_eq!(headers["authorization"], "s3cret");
}

#[test]
fn when_client_is_requested_for_unknown_source_factory_reports_it() {
    // Given: A factory over a config without the requested source
    let config = load(&write_config(PIPELINE_YAML)).expect("valid file");
    let factory = ApiClientFactory::new(config);

    // When: An unknown source is requested
    let error = factory.client("uniprot").expect_err("not configured");

    // Then: The error names the source
    assert_eq!(error.to_string(), "source 'uniprot' is not configured");
}
