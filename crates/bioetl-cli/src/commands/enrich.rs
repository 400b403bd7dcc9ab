use std::path::Path;

use bioetl_core::{ApiClientFactory, EnrichmentRequest};

use crate::cli::EnrichArgs;
use crate::error::CliError;

use super::{load_config, CommandOutput};

pub async fn run(args: &EnrichArgs) -> Result<CommandOutput, CliError> {
    let config = load_config(&args.config)?;

    let request = EnrichmentRequest::new()
        .with_numeric_ids(read_identifiers(args.ids.as_deref())?)
        .with_dois(read_identifiers(args.dois.as_deref())?)
        .with_titles(read_identifiers(args.titles.as_deref())?);
    if request.is_empty() {
        return Err(CliError::Command(String::from(
            "no identifiers given: pass at least one of --ids, --dois or --titles",
        )));
    }

    let orchestrator = ApiClientFactory::new(config).orchestrator()?;
    if orchestrator.adapter_names().next().is_none() {
        return Err(CliError::Command(String::from(
            "no enabled source declares a 'batch' endpoint",
        )));
    }

    let report = orchestrator.run(&request).await;
    for line in report.summary() {
        tracing::info!("{line}");
    }

    let has_errors = report.has_errors();
    Ok(CommandOutput::ok(serde_json::to_value(&report)?).with_errors(has_errors))
}

/// One identifier per line; blank lines and `#` comments are skipped.
fn read_identifiers(path: Option<&Path>) -> Result<Vec<String>, CliError> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };

    let contents = std::fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_owned)
        .collect())
}
