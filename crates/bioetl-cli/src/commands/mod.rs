mod enrich;
mod sources;

use std::path::Path;

use bioetl_core::PipelineConfig;
use serde_json::Value;

use crate::cli::{Cli, Command};
use crate::error::CliError;

/// Rendered command output plus whether any part of it failed.
pub struct CommandOutput {
    pub data: Value,
    pub has_errors: bool,
}

impl CommandOutput {
    pub fn ok(data: Value) -> Self {
        Self {
            data,
            has_errors: false,
        }
    }

    pub fn with_errors(mut self, has_errors: bool) -> Self {
        self.has_errors = has_errors;
        self
    }
}

pub async fn run(cli: &Cli) -> Result<CommandOutput, CliError> {
    match &cli.command {
        Command::Enrich(args) => enrich::run(args).await,
        Command::Sources(args) => sources::run(args),
    }
}

pub(crate) fn load_config(path: &Path) -> Result<PipelineConfig, CliError> {
    let yaml = std::fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(PipelineConfig::from_yaml_str(&yaml)?)
}
