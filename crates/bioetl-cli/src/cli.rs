//! CLI argument definitions for bioetl.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `enrich` | Resolve identifiers against every enabled source |
//! | `sources` | Show the merged per-source client configuration |
//!
//! # Examples
//!
//! ```bash
//! # Enrich a DOI list and pretty-print the report
//! bioetl enrich --config sources.yaml --dois dois.txt --pretty
//!
//! # Inspect resolved timeouts, retries and rate limits
//! bioetl sources --config sources.yaml
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// bioetl - resilient multi-source enrichment
#[derive(Debug, Parser)]
#[command(
    name = "bioetl",
    author,
    version,
    about = "Multi-source bioactivity enrichment CLI"
)]
pub struct Cli {
    /// Pretty-print JSON output with indentation.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true, default_value_t = false)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fan identifier lookups out to all enabled sources.
    ///
    /// Identifier files hold one identifier per line; blank lines and lines
    /// starting with '#' are ignored. Exits with 3 when any source failed.
    Enrich(EnrichArgs),

    /// Print the resolved configuration of every source (headers redacted).
    Sources(SourcesArgs),
}

#[derive(Debug, Args)]
pub struct EnrichArgs {
    /// YAML pipeline configuration.
    #[arg(long)]
    pub config: PathBuf,

    /// File of numeric ids (e.g. PubMed ids).
    #[arg(long)]
    pub ids: Option<PathBuf>,

    /// File of DOIs.
    #[arg(long)]
    pub dois: Option<PathBuf>,

    /// File of free-text titles.
    #[arg(long)]
    pub titles: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct SourcesArgs {
    /// YAML pipeline configuration.
    #[arg(long)]
    pub config: PathBuf,
}
