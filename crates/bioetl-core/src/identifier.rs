//! Identifier kinds and their normalization rules.
//!
//! Every normalizer is idempotent: `normalize(normalize(x)) == normalize(x)`.

use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Generic identifier families the enrichment core can match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierKind {
    /// Numeric record ids (e.g. PubMed ids), matched on digits only.
    Numeric,
    /// DOI-like strings, matched case-insensitively without resolver prefixes.
    Doi,
    /// Free-text titles, matched case-insensitively with collapsed whitespace.
    Title,
}

const DOI_PREFIXES: [&str; 6] = [
    "https://doi.org/",
    "http://doi.org/",
    "https://dx.doi.org/",
    "http://dx.doi.org/",
    "doi.org/",
    "doi:",
];

impl IdentifierKind {
    pub const ALL: [Self; 3] = [Self::Numeric, Self::Doi, Self::Title];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Numeric => "numeric",
            Self::Doi => "doi",
            Self::Title => "title",
        }
    }

    /// Record fields inspected for coverage when an adapter declares none.
    pub fn default_match_fields(self) -> &'static [&'static str] {
        match self {
            Self::Numeric => &["pmid", "pubmed_id", "id"],
            Self::Doi => &["doi", "DOI"],
            Self::Title => &["title"],
        }
    }

    /// Returns `None` when nothing identifier-like survives normalization.
    pub fn normalize(self, raw: &str) -> Option<String> {
        let normalized = match self {
            Self::Numeric => normalize_numeric(raw),
            Self::Doi => normalize_doi(raw),
            Self::Title => normalize_title(raw),
        };
        (!normalized.is_empty()).then_some(normalized)
    }
}

impl Display for IdentifierKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdentifierKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "numeric" | "pmid" | "id" => Ok(Self::Numeric),
            "doi" => Ok(Self::Doi),
            "title" => Ok(Self::Title),
            other => Err(format!(
                "invalid identifier kind '{other}', expected one of numeric, doi, title"
            )),
        }
    }
}

pub fn normalize_numeric(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).collect()
}

pub fn normalize_doi(raw: &str) -> String {
    let mut value = raw.trim().to_lowercase();
    // Loop so that stacked prefixes ("doi:https://doi.org/...") are stripped in one pass.
    loop {
        let Some(rest) = DOI_PREFIXES
            .iter()
            .find_map(|prefix| value.strip_prefix(prefix))
        else {
            break;
        };
        value = rest.trim_start().to_owned();
    }
    value.trim().to_owned()
}

pub fn normalize_title(raw: &str) -> String {
    raw.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Drops blank entries and duplicates, keeping first-seen order.
pub fn dedupe_preserving_order<I, S>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut output = Vec::new();

    for value in values {
        let value = value.as_ref().trim();
        if value.is_empty() {
            continue;
        }
        if seen.insert(value.to_owned()) {
            output.push(value.to_owned());
        }
    }

    output
}
