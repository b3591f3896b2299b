//! Status catalogue: symbolic names resolved to the numeric codes stored on queue items.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::PipelineError;

/// Symbolic names the pipeline resolves through the registry.
pub mod names {
    pub const PENDING_ENRICHMENT: &str = "pending_enrichment";
    pub const TO_SUMMARIZE: &str = "to_summarize";
    pub const TO_TAG: &str = "to_tag";
    pub const TO_THUMBNAIL: &str = "to_thumbnail";
    pub const ENRICHED: &str = "enriched";
    pub const PENDING_REVIEW: &str = "pending_review";
    pub const PUBLISHED: &str = "published";
    pub const FAILED: &str = "failed";
    pub const DEAD_LETTER: &str = "dead_letter";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCode {
    pub code: i32,
    pub name: String,
    pub sort_order: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusBand {
    Discovery,
    Enrichment,
    Review,
    Published,
    Terminal,
}

impl StatusBand {
    pub fn of(code: i32) -> Self {
        match code {
            c if c >= 500 => Self::Terminal,
            c if c >= 400 => Self::Published,
            c if c >= 300 => Self::Review,
            c if c >= 200 => Self::Enrichment,
            _ => Self::Discovery,
        }
    }
}

/// Immutable snapshot of `status_lookup`. Load one per operation, never cache it for the
/// lifetime of the process.
#[derive(Debug, Clone, Default)]
pub struct StatusRegistry {
    by_name: BTreeMap<String, StatusCode>,
    names_by_code: BTreeMap<i32, String>,
}

impl StatusRegistry {
    pub fn from_rows(rows: impl IntoIterator<Item = StatusCode>) -> Result<Self, PipelineError> {
        let mut registry = Self::default();
        for row in rows {
            if registry.by_name.contains_key(&row.name) {
                return Err(PipelineError::Validation(format!(
                    "duplicate status name {}",
                    row.name
                )));
            }
            if registry.names_by_code.contains_key(&row.code) {
                return Err(PipelineError::Validation(format!(
                    "duplicate status code {}",
                    row.code
                )));
            }
            registry.names_by_code.insert(row.code, row.name.clone());
            registry.by_name.insert(row.name.clone(), row);
        }
        Ok(registry)
    }

    pub fn code_for(&self, name: &str) -> Result<i32, PipelineError> {
        self.by_name
            .get(name)
            .map(|row| row.code)
            .ok_or_else(|| PipelineError::not_found("status", name))
    }

    pub fn name_for(&self, code: i32) -> Option<&str> {
        self.names_by_code.get(&code).map(String::as_str)
    }

    /// Display label for a code, tolerating codes missing from the catalogue.
    pub fn label(&self, code: i32) -> String {
        self.name_for(code)
            .map(ToString::to_string)
            .unwrap_or_else(|| format!("unknown({code})"))
    }

    pub fn contains(&self, code: i32) -> bool {
        self.names_by_code.contains_key(&code)
    }

    /// Working states end in 1 (`summarizing`, `tagging`, ...).
    pub fn is_in_progress(code: i32) -> bool {
        code % 10 == 1
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn rows(&self) -> Vec<StatusCode> {
        let mut rows = self.by_name.values().cloned().collect::<Vec<_>>();
        rows.sort_by_key(|row| (row.sort_order, row.code));
        rows
    }

    /// Lowest and highest code in the catalogue.
    pub fn code_bounds(&self) -> Option<(i32, i32)> {
        let min = *self.names_by_code.keys().next()?;
        let max = *self.names_by_code.keys().next_back()?;
        Some((min, max))
    }

    /// Codes from `from` up to but excluding `until`, in code order.
    pub fn codes_between(&self, from: &str, until: &str) -> Result<Vec<i32>, PipelineError> {
        let from = self.code_for(from)?;
        let until = self.code_for(until)?;
        Ok(self.names_by_code.range(from..until).map(|(code, _)| *code).collect())
    }
}
