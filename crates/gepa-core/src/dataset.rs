//! Dataset rows and the read-only lookup used to hydrate telemetry
//!
//! Rows are owned by the dataset editor. Whenever the dataset changes a new
//! [`DatasetLookup`] is built and handed to the engine as a whole.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Dataset loading errors
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Failed to read dataset file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse dataset JSON: {0}")]
    ParseError(#[from] serde_json::Error),
}

/// One dataset row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRow {
    pub id: String,
    pub input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Accepted file shapes: a bare array of rows or `{"rows": [...]}`
#[derive(Deserialize)]
#[serde(untagged)]
enum DatasetFile {
    Rows(Vec<DatasetRow>),
    Wrapped { rows: Vec<DatasetRow> },
}

/// Index of rows by id and by normalized input text
#[derive(Debug, Clone, Default)]
pub struct DatasetLookup {
    by_id: HashMap<String, DatasetRow>,
    by_input: HashMap<String, Vec<DatasetRow>>,
}

impl DatasetLookup {
    /// Build a lookup; rows keep their original order within an input bucket
    pub fn from_rows(rows: impl IntoIterator<Item = DatasetRow>) -> Self {
        let mut lookup = Self::default();
        for row in rows {
            let key = normalize_input(&row.input);
            if !key.is_empty() {
                lookup.by_input.entry(key).or_default().push(row.clone());
            }
            lookup.by_id.insert(row.id.clone(), row);
        }
        lookup
    }

    /// Load rows from a JSON file
    pub fn load(path: &Path) -> Result<Self, DatasetError> {
        let content = std::fs::read_to_string(path)?;
        let rows = match serde_json::from_str::<DatasetFile>(&content)? {
            DatasetFile::Rows(rows) => rows,
            DatasetFile::Wrapped { rows } => rows,
        };
        debug!("Loaded {} dataset rows from {}", rows.len(), path.display());
        Ok(Self::from_rows(rows))
    }

    pub fn by_id(&self, id: &str) -> Option<&DatasetRow> {
        self.by_id.get(id)
    }

    /// Rows whose normalized input equals `normalized`
    pub fn by_input(&self, normalized: &str) -> &[DatasetRow] {
        self.by_input
            .get(normalized)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// Collapse whitespace, trim, lowercase
pub fn normalize_input(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
