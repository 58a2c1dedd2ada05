//! Correlation keys
//!
//! A span gets exactly one bucket key (the strongest identity it carries). A
//! record advertises every identity it carries so that groups built under
//! different keys can still find each other.

use crate::record::TelemetryRecord;
use gepa_core::{normalize_input, DerivedAttributes, Span};
use sha2::{Digest, Sha256};

/// Both provider and model response ids share one namespace: the same id
/// can be reported under either spelling by different spans.
const RESPONSE_PREFIX: &str = "resp:";
const ROW_PREFIX: &str = "row:";
const RESPONSE_ROW_PREFIX: &str = "resp+row:";
const INPUT_PREFIX: &str = "input:";
const SPAN_PREFIX: &str = "span:";

/// Strongest identity of a span: provider response id, then model response
/// id, then dataset row id.
pub fn derive_key(derived: &DerivedAttributes) -> Option<String> {
    if let Some(id) = present(&derived.provider_response_id) {
        return Some(format!("{}{}", RESPONSE_PREFIX, id));
    }
    if let Some(id) = present(&derived.response_id) {
        return Some(format!("{}{}", RESPONSE_PREFIX, id));
    }
    present(&derived.dataset_row_id).map(|id| format!("{}{}", ROW_PREFIX, id))
}

/// Key used when a span carries no identity of its own
pub fn fallback_key(trace_id: &str, span_id: &str) -> String {
    format!("{}{}/{}", SPAN_PREFIX, trace_id, span_id)
}

/// Bucket key of a span
pub fn span_key(span: &Span) -> String {
    derive_key(&span.derived).unwrap_or_else(|| fallback_key(&span.trace_id, &span.span_id))
}

/// Every identity a record can be found under, strongest first
pub fn candidate_keys(record: &TelemetryRecord) -> Vec<String> {
    let fields = &record.fields;
    let provider_id = present(&fields.provider_response_id);
    let response_id = present(&fields.response_id);
    let row_id = present(&fields.dataset_row_id);

    let mut keys: Vec<String> = Vec::new();
    let mut push = |key: String| {
        if !keys.contains(&key) {
            keys.push(key);
        }
    };

    if let Some(row) = row_id {
        if let Some(id) = provider_id {
            push(format!("{}{}|{}", RESPONSE_ROW_PREFIX, id, row));
        }
        if let Some(id) = response_id {
            push(format!("{}{}|{}", RESPONSE_ROW_PREFIX, id, row));
        }
    }
    if let Some(id) = provider_id {
        push(format!("{}{}", RESPONSE_PREFIX, id));
    }
    if let Some(id) = response_id {
        push(format!("{}{}", RESPONSE_PREFIX, id));
    }
    if let Some(row) = row_id {
        push(format!("{}{}", ROW_PREFIX, row));
    }
    if let Some(input) = present(&fields.dataset_row_input) {
        let normalized = normalize_input(input);
        if !normalized.is_empty() {
            push(input_key(&normalized));
        }
    }

    if keys.is_empty() {
        keys.push(fallback_key(&record.trace_id, &record.root.span_id));
    }
    keys
}

/// Inputs can be long; index them by digest
fn input_key(normalized: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{}{}", INPUT_PREFIX, hex::encode(&hasher.finalize()[..12]))
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}
