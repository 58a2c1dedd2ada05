//! Telemetry records - the canonical view of one logical invocation

use crate::diff::DiffLine;
use crate::hydrate::Hydration;
use chrono::{DateTime, Utc};
use gepa_core::{DerivedAttributes, Span, SpanStatus};
use serde::{Deserialize, Serialize};

/// A merged view of one or more spans describing the same model/tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    /// Unique record ID (ULID)
    pub id: String,

    /// Creation order, used to break recency ties
    pub seq: u64,

    /// Trace of the current root span
    pub trace_id: String,

    /// Span representing the invocation
    pub root: Span,

    /// Every other span, ordered by start time
    pub children: Vec<Span>,

    /// Worst status across spans
    pub status: SpanStatus,

    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,

    /// Aggregated business fields
    pub fields: DerivedAttributes,

    /// Dataset row matched by the hydrator
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hydration: Option<Hydration>,

    /// System prompt change versus the previous record of the same role
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_diff: Option<Vec<DiffLine>>,

    /// Merges that skipped identity fields because dataset rows disagreed
    pub identity_conflicts: u32,
}

impl TelemetryRecord {
    /// Give a freshly built record its identity
    pub(crate) fn assign_identity(&mut self, seq: u64) {
        self.id = ulid::Ulid::new().to_string();
        self.seq = seq;
    }

    pub fn span_count(&self) -> usize {
        1 + self.children.len()
    }

    /// `endedAt ?? startedAt`, the ordering key of the record buffer
    pub fn recency(&self) -> Option<DateTime<Utc>> {
        self.ended_at.or(self.started_at)
    }

    /// `startedAt ?? endedAt`, the ordering key of prompt diffing
    pub fn chronology(&self) -> Option<DateTime<Utc>> {
        self.started_at.or(self.ended_at)
    }

    /// Observed row id, else the hydrated one
    pub fn dataset_row_id(&self) -> Option<&str> {
        self.fields
            .dataset_row_id
            .as_deref()
            .or_else(|| self.hydration.as_ref().map(|h| h.row.id.as_str()))
    }

    /// Observed row input, else the hydrated one
    pub fn dataset_row_input(&self) -> Option<&str> {
        self.fields
            .dataset_row_input
            .as_deref()
            .or_else(|| self.hydration.as_ref().map(|h| h.row.input.as_str()))
    }

    /// Observed expected output, else the hydrated one
    pub fn dataset_row_expected(&self) -> Option<&str> {
        self.fields
            .dataset_row_expected
            .as_deref()
            .or_else(|| self.hydration.as_ref().and_then(|h| h.row.expected.as_deref()))
    }

    /// Observed label, else the hydrated one
    pub fn dataset_row_label(&self) -> Option<&str> {
        self.fields
            .dataset_row_label
            .as_deref()
            .or_else(|| self.hydration.as_ref().and_then(|h| h.row.label.as_deref()))
    }
}
