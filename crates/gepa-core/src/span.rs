//! Spans - one observed operation, coalesced from its notifications

use crate::attributes::DerivedAttributes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Span status
///
/// Ordered `Success < Partial < Error` so the worst status of a group is its max.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    #[default]
    Success,
    Partial,
    Error,
}

impl SpanStatus {
    /// Worst of two statuses
    pub fn worst(self, other: SpanStatus) -> SpanStatus {
        self.max(other)
    }
}

/// A span within a trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Span {
    /// Trace ID
    pub trace_id: String,

    /// Span ID
    pub span_id: String,

    /// Parent span ID
    pub parent_span_id: Option<String>,

    /// Operation name
    pub name: String,

    /// Start time
    pub started_at: Option<DateTime<Utc>>,

    /// End time
    pub ended_at: Option<DateTime<Utc>>,

    /// Duration in milliseconds
    pub duration_ms: Option<u64>,

    /// Status
    pub status: SpanStatus,

    /// Error description, when the span failed
    pub error_message: Option<String>,

    /// Whether an `end`/`error` was processed (or the span was flushed)
    pub finalized: bool,

    /// Raw attribute bag, union of every notification seen
    pub attributes: Map<String, Value>,

    /// Normalized view of `attributes`
    pub derived: DerivedAttributes,

    /// Arrival order of the first notification for this span
    pub arrival: u64,

    /// Timestamp of the latest notification
    pub last_seen_at: DateTime<Utc>,

    /// `started_at` came from a `start` notification rather than a fallback
    #[serde(skip)]
    pub start_from_event: bool,

    /// `duration_ms` was reported by the producer
    #[serde(skip)]
    pub duration_reported: bool,
}

impl Span {
    /// Create an empty, pending span
    pub fn new(
        trace_id: impl Into<String>,
        span_id: impl Into<String>,
        arrival: u64,
        seen_at: DateTime<Utc>,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            span_id: span_id.into(),
            parent_span_id: None,
            name: String::new(),
            started_at: None,
            ended_at: None,
            duration_ms: None,
            status: SpanStatus::Success,
            error_message: None,
            finalized: false,
            attributes: Map::new(),
            derived: DerivedAttributes::default(),
            arrival,
            last_seen_at: seen_at,
            start_from_event: false,
            duration_reported: false,
        }
    }

    /// Earliest known timestamp, used for chronological ordering
    pub fn earliest_timestamp(&self) -> Option<DateTime<Utc>> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some(start.min(end)),
            (start, end) => start.or(end),
        }
    }

    /// Duration, treating unknown as zero
    pub fn duration_or_zero(&self) -> u64 {
        self.duration_ms.unwrap_or(0)
    }

    pub fn has_prompt_summary(&self) -> bool {
        self.derived.prompt_summary.is_some()
    }

    pub fn has_response_text(&self) -> bool {
        self.derived.response_text.is_some()
    }

    /// Finalize a span that never reported an end
    pub fn complete_partial(&mut self) {
        if self.ended_at.is_none() {
            self.ended_at = Some(self.last_seen_at);
        }
        if self.duration_ms.is_none() {
            if let (Some(start), Some(end)) = (self.started_at, self.ended_at) {
                self.duration_ms = Some(elapsed_ms(start, end));
            }
        }
        self.status = self.status.worst(SpanStatus::Partial);
        self.finalized = true;
    }
}

/// Milliseconds between two instants, clamped at zero
pub fn elapsed_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    (end - start).num_milliseconds().max(0) as u64
}
