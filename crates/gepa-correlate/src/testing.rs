//! Shared fixtures for unit tests

use crate::builder::build_record;
use crate::record::TelemetryRecord;
use chrono::{DateTime, TimeZone, Utc};
use gepa_core::span::elapsed_ms;
use gepa_core::{Span, TelemetrySettings};

pub fn ts(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).unwrap()
}

/// A span that already saw its start and end
pub fn finalized_span(trace_id: &str, span_id: &str, start_ms: i64, end_ms: i64) -> Span {
    let mut span = Span::new(trace_id, span_id, 0, ts(end_ms));
    span.started_at = Some(ts(start_ms));
    span.ended_at = Some(ts(end_ms));
    span.duration_ms = Some(elapsed_ms(ts(start_ms), ts(end_ms)));
    span.start_from_event = true;
    span.finalized = true;
    span
}

pub fn default_suffixes() -> Vec<String> {
    TelemetrySettings::default().sub_call_suffixes
}

/// Build a record without an identity
pub fn record_from(spans: Vec<Span>) -> TelemetryRecord {
    build_record(&spans, &default_suffixes()).expect("at least one span")
}

pub trait SpanExt {
    fn named(self, name: &str) -> Span;
    fn child_of(self, parent_span_id: &str) -> Span;
}

impl SpanExt for Span {
    fn named(mut self, name: &str) -> Span {
        self.name = name.to_string();
        self
    }

    fn child_of(mut self, parent_span_id: &str) -> Span {
        self.parent_span_id = Some(parent_span_id.to_string());
        self
    }
}
