//! Span accumulation - coalescing lifecycle notifications into spans
//!
//! Every span lives in exactly one bucket. A span's bucket starts as its
//! correlation key; when the key changes (a response id learned at call
//! completion, say) the whole bucket it currently lives in moves to the new
//! key so that spans seen earlier follow it.

use crate::keys::span_key;
use chrono::Duration;
use gepa_core::span::elapsed_ms;
use gepa_core::{AttributeDeriver, NotificationStatus, Span, SpanNotification, SpanStatus};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A bucket moved to a new key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub from: String,
    pub to: String,
}

/// Result of observing one notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub span_id: String,
    /// Bucket the span lives in after the notification
    pub bucket: String,
    pub migration: Option<Migration>,
    /// The span has seen an `end`/`error`
    pub finalized: bool,
    /// The notification altered the span
    pub changed: bool,
}

/// Spans by id, grouped into buckets
pub struct SpanAccumulator {
    deriver: Arc<dyn AttributeDeriver>,
    spans: HashMap<String, Span>,
    /// Span id -> correlation key last derived for it
    span_keys: HashMap<String, String>,
    /// Span id -> bucket it currently lives in
    span_buckets: HashMap<String, String>,
    /// Bucket -> span ids, in join order
    buckets: HashMap<String, Vec<String>>,
    arrivals: u64,
}

impl SpanAccumulator {
    pub fn new(deriver: Arc<dyn AttributeDeriver>) -> Self {
        Self {
            deriver,
            spans: HashMap::new(),
            span_keys: HashMap::new(),
            span_buckets: HashMap::new(),
            buckets: HashMap::new(),
            arrivals: 0,
        }
    }

    /// Merge a notification into its span and re-file the span.
    pub fn observe(&mut self, notification: &SpanNotification) -> Observation {
        let span_id = notification.span_id.clone();
        let previous = self.spans.get(&span_id).cloned();

        let arrival = self.arrivals;
        let span = match self.spans.entry(span_id.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                self.arrivals += 1;
                entry.insert(Span::new(
                    &notification.trace_id,
                    &notification.span_id,
                    arrival,
                    notification.timestamp,
                ))
            }
        };

        apply_notification(span, notification);
        if previous
            .as_ref()
            .map_or(true, |p| p.attributes != span.attributes)
        {
            span.derived = self.deriver.derive(&span.attributes);
        }

        let changed = previous.as_ref() != Some(&*span);
        let finalized = span.finalized;
        let key = span_key(span);

        let (bucket, migration) = self.file(&span_id, key);
        Observation {
            span_id,
            bucket,
            migration,
            finalized,
            changed,
        }
    }

    /// Put the span under `key`, migrating its current bucket if the key moved.
    fn file(&mut self, span_id: &str, key: String) -> (String, Option<Migration>) {
        let previous_key = self.span_keys.insert(span_id.to_string(), key.clone());
        let current = self.span_buckets.get(span_id).cloned();

        match (previous_key, current) {
            (Some(old), Some(bucket)) if old == key || bucket == key => (bucket, None),
            (Some(_), Some(from)) => {
                let moved = self.buckets.remove(&from).unwrap_or_default();
                let target = self.buckets.entry(key.clone()).or_default();
                for id in moved {
                    if !target.contains(&id) {
                        target.push(id.clone());
                    }
                    self.span_buckets.insert(id, key.clone());
                }
                debug!("Migrated bucket {} -> {}", from, key);
                let migration = Migration {
                    from,
                    to: key.clone(),
                };
                (key, Some(migration))
            }
            _ => {
                let members = self.buckets.entry(key.clone()).or_default();
                if !members.iter().any(|id| id == span_id) {
                    members.push(span_id.to_string());
                }
                self.span_buckets.insert(span_id.to_string(), key.clone());
                (key, None)
            }
        }
    }

    /// Finalized spans of a bucket, oldest first (ties by arrival)
    pub fn bucket_spans(&self, bucket: &str) -> Vec<Span> {
        let mut spans: Vec<Span> = self
            .buckets
            .get(bucket)
            .into_iter()
            .flatten()
            .filter_map(|id| self.spans.get(id))
            .filter(|s| s.finalized)
            .cloned()
            .collect();
        spans.sort_by_key(|s| {
            let at = s.earliest_timestamp();
            (at.is_none(), at, s.arrival)
        });
        spans
    }

    /// Spans still waiting for an end, in arrival order
    pub fn pending_span_ids(&self) -> Vec<String> {
        let mut pending: Vec<&Span> = self.spans.values().filter(|s| !s.finalized).collect();
        pending.sort_by_key(|s| s.arrival);
        pending.into_iter().map(|s| s.span_id.clone()).collect()
    }

    /// Finalize a pending span as partial, returning its bucket
    pub fn finalize_partial(&mut self, span_id: &str) -> Option<String> {
        let span = self.spans.get_mut(span_id)?;
        if span.finalized {
            return None;
        }
        span.complete_partial();
        self.span_buckets.get(span_id).cloned()
    }

    /// Forget a bucket and every span in it
    pub fn evict_bucket(&mut self, bucket: &str) {
        for id in self.buckets.remove(bucket).unwrap_or_default() {
            self.spans.remove(&id);
            self.span_keys.remove(&id);
            self.span_buckets.remove(&id);
        }
    }

    pub fn span(&self, span_id: &str) -> Option<&Span> {
        self.spans.get(span_id)
    }

    pub fn bucket_of(&self, span_id: &str) -> Option<&str> {
        self.span_buckets.get(span_id).map(String::as_str)
    }

    /// Number of spans held
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

/// Fold one notification into the span.
///
/// Start comes from a `start` event, else from the first timestamp seen; an
/// end with a reported duration implies its own start until a real `start`
/// arrives.
fn apply_notification(span: &mut Span, n: &SpanNotification) {
    if !n.trace_id.is_empty() {
        span.trace_id.clone_from(&n.trace_id);
    }
    if let Some(parent) = n.parent_span_id.as_deref().filter(|p| !p.is_empty()) {
        span.parent_span_id = Some(parent.to_string());
    }
    if !n.name.is_empty() {
        span.name.clone_from(&n.name);
    }
    span.last_seen_at = span.last_seen_at.max(n.timestamp);

    match n.status {
        NotificationStatus::Start => {
            span.started_at = match span.started_at {
                Some(at) if span.start_from_event => Some(at.min(n.timestamp)),
                _ => Some(n.timestamp),
            };
            span.start_from_event = true;
            if span.finalized && !span.duration_reported {
                if let (Some(start), Some(end)) = (span.started_at, span.ended_at) {
                    span.duration_ms = Some(elapsed_ms(start, end));
                }
            }
        }
        NotificationStatus::End | NotificationStatus::Error => {
            span.ended_at = Some(n.timestamp);
            if let Some(duration) = n.duration_ms {
                span.duration_ms = Some(duration);
                span.duration_reported = true;
                if !span.start_from_event {
                    span.started_at = i64::try_from(duration)
                        .ok()
                        .and_then(Duration::try_milliseconds)
                        .and_then(|d| n.timestamp.checked_sub_signed(d))
                        .or(Some(n.timestamp));
                }
            } else {
                if span.started_at.is_none() {
                    span.started_at = Some(n.timestamp);
                }
                if !span.duration_reported {
                    span.duration_ms = span.started_at.map(|start| elapsed_ms(start, n.timestamp));
                }
            }

            let status = if n.status == NotificationStatus::Error {
                SpanStatus::Error
            } else {
                SpanStatus::Success
            };
            span.status = if span.finalized {
                span.status.worst(status)
            } else {
                status
            };
            if let Some(message) = n.error_message.as_deref().filter(|m| !m.is_empty()) {
                span.error_message = Some(message.to_string());
            }
            span.finalized = true;
        }
    }

    if span.started_at.is_none() {
        span.started_at = Some(n.timestamp);
    }

    for (key, value) in &n.attributes {
        span.attributes.insert(key.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ts;
    use gepa_core::ProbeDeriver;

    fn accumulator() -> SpanAccumulator {
        SpanAccumulator::new(Arc::new(ProbeDeriver))
    }

    #[test]
    fn test_start_then_end() {
        let mut acc = accumulator();
        let first = acc.observe(&SpanNotification::start("t1", "s1", ts(1_000)));
        assert!(!first.finalized);
        assert_eq!(first.bucket, "span:t1/s1");

        let end = SpanNotification::end("t1", "s1", ts(1_120))
            .with_duration_ms(120)
            .with_attribute("gepa.rowId", "row-1");
        let second = acc.observe(&end);
        assert!(second.finalized);
        assert!(second.changed);
        assert_eq!(second.bucket, "row:row-1");

        let span = acc.span("s1").unwrap();
        assert_eq!(span.started_at, Some(ts(1_000)));
        assert_eq!(span.duration_ms, Some(120));
        assert_eq!(span.derived.dataset_row_id.as_deref(), Some("row-1"));
    }

    #[test]
    fn test_redelivery_changes_nothing() {
        let mut acc = accumulator();
        let end = SpanNotification::end("t1", "s1", ts(500))
            .with_duration_ms(20)
            .with_attribute("providerResponseId", "prov-1");
        acc.observe(&end);
        let before = acc.span("s1").cloned();

        let again = acc.observe(&end);
        assert!(!again.changed);
        assert_eq!(acc.span("s1").cloned(), before);
        assert_eq!(acc.bucket_spans("resp:prov-1").len(), 1);
    }

    #[test]
    fn test_end_only_implies_start() {
        let mut acc = accumulator();
        acc.observe(&SpanNotification::end("t1", "s1", ts(1_120)).with_duration_ms(120));
        assert_eq!(acc.span("s1").unwrap().started_at, Some(ts(1_000)));

        acc.observe(&SpanNotification::end("t1", "s2", ts(2_000)));
        let s2 = acc.span("s2").unwrap();
        assert_eq!(s2.started_at, Some(ts(2_000)));
        assert_eq!(s2.duration_ms, Some(0));
    }

    #[test]
    fn test_late_start_recomputes_duration() {
        let mut acc = accumulator();
        acc.observe(&SpanNotification::end("t1", "s1", ts(900)));
        acc.observe(&SpanNotification::start("t1", "s1", ts(400)));
        let span = acc.span("s1").unwrap();
        assert_eq!(span.started_at, Some(ts(400)));
        assert_eq!(span.duration_ms, Some(500));
        assert!(span.finalized);
    }

    #[test]
    fn test_error_is_sticky() {
        let mut acc = accumulator();
        acc.observe(&SpanNotification::error("t1", "s1", ts(10), "rate limited"));
        acc.observe(&SpanNotification::end("t1", "s1", ts(20)));
        let span = acc.span("s1").unwrap();
        assert_eq!(span.status, SpanStatus::Error);
        assert_eq!(span.error_message.as_deref(), Some("rate limited"));
    }

    #[test]
    fn test_key_change_migrates_whole_bucket() {
        let mut acc = accumulator();
        acc.observe(
            &SpanNotification::end("t1", "wrapper", ts(10)).with_attribute("gepa.rowId", "row-1"),
        );
        acc.observe(
            &SpanNotification::end("t1", "call", ts(20)).with_attribute("gepa.rowId", "row-1"),
        );

        let late = SpanNotification::end("t1", "call", ts(20))
            .with_attribute("providerResponseId", "prov-9");
        let observation = acc.observe(&late);

        assert_eq!(
            observation.migration,
            Some(Migration {
                from: "row:row-1".into(),
                to: "resp:prov-9".into(),
            })
        );
        let ids: Vec<String> = acc
            .bucket_spans("resp:prov-9")
            .into_iter()
            .map(|s| s.span_id)
            .collect();
        assert_eq!(ids, vec!["wrapper", "call"]);
        assert!(acc.bucket_spans("row:row-1").is_empty());
        assert_eq!(acc.bucket_of("wrapper"), Some("resp:prov-9"));

        // the moved span stays put when it is seen again
        let again = acc.observe(&SpanNotification::end("t1", "wrapper", ts(10)));
        assert_eq!(again.bucket, "resp:prov-9");
        assert_eq!(again.migration, None);
    }

    #[test]
    fn test_pending_spans_flush_as_partial() {
        let mut acc = accumulator();
        acc.observe(&SpanNotification::start("t1", "a", ts(0)));
        acc.observe(&SpanNotification::start("t1", "b", ts(5)));
        acc.observe(&SpanNotification::end("t1", "b", ts(9)));
        assert_eq!(acc.pending_span_ids(), vec!["a".to_string()]);

        let bucket = acc.finalize_partial("a").unwrap();
        assert_eq!(bucket, "span:t1/a");
        let span = acc.span("a").unwrap();
        assert_eq!(span.status, SpanStatus::Partial);
        assert!(span.finalized);
        assert!(acc.pending_span_ids().is_empty());
        assert!(acc.finalize_partial("a").is_none());
    }

    #[test]
    fn test_evict_bucket_forgets_spans() {
        let mut acc = accumulator();
        acc.observe(
            &SpanNotification::end("t1", "a", ts(0)).with_attribute("gepa.rowId", "row-1"),
        );
        acc.evict_bucket("row:row-1");
        assert!(acc.is_empty());
        assert_eq!(acc.bucket_of("a"), None);

        let fresh = acc.observe(&SpanNotification::end("t1", "a", ts(0)));
        assert!(fresh.changed);
        assert_eq!(fresh.bucket, "span:t1/a");
    }
}
