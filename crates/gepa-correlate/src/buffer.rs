//! Bounded, recency-ordered stores for records and raw spans

use crate::record::TelemetryRecord;
use gepa_core::Span;
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};

/// Newest first: `endedAt ?? startedAt` descending, undated records last,
/// later-created records first on ties.
fn newest_first(a: &TelemetryRecord, b: &TelemetryRecord) -> Ordering {
    b.recency()
        .cmp(&a.recency())
        .then_with(|| b.seq.cmp(&a.seq))
}

/// Global record store capped at a fixed size
#[derive(Debug, Clone)]
pub struct RecordBuffer {
    capacity: usize,
    records: HashMap<String, TelemetryRecord>,
}

impl RecordBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&TelemetryRecord> {
        self.records.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut TelemetryRecord> {
        self.records.get_mut(id)
    }

    pub fn insert(&mut self, record: TelemetryRecord) {
        self.records.insert(record.id.clone(), record);
    }

    pub fn remove(&mut self, id: &str) -> Option<TelemetryRecord> {
        self.records.remove(id)
    }

    /// Records ordered newest first
    pub fn newest_first(&self) -> Vec<&TelemetryRecord> {
        let mut all: Vec<&TelemetryRecord> = self.records.values().collect();
        all.sort_by(|a, b| newest_first(a, b));
        all
    }

    /// Records ordered oldest first by `startedAt ?? endedAt`
    pub fn chronological_mut(&mut self) -> Vec<&mut TelemetryRecord> {
        let mut all: Vec<&mut TelemetryRecord> = self.records.values_mut().collect();
        all.sort_by(|a, b| {
            a.chronology()
                .cmp(&b.chronology())
                .then_with(|| a.seq.cmp(&b.seq))
        });
        all
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TelemetryRecord> {
        self.records.values_mut()
    }

    /// Drop everything beyond the most recent `capacity` records.
    ///
    /// Returns the evicted records so callers can clean their indexes.
    pub fn enforce_capacity(&mut self) -> Vec<TelemetryRecord> {
        if self.records.len() <= self.capacity {
            return Vec::new();
        }
        let evicted_ids: Vec<String> = self
            .newest_first()
            .into_iter()
            .skip(self.capacity)
            .map(|r| r.id.clone())
            .collect();
        evicted_ids
            .iter()
            .filter_map(|id| self.records.remove(id))
            .collect()
    }
}

/// Capped raw span list for low-level inspection, most recently touched first
#[derive(Debug, Clone)]
pub struct RawSpanLog {
    capacity: usize,
    spans: VecDeque<Span>,
}

impl RawSpanLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            spans: VecDeque::new(),
        }
    }

    /// Replace any previous snapshot of the same span and move it to the front
    pub fn upsert(&mut self, span: Span) {
        self.spans.retain(|s| s.span_id != span.span_id);
        self.spans.push_front(span);
        self.spans.truncate(self.capacity);
    }

    pub fn spans(&self) -> Vec<Span> {
        self.spans.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{finalized_span, record_from};

    fn record(span_id: &str, ended_ms: i64, seq: u64) -> TelemetryRecord {
        let mut record = record_from(vec![finalized_span("t", span_id, ended_ms - 5, ended_ms)]);
        record.assign_identity(seq);
        record
    }

    #[test]
    fn test_keeps_most_recent() {
        let mut buffer = RecordBuffer::new(2);
        buffer.insert(record("a", 100, 0));
        buffer.insert(record("b", 300, 1));
        buffer.insert(record("c", 200, 2));

        let evicted = buffer.enforce_capacity();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].root.span_id, "a");

        let order: Vec<&str> = buffer
            .newest_first()
            .iter()
            .map(|r| r.root.span_id.as_str())
            .collect();
        assert_eq!(order, vec!["b", "c"]);
    }

    #[test]
    fn test_ties_prefer_later_records() {
        let mut buffer = RecordBuffer::new(1);
        buffer.insert(record("first", 100, 0));
        buffer.insert(record("second", 100, 1));

        let evicted = buffer.enforce_capacity();
        assert_eq!(evicted[0].root.span_id, "first");
    }

    #[test]
    fn test_undated_records_are_evicted_first() {
        let mut buffer = RecordBuffer::new(1);
        let mut undated = record("undated", 100, 5);
        undated.started_at = None;
        undated.ended_at = None;
        buffer.insert(undated);
        buffer.insert(record("dated", 1, 0));

        let evicted = buffer.enforce_capacity();
        assert_eq!(evicted[0].root.span_id, "undated");
    }

    #[test]
    fn test_raw_span_log_upserts_and_caps() {
        let mut log = RawSpanLog::new(2);
        log.upsert(finalized_span("t", "a", 0, 1));
        log.upsert(finalized_span("t", "b", 0, 1));
        log.upsert(finalized_span("t", "a", 0, 2));
        assert_eq!(log.len(), 2);
        assert_eq!(log.spans()[0].span_id, "a");

        log.upsert(finalized_span("t", "c", 0, 1));
        let ids: Vec<String> = log.spans().into_iter().map(|s| s.span_id).collect();
        assert_eq!(ids, vec!["c", "a"]);
    }
}
