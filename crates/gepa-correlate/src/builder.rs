//! Record building - one telemetry record from the spans of a bucket

use crate::merge::{finalize_totals, merge_fields};
use crate::record::TelemetryRecord;
use chrono::{DateTime, Utc};
use gepa_core::span::elapsed_ms;
use gepa_core::{DerivedAttributes, Span, SpanStatus};
use std::cmp::{Ordering, Reverse};
use std::collections::HashSet;

/// Pick the span that represents the bucket.
///
/// Rules narrow the candidate set in order, each only if some candidate
/// satisfies it: carries prompt/response text, has no parent inside the
/// bucket, is not an internal sub-call. The longest remaining span wins.
/// Independent of the order of `spans`.
pub fn select_root(spans: &[Span], sub_call_suffixes: &[String]) -> Option<usize> {
    let ids: HashSet<&str> = spans.iter().map(|s| s.span_id.as_str()).collect();

    let rules: [&dyn Fn(&Span) -> bool; 3] = [
        &|s: &Span| s.has_prompt_summary() || s.has_response_text(),
        &|s: &Span| match s.parent_span_id.as_deref() {
            Some(parent) => !ids.contains(parent),
            None => true,
        },
        &|s: &Span| !sub_call_suffixes.iter().any(|suffix| s.name.ends_with(suffix.as_str())),
    ];

    let mut candidates: Vec<usize> = (0..spans.len()).collect();
    for rule in rules {
        let narrowed: Vec<usize> = candidates
            .iter()
            .copied()
            .filter(|&i| rule(&spans[i]))
            .collect();
        if !narrowed.is_empty() {
            candidates = narrowed;
        }
    }

    candidates
        .into_iter()
        .max_by(|&a, &b| longest_then_earliest(&spans[a], &spans[b]))
}

/// Root preference among equally qualified spans: longest, then earliest,
/// then smallest span id. `Greater` means `a` is preferred.
pub(crate) fn longest_then_earliest(a: &Span, b: &Span) -> Ordering {
    a.duration_or_zero()
        .cmp(&b.duration_or_zero())
        .then_with(|| Reverse(a.earliest_timestamp()).cmp(&Reverse(b.earliest_timestamp())))
        .then_with(|| Reverse(&a.span_id).cmp(&Reverse(&b.span_id)))
}

/// Build a record from spans ordered oldest first.
///
/// Field aggregation folds the spans in order with the same rules the
/// merger applies between records.
pub fn build_record(spans: &[Span], sub_call_suffixes: &[String]) -> Option<TelemetryRecord> {
    let root_index = select_root(spans, sub_call_suffixes)?;
    let root = spans[root_index].clone();

    let mut children: Vec<Span> = spans
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != root_index)
        .map(|(_, s)| s.clone())
        .collect();
    sort_children(&mut children);

    let mut fields = DerivedAttributes::default();
    for span in spans {
        merge_fields(&mut fields, &span.derived, true);
    }
    finalize_totals(&mut fields);

    let status = spans
        .iter()
        .fold(SpanStatus::Success, |acc, s| acc.worst(s.status));
    let started_at = spans.iter().filter_map(|s| s.started_at).min();
    let ended_at = spans.iter().filter_map(|s| s.ended_at).max();
    let duration_ms = record_duration(started_at, ended_at, &root);

    Some(TelemetryRecord {
        id: String::new(),
        seq: 0,
        trace_id: root.trace_id.clone(),
        root,
        children,
        status,
        started_at,
        ended_at,
        duration_ms,
        fields,
        hydration: None,
        prompt_diff: None,
        identity_conflicts: 0,
    })
}

/// Children are ordered by start time
pub(crate) fn sort_children(children: &mut [Span]) {
    children.sort_by(|a, b| {
        a.started_at
            .cmp(&b.started_at)
            .then_with(|| a.span_id.cmp(&b.span_id))
    });
}

pub(crate) fn record_duration(
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    root: &Span,
) -> Option<u64> {
    match (started_at, ended_at) {
        (Some(start), Some(end)) => Some(elapsed_ms(start, end)),
        _ => root.duration_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{default_suffixes, finalized_span, SpanExt};

    #[test]
    fn test_leaf_model_call_wins_over_wrapper() {
        let wrapper = finalized_span("t1", "wrap", 0, 500).named("gepa.evaluate");
        let mut leaf = finalized_span("t1", "leaf", 10, 400)
            .named("llm.generate")
            .child_of("wrap");
        leaf.derived.response_text = Some("4".into());

        let spans = vec![wrapper, leaf];
        let root = select_root(&spans, &default_suffixes()).unwrap();
        assert_eq!(spans[root].span_id, "leaf");
    }

    #[test]
    fn test_top_level_span_wins_without_text() {
        let parent = finalized_span("t1", "p", 0, 100);
        let child = finalized_span("t1", "c", 0, 900).child_of("p");
        let spans = vec![child, parent];
        let root = select_root(&spans, &default_suffixes()).unwrap();
        assert_eq!(spans[root].span_id, "p");
    }

    #[test]
    fn test_sub_call_suffix_is_avoided() {
        let inner = finalized_span("t1", "a", 0, 900).named("llm.call.internal");
        let outer = finalized_span("t1", "b", 0, 100).named("llm.call");
        let spans = vec![inner, outer];
        let root = select_root(&spans, &default_suffixes()).unwrap();
        assert_eq!(spans[root].span_id, "b");
    }

    #[test]
    fn test_longest_duration_breaks_remaining_ties() {
        let spans = vec![
            finalized_span("t1", "short", 0, 10),
            finalized_span("t1", "long", 0, 90),
            finalized_span("t2", "mid", 0, 50),
        ];
        let root = select_root(&spans, &default_suffixes()).unwrap();
        assert_eq!(spans[root].span_id, "long");
    }

    #[test]
    fn test_root_selection_is_order_independent() {
        let a = finalized_span("t1", "a", 0, 50);
        let b = finalized_span("t1", "b", 0, 50);
        let c = finalized_span("t1", "c", 5, 55);
        let forward = vec![a.clone(), b.clone(), c.clone()];
        let backward = vec![c, b, a];

        let suffixes = default_suffixes();
        let r1 = &forward[select_root(&forward, &suffixes).unwrap()].span_id;
        let r2 = &backward[select_root(&backward, &suffixes).unwrap()].span_id;
        assert_eq!(r1, r2);
        assert_eq!(r1, "a");
    }

    #[test]
    fn test_aggregation_rules() {
        let mut older = finalized_span("t1", "a", 0, 100);
        older.derived.model_id = Some("gpt-4o".into());
        older.derived.response_id = Some("early".into());
        older.derived.cost_usd = Some(0.02);
        older.derived.latency_ms = Some(90.0);
        older.derived.prompt_tokens = Some(10);

        let mut newer = finalized_span("t1", "b", 50, 300);
        newer.derived.model_id = Some("gpt-4o-mini".into());
        newer.derived.response_id = Some("final".into());
        newer.derived.cost_usd = Some(0.01);
        newer.derived.latency_ms = Some(60.0);
        newer.derived.prompt_tokens = Some(12);
        newer.derived.completion_tokens = Some(5);
        newer.derived.total_tokens = Some(99);
        newer.status = SpanStatus::Error;

        let record = build_record(&[older, newer], &default_suffixes()).unwrap();
        assert_eq!(record.fields.model_id.as_deref(), Some("gpt-4o"));
        assert_eq!(record.fields.response_id.as_deref(), Some("final"));
        assert_eq!(record.fields.cost_usd, Some(0.02));
        assert_eq!(record.fields.latency_ms, Some(60.0));
        assert_eq!(record.fields.prompt_tokens, Some(12));
        assert_eq!(record.fields.total_tokens, Some(17));
        assert_eq!(record.status, SpanStatus::Error);
        assert_eq!(record.duration_ms, Some(300));
        assert_eq!(record.span_count(), 2);
        assert!(!record.children.iter().any(|c| c.span_id == record.root.span_id));
    }

    #[test]
    fn test_duration_falls_back_to_root() {
        let mut span = finalized_span("t1", "a", 0, 100);
        span.started_at = None;
        span.ended_at = None;
        span.duration_ms = Some(42);
        let record = build_record(&[span], &default_suffixes()).unwrap();
        assert_eq!(record.duration_ms, Some(42));
    }

    #[test]
    fn test_empty_bucket_builds_nothing() {
        assert!(build_record(&[], &default_suffixes()).is_none());
    }
}
