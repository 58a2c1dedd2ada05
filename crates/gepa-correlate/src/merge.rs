//! Record merging
//!
//! Field rules shared by the builder (span over span) and the merger
//! (record over record):
//!
//! - descriptive scalars are first-defined-wins
//! - identity/finalization fields are last-defined-wins
//! - tokens, cost and temperature take the maximum
//! - latency takes the minimum
//!
//! Dataset identity fields are first-defined-wins, and are left alone
//! entirely when the two sides disagree on which row they describe.

use crate::builder::{longest_then_earliest, record_duration, sort_children};
use crate::record::TelemetryRecord;
use gepa_core::{normalize_input, DerivedAttributes, Span};
use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::warn;

/// What a merge did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Dataset identities disagreed; identity fields were skipped
    pub conflict: bool,
    /// A different span now represents the record
    pub root_changed: bool,
}

/// Fold `source` into `target`, `target` being the older side.
pub fn merge_fields(
    target: &mut DerivedAttributes,
    source: &DerivedAttributes,
    merge_identity: bool,
) {
    first_defined(&mut target.model_id, &source.model_id);
    first_defined(&mut target.provider, &source.provider);
    first_defined(&mut target.aggregator, &source.aggregator);
    first_defined(&mut target.prompt_summary, &source.prompt_summary);
    first_defined(&mut target.system_prompt, &source.system_prompt);
    first_defined(&mut target.routing_plan, &source.routing_plan);
    first_defined(&mut target.routing_reasoning, &source.routing_reasoning);
    if target.prompt_messages.is_empty() && !source.prompt_messages.is_empty() {
        target.prompt_messages = source.prompt_messages.clone();
    }

    last_defined(&mut target.response_id, &source.response_id);
    last_defined(&mut target.operation_id, &source.operation_id);
    last_defined(&mut target.provider_response_id, &source.provider_response_id);
    last_defined(&mut target.response_text, &source.response_text);
    last_defined(&mut target.iteration, &source.iteration);
    last_defined(&mut target.role, &source.role);

    target.temperature = max_defined(target.temperature, source.temperature);
    target.prompt_tokens = max_defined(target.prompt_tokens, source.prompt_tokens);
    target.completion_tokens = max_defined(target.completion_tokens, source.completion_tokens);
    target.total_tokens = max_defined(target.total_tokens, source.total_tokens);
    target.cost_usd = max_defined(target.cost_usd, source.cost_usd);
    target.latency_ms = min_defined(target.latency_ms, source.latency_ms);

    if merge_identity {
        first_defined(&mut target.dataset_row_id, &source.dataset_row_id);
        first_defined(&mut target.dataset_row_input, &source.dataset_row_input);
        first_defined(&mut target.dataset_row_expected, &source.dataset_row_expected);
        first_defined(&mut target.dataset_row_label, &source.dataset_row_label);
    }
}

/// Total tokens are prompt + completion whenever both are known and the sum
/// fits; otherwise the reported total stands.
pub fn finalize_totals(fields: &mut DerivedAttributes) {
    if let (Some(prompt), Some(completion)) = (fields.prompt_tokens, fields.completion_tokens) {
        if let Some(sum) = prompt.checked_add(completion) {
            fields.total_tokens = Some(sum);
        }
    }
}

/// Whether both sides name a dataset row and the rows differ.
///
/// Row ids are compared when both sides have one, otherwise the normalized
/// prompt input.
pub fn identity_conflict(a: &DerivedAttributes, b: &DerivedAttributes) -> bool {
    if let (Some(x), Some(y)) = (a.dataset_row_id.as_deref(), b.dataset_row_id.as_deref()) {
        return x != y;
    }
    match (row_input(a), row_input(b)) {
        (Some(x), Some(y)) => x != y,
        _ => false,
    }
}

fn row_input(fields: &DerivedAttributes) -> Option<String> {
    fields
        .dataset_row_input
        .as_deref()
        .or_else(|| fields.first_user_message())
        .map(normalize_input)
        .filter(|s| !s.is_empty())
}

/// Merge a newly built record into an already published one.
///
/// Never fails: an identity conflict is counted on the target and the
/// remaining fields are merged as usual.
pub fn merge_records(target: &mut TelemetryRecord, source: TelemetryRecord) -> MergeOutcome {
    let conflict = identity_conflict(&target.fields, &source.fields);
    if conflict {
        target.identity_conflicts += 1;
        warn!(
            "Identity conflict merging into record {}: rows {:?} vs {:?}, identity fields kept",
            target.id, target.fields.dataset_row_id, source.fields.dataset_row_id
        );
    }

    merge_fields(&mut target.fields, &source.fields, !conflict);
    finalize_totals(&mut target.fields);

    target.status = target.status.worst(source.status);
    target.started_at = match (target.started_at, source.started_at) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    target.ended_at = target.ended_at.max(source.ended_at);

    let root_changed = reconcile_spans(target, source);
    target.duration_ms = record_duration(target.started_at, target.ended_at, &target.root);

    MergeOutcome {
        conflict,
        root_changed,
    }
}

/// Replace the target's copies of any span present in `fresh`
pub(crate) fn refresh_spans(target: &mut TelemetryRecord, fresh: &[Span]) {
    for span in fresh {
        if target.root.span_id == span.span_id {
            target.root = span.clone();
        } else if let Some(child) = target.children.iter_mut().find(|c| c.span_id == span.span_id) {
            *child = span.clone();
        }
    }
}

/// Union both span sets and re-pick the root. Returns whether it moved.
fn reconcile_spans(target: &mut TelemetryRecord, source: TelemetryRecord) -> bool {
    let current_root = target.root.span_id.clone();

    let mut seen = HashSet::new();
    let mut union: Vec<Span> = Vec::with_capacity(target.span_count() + source.span_count());
    let incoming = std::iter::once(target.root.clone())
        .chain(target.children.drain(..))
        .chain(std::iter::once(source.root))
        .chain(source.children);
    for span in incoming {
        if seen.insert(span.span_id.clone()) {
            union.push(span);
        }
    }

    // Score first, then the builder's ordering
    let mut best = 0;
    let mut best_score = root_score(&union[0]);
    for (i, span) in union.iter().enumerate().skip(1) {
        let score = root_score(span);
        let preferred = score > best_score
            || (score == best_score
                && longest_then_earliest(span, &union[best]) == Ordering::Greater);
        if preferred {
            best = i;
            best_score = score;
        }
    }

    target.root = union.swap_remove(best);
    sort_children(&mut union);
    target.children = union;
    target.trace_id = target.root.trace_id.clone();

    target.root.span_id != current_root
}

fn root_score(span: &Span) -> u8 {
    3 * span.has_prompt_summary() as u8
        + 2 * span.has_response_text() as u8
        + (span.duration_or_zero() > 0) as u8
}

fn first_defined<T: Clone>(target: &mut Option<T>, source: &Option<T>) {
    if target.is_none() {
        target.clone_from(source);
    }
}

fn last_defined<T: Clone>(target: &mut Option<T>, source: &Option<T>) {
    if source.is_some() {
        target.clone_from(source);
    }
}

fn max_defined<T: PartialOrd + Copy>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(x), Some(y)) => Some(if y > x { y } else { x }),
        (x, y) => x.or(y),
    }
}

fn min_defined<T: PartialOrd + Copy>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(x), Some(y)) => Some(if y < x { y } else { x }),
        (x, y) => x.or(y),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{finalized_span, record_from};
    use gepa_core::SpanStatus;

    fn with_row(span_id: &str, row: &str, cost: f64, latency: f64) -> TelemetryRecord {
        let mut span = finalized_span("t1", span_id, 0, 100);
        span.derived.dataset_row_id = Some(row.into());
        span.derived.dataset_row_input = Some(format!("input of {}", row));
        span.derived.cost_usd = Some(cost);
        span.derived.latency_ms = Some(latency);
        record_from(vec![span])
    }

    #[test]
    fn test_conflict_is_contained() {
        let mut target = with_row("a", "row-1", 0.01, 50.0);
        let mut source = with_row("b", "row-2", 0.03, 20.0);
        source.ended_at = Some(crate::testing::ts(400));

        let outcome = merge_records(&mut target, source);
        assert!(outcome.conflict);
        assert_eq!(target.identity_conflicts, 1);
        assert_eq!(target.fields.dataset_row_id.as_deref(), Some("row-1"));
        assert_eq!(target.fields.dataset_row_input.as_deref(), Some("input of row-1"));
        assert_eq!(target.fields.cost_usd, Some(0.03));
        assert_eq!(target.fields.latency_ms, Some(20.0));
        assert_eq!(target.duration_ms, Some(400));
        assert_eq!(target.span_count(), 2);
    }

    #[test]
    fn test_identity_fills_without_conflict() {
        let mut target = record_from(vec![finalized_span("t1", "a", 0, 100)]);
        let source = with_row("b", "row-1", 0.01, 10.0);

        let outcome = merge_records(&mut target, source);
        assert!(!outcome.conflict);
        assert_eq!(target.fields.dataset_row_id.as_deref(), Some("row-1"));
    }

    #[test]
    fn test_conflict_on_normalized_input() {
        let a = DerivedAttributes {
            dataset_row_input: Some("What is 2+2?".into()),
            ..Default::default()
        };
        let same = DerivedAttributes {
            dataset_row_input: Some("  what is 2+2? ".into()),
            ..Default::default()
        };
        let other = DerivedAttributes {
            dataset_row_input: Some("Capital of France?".into()),
            ..Default::default()
        };
        assert!(!identity_conflict(&a, &same));
        assert!(identity_conflict(&a, &other));
        assert!(!identity_conflict(&a, &DerivedAttributes::default()));
    }

    #[test]
    fn test_better_root_is_promoted() {
        let mut target = record_from(vec![finalized_span("t1", "wrapper", 0, 500)]);
        let mut leaf = finalized_span("t2", "leaf", 10, 400);
        leaf.derived.prompt_summary = Some("What is 2+2?".into());
        leaf.status = SpanStatus::Error;
        let source = record_from(vec![leaf]);

        let outcome = merge_records(&mut target, source);
        assert!(outcome.root_changed);
        assert_eq!(target.root.span_id, "leaf");
        assert_eq!(target.trace_id, "t2");
        assert_eq!(target.children.len(), 1);
        assert_eq!(target.children[0].span_id, "wrapper");
        assert_eq!(target.status, SpanStatus::Error);
    }

    #[test]
    fn test_score_ties_prefer_longest_span() {
        let short = || record_from(vec![finalized_span("t1", "a", 0, 10)]);
        let long = || record_from(vec![finalized_span("t1", "b", 0, 900)]);

        let mut target = short();
        let outcome = merge_records(&mut target, long());
        assert!(outcome.root_changed);
        assert_eq!(target.root.span_id, "b");

        let mut target = long();
        let outcome = merge_records(&mut target, short());
        assert!(!outcome.root_changed);
        assert_eq!(target.root.span_id, "b");
    }

    #[test]
    fn test_equal_spans_tie_on_span_id() {
        let mut target = record_from(vec![finalized_span("t1", "b", 0, 100)]);
        merge_records(&mut target, record_from(vec![finalized_span("t1", "a", 0, 100)]));
        assert_eq!(target.root.span_id, "a");
    }

    #[test]
    fn test_overflowing_token_sum_keeps_reported_total() {
        let mut fields = DerivedAttributes {
            prompt_tokens: Some(u64::MAX),
            completion_tokens: Some(1),
            total_tokens: Some(42),
            ..Default::default()
        };
        finalize_totals(&mut fields);
        assert_eq!(fields.total_tokens, Some(42));

        fields.prompt_tokens = Some(40);
        finalize_totals(&mut fields);
        assert_eq!(fields.total_tokens, Some(41));
    }

    #[test]
    fn test_duplicate_spans_keep_first_occurrence() {
        let mut target = record_from(vec![finalized_span("t1", "a", 0, 10)]);
        let mut again = finalized_span("t1", "a", 0, 10);
        again.name = "renamed".into();
        let source = record_from(vec![again]);

        merge_records(&mut target, source);
        assert_eq!(target.span_count(), 1);
        assert_eq!(target.root.name, "");
    }

    #[test]
    fn test_refresh_replaces_span_copies() {
        let mut target = record_from(vec![finalized_span("t1", "a", 0, 10)]);
        let mut fresh = finalized_span("t1", "a", 0, 10);
        fresh.derived.provider_response_id = Some("prov-1".into());

        refresh_spans(&mut target, &[fresh]);
        assert_eq!(
            target.root.derived.provider_response_id.as_deref(),
            Some("prov-1")
        );
    }

    #[test]
    fn test_min_and_max_helpers() {
        assert_eq!(max_defined(Some(1), None), Some(1));
        assert_eq!(max_defined(None, Some(2.5)), Some(2.5));
        assert_eq!(min_defined(Some(3), Some(2)), Some(2));
        assert_eq!(min_defined::<u32>(None, None), None);
    }
}
