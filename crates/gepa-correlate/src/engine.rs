//! Correlation engine - owns every piece of correlation state
//!
//! One call to [`CorrelationEngine::ingest`] runs a notification through the
//! whole pipeline: accumulate, build or merge the bucket's record, reduce it
//! against every other record by candidate key, hydrate, diff prompts, and
//! enforce the buffer cap. Nothing here can fail; bad input degrades the
//! affected fields.

use crate::accumulator::{Migration, SpanAccumulator};
use crate::buffer::{RawSpanLog, RecordBuffer};
use crate::builder::build_record;
use crate::diff::PromptHistory;
use crate::hydrate::hydrate;
use crate::keys::candidate_keys;
use crate::merge::{merge_records, refresh_spans, MergeOutcome};
use crate::record::TelemetryRecord;
use crate::CorrelationConfig;
use gepa_core::{AttributeDeriver, DatasetLookup, ProbeDeriver, Span, SpanNotification};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Engine counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub notifications: u64,
    pub records_built: u64,
    pub merges: u64,
    pub identity_conflicts: u64,
    pub migrations: u64,
    pub evictions: u64,
}

pub struct CorrelationEngine {
    config: CorrelationConfig,
    accumulator: SpanAccumulator,
    records: RecordBuffer,
    /// Bucket -> record built from it
    bucket_records: HashMap<String, String>,
    /// Candidate key -> record
    key_index: HashMap<String, String>,
    raw_spans: RawSpanLog,
    dataset: Option<DatasetLookup>,
    next_seq: u64,
    stats: EngineStats,
}

impl CorrelationEngine {
    pub fn new(config: CorrelationConfig) -> Self {
        Self::with_deriver(config, Arc::new(ProbeDeriver))
    }

    /// Create an engine with a custom attribute deriver
    pub fn with_deriver(config: CorrelationConfig, deriver: Arc<dyn AttributeDeriver>) -> Self {
        Self {
            accumulator: SpanAccumulator::new(deriver),
            records: RecordBuffer::new(config.max_records),
            bucket_records: HashMap::new(),
            key_index: HashMap::new(),
            raw_spans: RawSpanLog::new(config.max_raw_spans),
            dataset: None,
            next_seq: 0,
            stats: EngineStats::default(),
            config,
        }
    }

    /// Process one notification, returning the records it touched (newest first)
    pub fn ingest(&mut self, notification: &SpanNotification) -> Vec<TelemetryRecord> {
        self.stats.notifications += 1;

        let observation = self.accumulator.observe(notification);
        if observation.changed {
            if let Some(span) = self.accumulator.span(&observation.span_id) {
                self.raw_spans.upsert(span.clone());
            }
        }

        let mut touched = Vec::new();
        if let Some(migration) = &observation.migration {
            self.stats.migrations += 1;
            touched.extend(self.migrate_record(migration));
        }
        if observation.changed && observation.finalized {
            touched.extend(self.rebuild_bucket(&observation.bucket));
        }

        if touched.is_empty() {
            return Vec::new();
        }
        self.publish(touched)
    }

    /// Finalize every pending span as partial and rebuild their buckets.
    ///
    /// Called when the run that owns the stream ends.
    pub fn flush_pending(&mut self) -> Vec<TelemetryRecord> {
        let pending = self.accumulator.pending_span_ids();
        if pending.is_empty() {
            return Vec::new();
        }

        let mut buckets: Vec<String> = Vec::new();
        for span_id in &pending {
            if let Some(bucket) = self.accumulator.finalize_partial(span_id) {
                if let Some(span) = self.accumulator.span(span_id) {
                    self.raw_spans.upsert(span.clone());
                }
                if !buckets.contains(&bucket) {
                    buckets.push(bucket);
                }
            }
        }
        info!("Flushed {} pending spans as partial", pending.len());

        let touched: Vec<String> = buckets
            .iter()
            .filter_map(|bucket| self.rebuild_bucket(bucket))
            .collect();
        self.publish(touched)
    }

    /// Replace the dataset lookup and re-hydrate every record
    pub fn set_dataset_lookup(&mut self, lookup: DatasetLookup) {
        let mut hydrated = 0usize;
        for record in self.records.iter_mut() {
            record.hydration = hydrate(&record.fields, &lookup);
            if record.hydration.is_some() {
                hydrated += 1;
            }
        }
        info!(
            "Dataset lookup replaced ({} rows), {} of {} records hydrated",
            lookup.len(),
            hydrated,
            self.records.len()
        );
        self.dataset = Some(lookup);
    }

    /// All records, newest first
    pub fn records(&self) -> Vec<&TelemetryRecord> {
        self.records.newest_first()
    }

    /// Raw spans, most recently touched first
    pub fn raw_spans(&self) -> Vec<Span> {
        self.raw_spans.spans()
    }

    pub fn record(&self, id: &str) -> Option<&TelemetryRecord> {
        self.records.get(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn config(&self) -> &CorrelationConfig {
        &self.config
    }

    /// Carry the record of a migrated bucket over to its new bucket
    fn migrate_record(&mut self, migration: &Migration) -> Option<String> {
        let from_id = self.bucket_records.remove(&migration.from)?;
        if !self.records.contains(&from_id) {
            return None;
        }

        match self.bucket_records.get(&migration.to).cloned() {
            Some(to_id) if to_id != from_id && self.records.contains(&to_id) => {
                Some(self.absorb(&from_id, &to_id))
            }
            _ => {
                self.bucket_records
                    .insert(migration.to.clone(), from_id.clone());
                Some(from_id)
            }
        }
    }

    /// Build the bucket's record and fold it into the published one, if any
    fn rebuild_bucket(&mut self, bucket: &str) -> Option<String> {
        let spans = self.accumulator.bucket_spans(bucket);
        let built = build_record(&spans, &self.config.sub_call_suffixes)?;
        self.stats.records_built += 1;

        let existing = self
            .bucket_records
            .get(bucket)
            .filter(|id| self.records.contains(id))
            .cloned();

        let id = match existing {
            Some(id) => {
                let target = self.records.get_mut(&id)?;
                refresh_spans(target, &spans);
                let outcome = merge_records(target, built);
                self.count_merge(outcome);
                id
            }
            None => {
                let mut record = built;
                record.assign_identity(self.next_seq);
                self.next_seq += 1;
                let id = record.id.clone();
                debug!("New record {} for bucket {}", id, bucket);
                self.records.insert(record);
                self.bucket_records.insert(bucket.to_string(), id.clone());
                id
            }
        };

        Some(self.reduce(&id))
    }

    /// Multi-key reduction: merge the record into the first other record
    /// sharing one of its candidate keys, then index every key of the
    /// survivor. Returns the surviving record id.
    fn reduce(&mut self, id: &str) -> String {
        let Some(record) = self.records.get(id) else {
            return id.to_string();
        };

        let hit = candidate_keys(record).iter().find_map(|key| {
            self.key_index
                .get(key)
                .filter(|other| other.as_str() != id && self.records.contains(other))
                .cloned()
        });
        let survivor = match hit {
            Some(target) => self.absorb(id, &target),
            None => id.to_string(),
        };

        if let Some(record) = self.records.get(&survivor) {
            for key in candidate_keys(record) {
                self.key_index.insert(key, survivor.clone());
            }
        }
        survivor
    }

    /// Merge record `source_id` into `target_id` and repoint every index
    /// entry. Returns the surviving id.
    fn absorb(&mut self, source_id: &str, target_id: &str) -> String {
        let Some(source) = self.records.remove(source_id) else {
            return target_id.to_string();
        };
        let Some(target) = self.records.get_mut(target_id) else {
            self.records.insert(source);
            return source_id.to_string();
        };

        let outcome = merge_records(target, source);
        self.count_merge(outcome);

        for owner in self
            .key_index
            .values_mut()
            .chain(self.bucket_records.values_mut())
        {
            if *owner == source_id {
                *owner = target_id.to_string();
            }
        }
        debug!("Record {} merged into {}", source_id, target_id);
        target_id.to_string()
    }

    fn count_merge(&mut self, outcome: MergeOutcome) {
        self.stats.merges += 1;
        if outcome.conflict {
            self.stats.identity_conflicts += 1;
        }
    }

    /// Hydrate, re-diff and trim after the touched records changed
    fn publish(&mut self, touched: Vec<String>) -> Vec<TelemetryRecord> {
        if let Some(lookup) = &self.dataset {
            for id in &touched {
                if let Some(record) = self.records.get_mut(id) {
                    record.hydration = hydrate(&record.fields, lookup);
                }
            }
        }

        self.refresh_prompt_diffs();
        self.evict();

        let mut out: Vec<TelemetryRecord> = Vec::new();
        for id in touched {
            if out.iter().any(|r| r.id == id) {
                continue;
            }
            if let Some(record) = self.records.get(&id) {
                out.push(record.clone());
            }
        }
        out.sort_by(|a, b| {
            b.recency()
                .cmp(&a.recency())
                .then_with(|| b.seq.cmp(&a.seq))
        });
        out
    }

    /// Prompt diffs depend on every earlier record of the same role, so they
    /// are recomputed over the whole buffer in chronological order
    fn refresh_prompt_diffs(&mut self) {
        let mut history =
            PromptHistory::new(self.config.default_role.clone(), self.config.diff_max_lines);
        for record in self.records.chronological_mut() {
            record.prompt_diff = history.observe(
                record.fields.role.as_deref(),
                record.fields.system_prompt.as_deref(),
            );
        }
    }

    /// Enforce the buffer cap and drop every index entry of evicted records
    fn evict(&mut self) {
        let evicted = self.records.enforce_capacity();
        if evicted.is_empty() {
            return;
        }

        for record in &evicted {
            self.key_index.retain(|_, owner| *owner != record.id);

            let buckets: Vec<String> = self
                .bucket_records
                .iter()
                .filter(|(_, owner)| **owner == record.id)
                .map(|(bucket, _)| bucket.clone())
                .collect();
            for bucket in buckets {
                self.bucket_records.remove(&bucket);
                self.accumulator.evict_bucket(&bucket);
            }
        }

        self.stats.evictions += evicted.len() as u64;
        debug!(
            "Evicted {} records, {} remain",
            evicted.len(),
            self.records.len()
        );
    }
}

impl Default for CorrelationEngine {
    fn default() -> Self {
        Self::new(CorrelationConfig::default())
    }
}
