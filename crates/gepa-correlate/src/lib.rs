//! Telemetry correlation and reconciliation
//!
//! Turns a stream of fragmented, duplicated and out-of-order span lifecycle
//! notifications into a bounded set of telemetry records, one per logical
//! model/tool invocation.
//!
//! Flow of one notification:
//!
//! ```text
//! notification -> accumulator -> builder -> merger/reducer -> hydrator -> prompt diff -> buffer
//! ```
//!
//! [`CorrelationEngine`] owns all correlation state and is driven one
//! notification at a time. [`TelemetryService`] runs it on a tokio task.

pub mod accumulator;
pub mod buffer;
pub mod builder;
pub mod diff;
pub mod engine;
pub mod hydrate;
pub mod keys;
pub mod merge;
pub mod record;
pub mod replay;
pub mod service;

#[cfg(test)]
mod testing;

pub use diff::{DiffKind, DiffLine};
pub use engine::{CorrelationEngine, EngineStats};
pub use hydrate::{Hydration, MatchSource};
pub use record::TelemetryRecord;
pub use replay::{read_notifications_from_file, NotificationReplay, ReplayConfig};
pub use service::{
    ServiceCommand, ServiceConfig, ServiceError, ServiceResult, TelemetryHandle,
    TelemetryService, TelemetrySnapshot,
};

use gepa_core::TelemetrySettings;

/// Correlation configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationConfig {
    /// Maximum records kept in the buffer
    pub max_records: usize,

    /// Maximum raw spans kept for inspection
    pub max_raw_spans: usize,

    /// Maximum lines per prompt diff
    pub diff_max_lines: usize,

    /// Role used for prompt diffing when a record carries none
    pub default_role: String,

    /// Span name suffixes marking internal sub-calls
    pub sub_call_suffixes: Vec<String>,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self::from(&TelemetrySettings::default())
    }
}

impl From<&TelemetrySettings> for CorrelationConfig {
    fn from(settings: &TelemetrySettings) -> Self {
        Self {
            max_records: settings.max_records,
            max_raw_spans: settings.max_raw_spans,
            diff_max_lines: settings.diff_max_lines,
            default_role: settings.default_role.clone(),
            sub_call_suffixes: settings.sub_call_suffixes.clone(),
        }
    }
}
