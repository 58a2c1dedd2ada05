//! Span lifecycle notifications - the inbound stream the engine consumes
//!
//! A single span is usually described by several notifications (a `start`,
//! then an `end` or `error`, sometimes repeated). They all share a `spanId`
//! and are coalesced downstream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Lifecycle phase reported by a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Start,
    End,
    Error,
}

impl NotificationStatus {
    /// Whether this notification finalizes the span
    pub fn is_terminal(&self) -> bool {
        matches!(self, NotificationStatus::End | NotificationStatus::Error)
    }
}

/// One span lifecycle notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpanNotification {
    /// Trace the span belongs to
    pub trace_id: String,

    /// Span identity (notifications sharing it coalesce)
    pub span_id: String,

    /// Parent span, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,

    /// Operation name
    #[serde(default)]
    pub name: String,

    /// Lifecycle phase
    pub status: NotificationStatus,

    /// Wall-clock time of the notification (epoch milliseconds on the wire)
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,

    /// Duration reported by the producer
    #[serde(
        default,
        deserialize_with = "lenient_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub duration_ms: Option<u64>,

    /// Raw, provider-specific attribute bag
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,

    /// Error description for `error` notifications
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl SpanNotification {
    /// Create a notification with no parent, duration or attributes
    pub fn new(
        trace_id: impl Into<String>,
        span_id: impl Into<String>,
        status: NotificationStatus,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            span_id: span_id.into(),
            parent_span_id: None,
            name: String::new(),
            status,
            timestamp,
            duration_ms: None,
            attributes: Map::new(),
            error_message: None,
        }
    }

    pub fn start(
        trace_id: impl Into<String>,
        span_id: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self::new(trace_id, span_id, NotificationStatus::Start, timestamp)
    }

    pub fn end(
        trace_id: impl Into<String>,
        span_id: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self::new(trace_id, span_id, NotificationStatus::End, timestamp)
    }

    pub fn error(
        trace_id: impl Into<String>,
        span_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        message: impl Into<String>,
    ) -> Self {
        let mut notification = Self::new(trace_id, span_id, NotificationStatus::Error, timestamp);
        notification.error_message = Some(message.into());
        notification
    }

    /// Set the operation name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the parent span
    pub fn with_parent(mut self, parent_span_id: impl Into<String>) -> Self {
        self.parent_span_id = Some(parent_span_id.into());
        self
    }

    /// Set the reported duration
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Add one raw attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Accept integral or fractional millisecond counts; anything else is dropped.
fn lenient_millis<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0)
                .map(|f| f.round() as u64)
        }),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| *f >= 0.0)
            .map(|f| f.round() as u64),
        _ => None,
    }))
}
