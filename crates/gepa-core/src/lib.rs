//! GEPA Core - span, attribute, dataset and configuration types
//!
//! This crate provides the foundational types shared by the console:
//!
//! - **Events**: span lifecycle notifications as they arrive on the wire
//! - **Spans**: coalesced spans and their status
//! - **Attributes**: probe-driven derivation of normalized span fields
//! - **Dataset**: read-only dataset lookup used for hydration
//! - **Config**: TOML configuration discovery and validation

pub mod attributes;
pub mod config;
pub mod dataset;
pub mod events;
pub mod span;

// Re-export commonly used types
pub use attributes::{AttributeDeriver, DerivedAttributes, ProbeDeriver, PromptMessage};
pub use config::{ConfigError, ConfigLoader, ConsoleConfig, TelemetrySettings};
pub use dataset::{normalize_input, DatasetError, DatasetLookup, DatasetRow};
pub use events::{NotificationStatus, SpanNotification};
pub use span::{Span, SpanStatus};

/// Console version
pub const CONSOLE_VERSION: &str = env!("CARGO_PKG_VERSION");
