//! Notification replay from JSONL files
//!
//! Recorded span notifications, one JSON object per line, are fed to a
//! running [`TelemetryService`](crate::service::TelemetryService) so the
//! engine can be exercised without a live optimization run.

use crate::service::TelemetryHandle;
use chrono::{DateTime, Utc};
use gepa_core::SpanNotification;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

/// Longest pause between two replayed notifications
const MAX_DELAY_MS: u64 = 10_000;

/// Configuration for notification replay
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Path to the JSONL file containing notifications
    pub input_file: PathBuf,

    /// Speed multiplier for replay timing
    /// - 1.0 = real-time (preserve original timing between notifications)
    /// - 0.0 = instant (no delays)
    /// - 2.0 = 2x speed (half the delay)
    pub speed_multiplier: f64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            input_file: PathBuf::new(),
            speed_multiplier: 1.0,
        }
    }
}

/// Replays a notification log into the telemetry service
pub struct NotificationReplay {
    config: ReplayConfig,
    running: Arc<AtomicBool>,
}

impl NotificationReplay {
    pub fn new(config: ReplayConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stop the replay
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Send every notification of the file to `handle`.
    ///
    /// Blank lines and `#` comments are skipped; malformed lines are logged
    /// and skipped. Returns the number of notifications sent.
    pub async fn run(&self, handle: &TelemetryHandle) -> anyhow::Result<u64> {
        let file = tokio::fs::File::open(&self.config.input_file).await?;
        let mut lines = BufReader::new(file).lines();
        self.running.store(true, Ordering::Relaxed);

        let mut sent = 0u64;
        let mut line_number = 0u64;
        let mut last_timestamp = None;

        info!(
            "Starting replay from {:?} (speed: {}x)",
            self.config.input_file, self.config.speed_multiplier
        );

        while let Some(line) = lines.next_line().await? {
            line_number += 1;

            if !self.running.load(Ordering::Relaxed) {
                info!("Replay stopped at line {}", line_number);
                break;
            }

            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let notification: SpanNotification = match serde_json::from_str(line) {
                Ok(n) => n,
                Err(err) => {
                    warn!("Failed to parse notification at line {}: {}", line_number, err);
                    debug!("Line content: {}", line);
                    continue;
                }
            };

            if let Some(last) = last_timestamp {
                self.pace(last, notification.timestamp).await;
            }
            last_timestamp = Some(notification.timestamp);

            handle.notify(notification).await?;
            sent += 1;
        }

        self.running.store(false, Ordering::Relaxed);
        info!(
            "Replay complete: {} notifications from {:?}",
            sent, self.config.input_file
        );
        Ok(sent)
    }

    async fn pace(&self, last: DateTime<Utc>, current: DateTime<Utc>) {
        if self.config.speed_multiplier <= 0.0 {
            return;
        }
        let delay = current.signed_duration_since(last).num_milliseconds();
        if delay <= 0 {
            return;
        }
        let adjusted = (delay as f64 / self.config.speed_multiplier) as u64;
        let capped = adjusted.min(MAX_DELAY_MS);
        if capped > 0 {
            tokio::time::sleep(tokio::time::Duration::from_millis(capped)).await;
        }
    }
}

/// Read notifications from a JSONL file without replaying them
pub async fn read_notifications_from_file(path: &Path) -> anyhow::Result<Vec<SpanNotification>> {
    let file = tokio::fs::File::open(path).await?;
    let mut lines = BufReader::new(file).lines();

    let mut notifications = Vec::new();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match serde_json::from_str::<SpanNotification>(line) {
            Ok(n) => notifications.push(n),
            Err(err) => warn!("Failed to parse notification: {}", err),
        }
    }

    Ok(notifications)
}
