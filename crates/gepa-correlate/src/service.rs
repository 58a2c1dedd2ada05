//! Telemetry service - runs the correlation engine on a tokio task
//!
//! Commands arrive on an mpsc channel and are processed strictly one at a
//! time; after each command a snapshot of the engine is broadcast to every
//! subscriber.

use crate::engine::{CorrelationEngine, EngineStats};
use crate::record::TelemetryRecord;
use gepa_core::{DatasetLookup, Span, SpanNotification};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Service errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Telemetry service already running")]
    AlreadyRunning,

    #[error("Telemetry service is not running")]
    NotRunning,

    #[error("Telemetry task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Work for the engine task
#[derive(Debug)]
pub enum ServiceCommand {
    /// Ingest a span notification
    Notify(SpanNotification),
    /// Swap in a new dataset lookup and re-hydrate
    ReplaceDataset(DatasetLookup),
    /// Finalize pending spans (run ended)
    Flush,
}

/// Engine state published after each command
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    /// Records, newest first
    pub records: Vec<TelemetryRecord>,
    /// Raw spans, most recently touched first
    pub raw_spans: Vec<Span>,
    pub stats: EngineStats,
}

impl TelemetrySnapshot {
    pub fn capture(engine: &CorrelationEngine) -> Self {
        Self {
            records: engine.records().into_iter().cloned().collect(),
            raw_spans: engine.raw_spans(),
            stats: engine.stats(),
        }
    }
}

/// Service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Channel buffer size for commands
    pub command_buffer_size: usize,

    /// Channel buffer size for snapshots
    pub snapshot_buffer_size: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            command_buffer_size: 1024,
            snapshot_buffer_size: 64,
        }
    }
}

/// Cloneable sender side of a running service
#[derive(Debug, Clone)]
pub struct TelemetryHandle {
    tx: mpsc::Sender<ServiceCommand>,
}

impl TelemetryHandle {
    pub async fn send(&self, command: ServiceCommand) -> ServiceResult<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| ServiceError::NotRunning)
    }

    pub async fn notify(&self, notification: SpanNotification) -> ServiceResult<()> {
        self.send(ServiceCommand::Notify(notification)).await
    }

    pub async fn replace_dataset(&self, lookup: DatasetLookup) -> ServiceResult<()> {
        self.send(ServiceCommand::ReplaceDataset(lookup)).await
    }

    pub async fn flush(&self) -> ServiceResult<()> {
        self.send(ServiceCommand::Flush).await
    }
}

/// The engine task and its channels
pub struct TelemetryService {
    config: ServiceConfig,

    /// Engine, held here until the service starts
    engine: Option<CorrelationEngine>,

    /// Broadcast channel for snapshots
    snapshots: broadcast::Sender<Arc<TelemetrySnapshot>>,

    /// Shutdown signal
    shutdown_tx: Option<broadcast::Sender<()>>,

    task: Option<JoinHandle<CorrelationEngine>>,
}

impl TelemetryService {
    pub fn new(engine: CorrelationEngine, config: ServiceConfig) -> Self {
        let (snapshots, _) = broadcast::channel(config.snapshot_buffer_size.max(1));
        Self {
            config,
            engine: Some(engine),
            snapshots,
            shutdown_tx: None,
            task: None,
        }
    }

    /// Subscribe to snapshots
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<TelemetrySnapshot>> {
        self.snapshots.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Start the engine task. A service runs at most once.
    pub fn start(&mut self) -> ServiceResult<TelemetryHandle> {
        let mut engine = self.engine.take().ok_or(ServiceError::AlreadyRunning)?;

        let (tx, mut rx) = mpsc::channel::<ServiceCommand>(self.config.command_buffer_size.max(1));
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx);
        let snapshots = self.snapshots.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(command) = rx.recv() => {
                        apply(&mut engine, command);
                        publish(&engine, &snapshots);
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Telemetry service shutdown signal received");
                        break;
                    }
                    else => break,
                }
            }

            // Commands already queued still count
            while let Ok(command) = rx.try_recv() {
                apply(&mut engine, command);
            }
            engine.flush_pending();
            publish(&engine, &snapshots);

            info!("Telemetry service stopped with {} records", engine.len());
            engine
        });
        self.task = Some(task);

        info!("Telemetry service started");
        Ok(TelemetryHandle { tx })
    }

    /// Stop the task, flush pending spans and hand the engine back
    pub async fn stop(&mut self) -> ServiceResult<CorrelationEngine> {
        let task = self.task.take().ok_or(ServiceError::NotRunning)?;
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        Ok(task.await?)
    }
}

fn apply(engine: &mut CorrelationEngine, command: ServiceCommand) {
    match command {
        ServiceCommand::Notify(notification) => {
            let touched = engine.ingest(&notification);
            debug!(
                "Notification {}/{} touched {} records",
                notification.trace_id,
                notification.span_id,
                touched.len()
            );
        }
        ServiceCommand::ReplaceDataset(lookup) => engine.set_dataset_lookup(lookup),
        ServiceCommand::Flush => {
            engine.flush_pending();
        }
    }
}

fn publish(engine: &CorrelationEngine, snapshots: &broadcast::Sender<Arc<TelemetrySnapshot>>) {
    // No receivers is fine
    let _ = snapshots.send(Arc::new(TelemetrySnapshot::capture(engine)));
}
