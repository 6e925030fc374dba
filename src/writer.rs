//! Batched write-back of worker results.
//!
//! Drains the result sink into two batches (cell updates for the main sheet
//! and appended rows for the error log) and flushes each when it reaches
//! its size threshold or when the sink goes quiet with work buffered. The
//! actual spreadsheet API lives behind [`WriteBackend`]; this module only
//! owns batching, flush retries and failed-batch persistence.
//!
//! A failed flush keeps the batch in memory for the next cycle and writes a
//! JSON snapshot to disk so the data can be reprocessed manually if the
//! process dies before the backend recovers.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::coordination::CoordinationError;
use crate::sink::{ResultRecord, ResultSink};
use crate::utils::{retry_with_backoff, RetryPolicy};

/// Errors that can occur in the write-back component.
#[derive(Debug, Error)]
pub enum WriterError {
    /// The write backend rejected a batch.
    #[error("Write backend failed: {0}")]
    Backend(String),

    /// Failed to persist a failed batch to disk.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to serialize a batch snapshot.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The result sink failed.
    #[error("Coordination store error: {0}")]
    Coordination(#[from] CoordinationError),
}

/// One cell write against the main sheet.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CellUpdate {
    /// Target row.
    pub row: u64,
    /// Target column name.
    pub column: String,
    /// New cell value.
    pub value: String,
}

/// The external write target (the spreadsheet API stays out of this crate).
#[async_trait]
pub trait WriteBackend: Send + Sync + 'static {
    /// Applies a batch of cell updates to the main sheet.
    async fn apply_updates(&self, updates: &[CellUpdate]) -> Result<(), WriterError>;

    /// Appends rows to the error log sheet.
    async fn append_rows(&self, rows: &[Vec<String>]) -> Result<(), WriterError>;
}

/// Batching thresholds and failure handling knobs.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Flush the update batch at this many cells.
    pub max_update_batch: usize,
    /// Flush the append batch at this many rows.
    pub max_append_batch: usize,
    /// How long to wait on the sink before flushing whatever is buffered.
    pub max_wait: Duration,
    /// Directory receiving failed-batch snapshots.
    pub failed_dir: PathBuf,
    /// Retry schedule for a failing flush.
    pub flush_retry: RetryPolicy,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_update_batch: 200,
            max_append_batch: 50,
            max_wait: Duration::from_secs(5),
            failed_dir: PathBuf::from("logs"),
            flush_retry: RetryPolicy::new(4),
        }
    }
}

/// In-memory batches awaiting flush.
#[derive(Debug, Default)]
struct Batches {
    updates: Vec<CellUpdate>,
    appends: Vec<Vec<String>>,
}

impl Batches {
    fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.appends.is_empty()
    }
}

/// The batching and flushing engine, independent of the sink.
struct WriterCore<B: WriteBackend> {
    backend: B,
    config: WriterConfig,
}

impl<B: WriteBackend> WriterCore<B> {
    /// Folds one record into the batches.
    fn ingest(batches: &mut Batches, record: ResultRecord) {
        match record {
            ResultRecord::Update {
                row,
                columns,
                values,
            } => {
                if columns.len() != values.len() {
                    warn!(
                        row,
                        columns = columns.len(),
                        values = values.len(),
                        "Update record has mismatched columns/values, extra entries dropped"
                    );
                }
                for (column, value) in columns.into_iter().zip(values) {
                    batches.updates.push(CellUpdate { row, column, value });
                }
            }
            ResultRecord::AppendError { values } => {
                batches.appends.push(values);
            }
        }
    }

    /// Whether the batches should be flushed now.
    fn should_flush(&self, batches: &Batches, sink_idle: bool) -> bool {
        batches.updates.len() >= self.config.max_update_batch
            || batches.appends.len() >= self.config.max_append_batch
            || (sink_idle && !batches.is_empty())
    }

    async fn flush_updates(&self, batches: &mut Batches) {
        if batches.updates.is_empty() {
            return;
        }
        info!(cells = batches.updates.len(), "Flushing update batch");

        let result = retry_with_backoff(self.config.flush_retry, "apply_updates", || {
            self.backend.apply_updates(&batches.updates)
        })
        .await;

        match result {
            Ok(()) => {
                info!(cells = batches.updates.len(), "Update batch flushed");
                batches.updates.clear();
            }
            Err(e) => {
                error!(
                    error = %e,
                    cells = batches.updates.len(),
                    "Update flush failed, batch kept for the next cycle"
                );
                self.persist_failed_batch("updates", serde_json::json!(batches.updates), &e)
                    .await;
            }
        }
    }

    async fn flush_appends(&self, batches: &mut Batches) {
        if batches.appends.is_empty() {
            return;
        }
        info!(rows = batches.appends.len(), "Flushing error-log batch");

        let result = retry_with_backoff(self.config.flush_retry, "append_rows", || {
            self.backend.append_rows(&batches.appends)
        })
        .await;

        match result {
            Ok(()) => {
                info!(rows = batches.appends.len(), "Error-log batch flushed");
                batches.appends.clear();
            }
            Err(e) => {
                error!(
                    error = %e,
                    rows = batches.appends.len(),
                    "Error-log flush failed, batch kept for the next cycle"
                );
                self.persist_failed_batch("appends", serde_json::json!(batches.appends), &e)
                    .await;
            }
        }
    }

    /// Writes a JSON snapshot of a failed batch for manual reprocessing.
    async fn persist_failed_batch(&self, kind: &str, data: serde_json::Value, cause: &WriterError) {
        let timestamp = Utc::now().format("%Y%m%dT%H%M%S%3fZ").to_string();
        let path = self
            .config
            .failed_dir
            .join(format!("failed_{}_{}.json", kind, timestamp));

        let snapshot = serde_json::json!({
            "timestamp": timestamp,
            "kind": kind,
            "data": data,
            "error": cause.to_string(),
        });

        let write = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, serde_json::to_vec_pretty(&snapshot)?).await?;
            Ok::<_, WriterError>(())
        };

        match write.await {
            Ok(()) => {
                warn!(path = %path.display(), "Failed batch persisted for manual reprocessing");
            }
            Err(e) => {
                error!(error = %e, "Could not persist failed batch to disk");
            }
        }
    }
}

/// Consumes the result sink and writes batches through the backend.
pub struct Writer<B: WriteBackend> {
    sink: ResultSink,
    core: WriterCore<B>,
}

impl<B: WriteBackend> Writer<B> {
    /// Creates a writer.
    pub fn new(sink: ResultSink, backend: B, config: WriterConfig) -> Self {
        Self {
            sink,
            core: WriterCore { backend, config },
        }
    }

    /// Drains the sink until shutdown, flushing per the thresholds. Buffered
    /// work is flushed one final time before returning.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            max_update_batch = self.core.config.max_update_batch,
            max_append_batch = self.core.config.max_append_batch,
            "Writer started"
        );
        let mut batches = Batches::default();

        loop {
            let popped = tokio::select! {
                res = self.sink.pop(self.core.config.max_wait) => res,
                _ = shutdown_rx.recv() => break,
            };

            let sink_idle = match popped {
                Ok(Some(record)) => {
                    WriterCore::<B>::ingest(&mut batches, record);
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    error!(error = %e, "Failed to pop result record");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            if self.core.should_flush(&batches, sink_idle) {
                self.core.flush_updates(&mut batches).await;
                self.core.flush_appends(&mut batches).await;
            }
        }

        // Final flush so buffered results survive a graceful shutdown.
        self.core.flush_updates(&mut batches).await;
        self.core.flush_appends(&mut batches).await;
        info!("Writer stopped");
    }
}
