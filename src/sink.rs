//! Result sink: the FIFO list carrying worker results to the write-back
//! component.
//!
//! Workers (through their flow implementations) push [`ResultRecord`]s; the
//! batched writer pops them. Records are tagged `UPDATE` or `APPEND_ERROR`
//! on the wire so the consumer can route them without knowing the producing
//! flow.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::coordination::CoordinationError;

/// One record flowing from a worker to the write-back component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum ResultRecord {
    /// Update named columns of the originating row.
    #[serde(rename = "UPDATE")]
    Update {
        /// Row reference carried through from the job.
        row: u64,
        /// Column names to update, parallel to `values`.
        columns: Vec<String>,
        /// New cell values, parallel to `columns`.
        values: Vec<String>,
    },
    /// Append one row to the error log.
    #[serde(rename = "APPEND_ERROR")]
    AppendError {
        /// Cell values of the appended row.
        values: Vec<String>,
    },
}

/// Client for the result list.
#[derive(Clone)]
pub struct ResultSink {
    redis: ConnectionManager,
    queue: String,
}

impl ResultSink {
    /// Creates a sink client over an existing connection.
    pub fn new(redis: ConnectionManager, queue: impl Into<String>) -> Self {
        Self {
            redis,
            queue: queue.into(),
        }
    }

    /// Pushes a record to the tail of the result list.
    pub async fn push(&self, record: &ResultRecord) -> Result<(), CoordinationError> {
        let serialized = serde_json::to_string(record)?;
        let mut conn = self.redis.clone();
        conn.rpush::<_, _, ()>(&self.queue, serialized).await?;
        Ok(())
    }

    /// Pushes a row-update record.
    pub async fn push_update(
        &self,
        row: u64,
        columns: Vec<String>,
        values: Vec<String>,
    ) -> Result<(), CoordinationError> {
        self.push(&ResultRecord::Update {
            row,
            columns,
            values,
        })
        .await
    }

    /// Pushes an error-log append record.
    pub async fn push_append_error(&self, values: Vec<String>) -> Result<(), CoordinationError> {
        self.push(&ResultRecord::AppendError { values }).await
    }

    /// Pops the next record, blocking until one is available or the timeout
    /// expires.
    pub async fn pop(&self, timeout: Duration) -> Result<Option<ResultRecord>, CoordinationError> {
        let mut conn = self.redis.clone();
        let timeout_secs = timeout.as_secs().max(1) as f64;

        let result: Option<(String, String)> = conn.blpop(&self.queue, timeout_secs).await?;

        match result {
            Some((_, data)) => {
                let record: ResultRecord = serde_json::from_str(&data)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Returns the number of records waiting to be written back.
    pub async fn len(&self) -> Result<usize, CoordinationError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(&self.queue).await?;
        Ok(len)
    }

    /// Returns whether the result list is empty.
    pub async fn is_empty(&self) -> Result<bool, CoordinationError> {
        Ok(self.len().await? == 0)
    }
}
