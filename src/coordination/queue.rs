//! Redis-backed FIFO job queue with blocking pop.
//!
//! Producers push serialized jobs to the tail (RPUSH); workers block-pop
//! from the head (BLPOP) with a bounded wait. Delivery is FIFO per queue and
//! each dequeue consumes the job exactly once; deduplication across
//! producers and workers is the [`ControlSet`](super::ControlSet)'s job, not
//! the queue's.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::CoordinationError;
use crate::job::Job;

/// One FIFO job queue (one per job type).
#[derive(Clone)]
pub struct JobQueue {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    /// Name of the queue list.
    name: String,
}

impl JobQueue {
    /// Creates a queue client over an existing connection.
    pub fn new(redis: ConnectionManager, name: impl Into<String>) -> Self {
        Self {
            redis,
            name: name.into(),
        }
    }

    /// Enqueues a job at the tail of the queue.
    pub async fn enqueue(&self, job: &Job) -> Result<(), CoordinationError> {
        let serialized = serde_json::to_string(job)?;
        let mut conn = self.redis.clone();
        conn.rpush::<_, _, ()>(&self.name, serialized).await?;
        Ok(())
    }

    /// Enqueues multiple jobs in a single pipelined operation.
    pub async fn enqueue_batch(&self, jobs: &[Job]) -> Result<(), CoordinationError> {
        if jobs.is_empty() {
            return Ok(());
        }

        let serialized: Result<Vec<String>, _> = jobs.iter().map(serde_json::to_string).collect();
        let serialized = serialized?;

        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        for job_data in &serialized {
            pipe.rpush(&self.name, job_data);
        }
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }

    /// Dequeues the next job, blocking until one is available or the timeout
    /// expires.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(job))` if a job was dequeued
    /// - `Ok(None)` if the timeout expired with no jobs available
    pub async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>, CoordinationError> {
        let mut conn = self.redis.clone();
        let timeout_secs = timeout.as_secs().max(1) as f64;

        let result: Option<(String, String)> = conn.blpop(&self.name, timeout_secs).await?;

        match result {
            Some((_, data)) => {
                let job: Job = serde_json::from_str(&data)?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// Returns the number of pending jobs.
    pub async fn len(&self) -> Result<usize, CoordinationError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(&self.name).await?;
        Ok(len)
    }

    /// Returns whether the queue is empty.
    pub async fn is_empty(&self) -> Result<bool, CoordinationError> {
        Ok(self.len().await? == 0)
    }

    /// Deletes every pending job.
    ///
    /// **Warning**: this permanently discards queued work. Use with caution.
    pub async fn clear(&self) -> Result<(), CoordinationError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(&self.name).await?;
        Ok(())
    }

    /// Returns the queue name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use crate::job::{Job, JobType};

    #[test]
    fn job_wire_format_roundtrip() {
        let job = Job::new("3zx-0007", JobType::Emission, 42);
        let serialized = serde_json::to_string(&job).expect("serialize");
        let parsed: Job = serde_json::from_str(&serialized).expect("deserialize");

        assert_eq!(parsed.id, job.id);
        assert_eq!(parsed.job_type, job.job_type);
        assert_eq!(parsed.row, job.row);
    }
}
