//! Kill signals: asynchronous preemption requests for stuck workers.
//!
//! The watchdog adds a signal when a job exceeds its deadline. Two
//! independent consumers race to remove it: the pool manager (which spawns a
//! replacement worker) and the targeted worker itself (which exits at its
//! next checkpoint). Consumption is delete-on-read at member granularity:
//! SREM's return value decides which consumer won, so a signal is never
//! processed twice.

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::CoordinationError;
use crate::job::JobType;

/// Why a kill signal was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillReason {
    /// The job ran longer than the configured maximum duration.
    DeadlineExceeded,
}

impl std::fmt::Display for KillReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KillReason::DeadlineExceeded => write!(f, "deadline_exceeded"),
        }
    }
}

/// A preemption request targeting a specific worker/job pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSignal {
    /// Name of the worker that owns the stuck job.
    pub worker_id: String,
    /// Pipeline the job belongs to.
    pub job_type: JobType,
    /// Identity of the stuck job.
    pub job_id: String,
    /// When the signal was emitted.
    pub timestamp: DateTime<Utc>,
    /// Why the signal was emitted.
    pub reason: KillReason,
}

impl KillSignal {
    /// Creates a signal stamped with the current time.
    pub fn new(
        worker_id: impl Into<String>,
        job_type: JobType,
        job_id: impl Into<String>,
        reason: KillReason,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            job_type,
            job_id: job_id.into(),
            timestamp: Utc::now(),
            reason,
        }
    }
}

/// Client for the pending kill-signal set.
#[derive(Clone)]
pub struct KillSwitch {
    redis: ConnectionManager,
    key: String,
}

impl KillSwitch {
    /// Creates a kill-switch client over an existing connection.
    pub fn new(redis: ConnectionManager, key: impl Into<String>) -> Self {
        Self {
            redis,
            key: key.into(),
        }
    }

    /// Emits a kill signal.
    pub async fn send(&self, signal: &KillSignal) -> Result<(), CoordinationError> {
        let serialized = serde_json::to_string(signal)?;
        let mut conn = self.redis.clone();
        conn.sadd::<_, _, ()>(&self.key, serialized).await?;
        Ok(())
    }

    /// Consumes every pending signal this caller wins the removal race for.
    ///
    /// Unparseable members are removed and skipped so they cannot wedge the
    /// drain forever.
    pub async fn drain(&self) -> Result<Vec<KillSignal>, CoordinationError> {
        let mut conn = self.redis.clone();
        let members: Vec<String> = conn.smembers(&self.key).await?;

        let mut consumed = Vec::new();
        for member in members {
            let removed: i64 = conn.srem(&self.key, &member).await?;
            if removed != 1 {
                // Another consumer won this member.
                continue;
            }
            match serde_json::from_str::<KillSignal>(&member) {
                Ok(signal) => consumed.push(signal),
                Err(e) => {
                    warn!(error = %e, "Discarding malformed kill signal");
                }
            }
        }

        Ok(consumed)
    }

    /// Consumes the first pending signal addressed to the given worker, if
    /// this caller wins the removal race for it.
    pub async fn take_for_worker(
        &self,
        worker_id: &str,
    ) -> Result<Option<KillSignal>, CoordinationError> {
        let mut conn = self.redis.clone();
        let members: Vec<String> = conn.smembers(&self.key).await?;

        for member in members {
            let signal = match serde_json::from_str::<KillSignal>(&member) {
                Ok(signal) => signal,
                // Malformed members are left for drain() to discard.
                Err(_) => continue,
            };
            if signal.worker_id != worker_id {
                continue;
            }
            let removed: i64 = conn.srem(&self.key, &member).await?;
            if removed == 1 {
                return Ok(Some(signal));
            }
        }

        Ok(None)
    }

    /// Returns the number of pending signals.
    pub async fn pending(&self) -> Result<usize, CoordinationError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.scard(&self.key).await?;
        Ok(len)
    }

    /// Deletes every pending signal.
    pub async fn clear(&self) -> Result<(), CoordinationError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(&self.key).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_signal_wire_format() {
        let signal = KillSignal::new(
            "conference-worker-3",
            JobType::Conference,
            "3zx-0099",
            KillReason::DeadlineExceeded,
        );

        let json = serde_json::to_string(&signal).expect("serialize");
        assert!(json.contains("\"worker_id\":\"conference-worker-3\""));
        assert!(json.contains("\"job_type\":\"conference\""));
        assert!(json.contains("\"reason\":\"deadline_exceeded\""));

        let parsed: KillSignal = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.worker_id, signal.worker_id);
        assert_eq!(parsed.job_id, "3zx-0099");
        assert_eq!(parsed.reason, KillReason::DeadlineExceeded);
    }

    #[test]
    fn kill_reason_display() {
        assert_eq!(KillReason::DeadlineExceeded.to_string(), "deadline_exceeded");
    }
}
