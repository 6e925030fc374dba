//! Producer-side dedup discipline.
//!
//! Producers share the workers' identity space: before a job may enter a
//! queue, its identity is probed against the control set with one atomic
//! add. An identity that is already present is being executed by a worker
//! right now, so the job is dropped instead of re-enqueued. The probe marker
//! is removed again immediately; the durable lock entry for an identity is
//! created by the worker that dequeues the job and removed when that worker
//! finishes, so "at most one in-flight execution per identity" is enforced
//! entirely through the control set, never through queue semantics.

use tracing::{debug, info};

use crate::coordination::{ControlSet, CoordinationError, JobQueue};
use crate::job::{Job, JobType};

/// Enqueues jobs with the mandatory dedup check.
#[derive(Clone)]
pub struct Producer {
    control: ControlSet,
    conference_queue: JobQueue,
    emission_queue: JobQueue,
}

impl Producer {
    /// Creates a producer over the shared control set and per-type queues.
    pub fn new(control: ControlSet, conference_queue: JobQueue, emission_queue: JobQueue) -> Self {
        Self {
            control,
            conference_queue,
            emission_queue,
        }
    }

    fn queue_for(&self, job_type: JobType) -> &JobQueue {
        match job_type {
            JobType::Conference => &self.conference_queue,
            JobType::Emission => &self.emission_queue,
        }
    }

    /// Submits a job unless its identity is currently being executed.
    ///
    /// Returns `true` when the job was enqueued, `false` when a worker holds
    /// the identity's lock and the job was dropped. The probe is a single
    /// atomic add whose insert is undone right away: a queued duplicate can
    /// still slip through between poll cycles, and the worker-side lock
    /// acquire is what drops it before it executes twice.
    pub async fn submit(&self, job: Job) -> Result<bool, CoordinationError> {
        if !self.control.acquire(&job.id).await? {
            debug!(job_id = %job.id, job_type = %job.job_type, "Job already in flight, skipping");
            return Ok(false);
        }
        // The insert was only a membership probe; the dequeuing worker owns
        // the real lock entry.
        self.control.release(&job.id).await?;

        self.queue_for(job.job_type).enqueue(&job).await?;

        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            row = job.row,
            "Job enqueued"
        );
        Ok(true)
    }

    /// Releases the identity of a job whose source row reached a terminal
    /// status.
    ///
    /// Worker locks release on every normal exit path; this is the janitor
    /// for entries leaked by a crashed worker process, which would otherwise
    /// block the identity forever. Returns `true` if an entry was removed.
    pub async fn clear_finished(&self, id: &str) -> Result<bool, CoordinationError> {
        let removed = self.control.release(id).await?;
        if removed {
            debug!(job_id = %id, "Leaked control entry cleaned up for finished job");
        }
        Ok(removed)
    }

    /// Returns the shared control set.
    pub fn control(&self) -> &ControlSet {
        &self.control
    }
}
