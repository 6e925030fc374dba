//! The seam between the orchestration core and the browser-automation flows.
//!
//! The core never drives a portal itself. Each worker owns one automation
//! session (a logged-in browser context, held exclusively by that worker) and
//! delegates every job to a [`JobProcessor`] implementation supplied by the
//! host. The processor reports a [`ProcessOutcome`] per job; infrastructure
//! failures that should end the attempt are returned as errors.

use async_trait::async_trait;
use thiserror::Error;

use crate::job::{Job, JobType};

// Re-exported so host crates can implement `JobProcessor` without depending
// on tokio-util themselves.
pub use tokio_util::sync::CancellationToken;

/// Errors surfaced by a processor implementation.
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// The automation session could not be opened (login failure, browser
    /// launch failure). Fatal to the worker that requested it.
    #[error("Failed to open automation session: {0}")]
    SessionSetup(String),

    /// The worker function failed in a way it could not express as a
    /// business outcome. Treated as a failed attempt; never fatal to the
    /// worker.
    #[error("Worker function failed: {0}")]
    Execution(String),
}

/// Outcome of processing one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The job was handled; results (if any) went to the result sink.
    Completed,
    /// The job was handled but the business operation failed. The failure
    /// is already recorded via the result sink; the job is not retried.
    Failed {
        /// Human-readable failure description for the logs.
        reason: String,
    },
    /// The attempt hit a transient session/navigation failure and the job
    /// should be pushed back onto its queue for another worker.
    Retry {
        /// Human-readable description of the transient failure.
        reason: String,
    },
}

/// The external worker function invoked by the pool, one call per job.
///
/// Implementations encapsulate everything portal-specific: navigation, form
/// filling, scraping, and pushing results to the sink. The `cancel` token is
/// a cooperative preemption hint: it is cancelled when a kill signal arrives
/// for the job mid-flight, and well-behaved implementations should check it
/// at their own safe points and abort I/O promptly. The core never aborts
/// the call forcibly.
#[async_trait]
pub trait JobProcessor: Send + Sync + 'static {
    /// The per-worker automation session. Owned exclusively by one worker
    /// for its entire lifetime; never shared.
    type Session: Send + 'static;

    /// Opens a fresh session for a new worker (browser launch + login).
    async fn open_session(&self, job_type: JobType) -> Result<Self::Session, ProcessorError>;

    /// Processes one job against the worker's session.
    async fn process(
        &self,
        session: &mut Self::Session,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, ProcessorError>;
}
