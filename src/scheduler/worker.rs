//! The worker unit: one loop, one automation session, one job at a time.
//!
//! Loop discipline per job:
//!
//! 1. blocking pop with a bounded wait (timeout loops back to idle)
//! 2. atomic lock acquire on the job identity: a duplicate already in
//!    flight is dropped silently, without touching the lock this unit never
//!    held
//! 3. register with the watchdog, invoke the worker function, unregister
//! 4. release the lock unconditionally, on every exit path including panics
//!
//! Between jobs (and via a cancellation hint, mid-job) the unit checks for a
//! kill signal addressed to it and exits cooperatively when one arrives; the
//! pool manager will already have raced a replacement.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coordination::{ControlSet, JobQueue, KillSwitch};
use crate::job::{Job, JobType};
use crate::metrics;
use crate::processor::{JobProcessor, ProcessOutcome};
use crate::utils::{retry_with_backoff, RetryPolicy};

use super::watchdog::Watchdog;

/// Consecutive dequeue failures tolerated before the unit gives up and lets
/// the liveness scan replace it.
const MAX_DEQUEUE_FAILURES: u32 = 3;

/// Pause after a failed dequeue before trying again.
const DEQUEUE_FAILURE_BACKOFF: Duration = Duration::from_secs(10);

/// How often the mid-job watcher polls for a kill signal.
const KILL_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// A single worker unit bound to one job type.
pub(crate) struct Worker<P: JobProcessor> {
    pub(crate) name: String,
    pub(crate) job_type: JobType,
    pub(crate) queue: JobQueue,
    pub(crate) control: ControlSet,
    pub(crate) kill: KillSwitch,
    pub(crate) watchdog: Arc<Watchdog>,
    pub(crate) processor: Arc<P>,
    pub(crate) shutdown_rx: broadcast::Receiver<()>,
    pub(crate) dequeue_timeout: Duration,
}

impl<P: JobProcessor> Worker<P> {
    /// Main worker loop. Runs until shutdown, a kill signal, or a fatal
    /// session/store failure.
    pub(crate) async fn run(mut self) {
        info!(worker = %self.name, job_type = %self.job_type, "Worker started");

        let session_policy = RetryPolicy::new(3).with_delay(Duration::from_secs(5));
        let mut session = match retry_with_backoff(session_policy, "open_session", || {
            self.processor.open_session(self.job_type)
        })
        .await
        {
            Ok(session) => session,
            Err(e) => {
                error!(
                    worker = %self.name,
                    error = %e,
                    "Could not open automation session, worker exiting"
                );
                return;
            }
        };

        let mut dequeue_failures: u32 = 0;

        loop {
            // Pool shutdown check (non-blocking).
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker = %self.name, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            // Kill-signal checkpoint between jobs.
            match self.kill.take_for_worker(&self.name).await {
                Ok(Some(signal)) => {
                    warn!(
                        worker = %self.name,
                        job_id = %signal.job_id,
                        reason = %signal.reason,
                        "Kill signal received, worker exiting"
                    );
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(worker = %self.name, error = %e, "Kill-signal check failed");
                }
            }

            match self.queue.dequeue(self.dequeue_timeout).await {
                Ok(Some(job)) => {
                    dequeue_failures = 0;
                    if !self.process_job(&mut session, job).await {
                        break;
                    }
                }
                Ok(None) => {
                    debug!(worker = %self.name, "No jobs available");
                }
                Err(e) => {
                    dequeue_failures += 1;
                    error!(
                        worker = %self.name,
                        error = %e,
                        failures = dequeue_failures,
                        "Failed to dequeue job"
                    );
                    if dequeue_failures >= MAX_DEQUEUE_FAILURES {
                        error!(
                            worker = %self.name,
                            "Too many consecutive store failures, worker exiting"
                        );
                        break;
                    }
                    tokio::time::sleep(DEQUEUE_FAILURE_BACKOFF).await;
                }
            }
        }

        info!(worker = %self.name, "Worker stopped");
    }

    /// Processes one dequeued job. Returns `false` when the unit must exit
    /// (it was preempted mid-job by the watchdog).
    async fn process_job(&self, session: &mut P::Session, job: Job) -> bool {
        let acquired = match self.control.acquire(&job.id).await {
            Ok(acquired) => acquired,
            Err(e) => {
                error!(
                    worker = %self.name,
                    job_id = %job.id,
                    error = %e,
                    "Lock acquisition failed, dropping job"
                );
                return true;
            }
        };

        if !acquired {
            // Another unit is already processing this identity. This unit
            // never held the lock, so there is nothing to release.
            debug!(
                worker = %self.name,
                job_id = %job.id,
                "Job already in flight, dropping duplicate"
            );
            return true;
        }

        self.watchdog
            .register(&job.id, &self.name, self.job_type)
            .await;

        let cancel = CancellationToken::new();
        let watcher = tokio::spawn(kill_watcher(
            self.kill.clone(),
            self.name.clone(),
            cancel.clone(),
        ));

        info!(worker = %self.name, job_id = %job.id, row = job.row, "Processing job");
        let start = Instant::now();

        let result = AssertUnwindSafe(self.processor.process(session, &job, &cancel))
            .catch_unwind()
            .await;

        watcher.abort();
        let duration = start.elapsed();

        self.watchdog.unregister(&job.id).await;

        // Unconditional release, before any outcome handling: the lock must
        // come off on success, business failure, error and panic alike.
        if let Err(e) = self.control.release(&job.id).await {
            error!(
                worker = %self.name,
                job_id = %job.id,
                error = %e,
                "Failed to release job lock, identity stays blocked until cleaned up"
            );
        }

        match result {
            Ok(Ok(ProcessOutcome::Completed)) => {
                info!(
                    worker = %self.name,
                    job_id = %job.id,
                    duration_ms = duration.as_millis() as u64,
                    "Job completed"
                );
                metrics::record_job_completed(self.job_type, duration.as_secs_f64());
            }
            Ok(Ok(ProcessOutcome::Failed { reason })) => {
                warn!(
                    worker = %self.name,
                    job_id = %job.id,
                    reason = %reason,
                    duration_ms = duration.as_millis() as u64,
                    "Job completed with failure"
                );
                metrics::record_job_failed(self.job_type, duration.as_secs_f64());
            }
            Ok(Ok(ProcessOutcome::Retry { reason })) => {
                // The lock is already released, so the re-pushed copy can be
                // acquired by whichever unit dequeues it.
                warn!(
                    worker = %self.name,
                    job_id = %job.id,
                    reason = %reason,
                    "Transient failure, re-enqueueing job"
                );
                match self.queue.enqueue(&job).await {
                    Ok(()) => metrics::record_job_retried(self.job_type),
                    Err(e) => {
                        error!(
                            worker = %self.name,
                            job_id = %job.id,
                            error = %e,
                            "Failed to re-enqueue job"
                        );
                    }
                }
            }
            Ok(Err(e)) => {
                error!(
                    worker = %self.name,
                    job_id = %job.id,
                    error = %e,
                    "Worker function failed"
                );
                metrics::record_job_failed(self.job_type, duration.as_secs_f64());
            }
            Err(_) => {
                error!(
                    worker = %self.name,
                    job_id = %job.id,
                    "Worker function panicked"
                );
                metrics::record_job_failed(self.job_type, duration.as_secs_f64());
            }
        }

        if cancel.is_cancelled() {
            warn!(
                worker = %self.name,
                job_id = %job.id,
                "Unit was preempted mid-job, exiting after cleanup"
            );
            return false;
        }

        true
    }
}

/// Background watcher for one in-flight job: polls for a kill signal aimed
/// at this worker and, when one arrives, requests a cooperative abort via
/// the cancellation token. Never aborts the processing future itself.
async fn kill_watcher(kill: KillSwitch, worker_id: String, cancel: CancellationToken) {
    loop {
        tokio::time::sleep(KILL_POLL_INTERVAL).await;
        match kill.take_for_worker(&worker_id).await {
            Ok(Some(signal)) => {
                warn!(
                    worker = %worker_id,
                    job_id = %signal.job_id,
                    "Kill signal received mid-job, requesting cooperative abort"
                );
                cancel.cancel();
                return;
            }
            Ok(None) => {}
            Err(e) => {
                debug!(worker = %worker_id, error = %e, "Kill-signal check failed");
            }
        }
    }
}
