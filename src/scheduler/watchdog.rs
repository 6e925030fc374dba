//! Stuck-job detection and recovery.
//!
//! The watchdog bounds the wall-clock duration of every in-flight job.
//! Workers register a job when they start it and unregister when they finish;
//! a periodic scan classifies any entry older than the configured maximum as
//! stuck, appends an audit record, and emits exactly one kill signal for it.
//!
//! Exactly-once is guaranteed structurally: a stuck entry is removed from the
//! in-memory map under the lock before its signal is emitted, so no later
//! scan can see it again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::OrchestratorConfig;
use crate::coordination::{KillReason, KillSignal, KillSwitch};
use crate::job::JobType;
use crate::metrics;

/// A job the watchdog flagged as exceeding its deadline.
#[derive(Debug, Clone)]
pub struct StuckJob {
    /// Identity of the stuck job.
    pub job_id: String,
    /// Worker that owns it.
    pub worker_id: String,
    /// Pipeline it belongs to.
    pub job_type: JobType,
    /// How long it had been running when detected.
    pub elapsed: Duration,
    /// When the worker started it.
    pub started_at: DateTime<Utc>,
}

/// One in-flight job as tracked in memory.
struct InflightEntry {
    worker_id: String,
    job_type: JobType,
    started: Instant,
    started_at: DateTime<Utc>,
}

/// The in-memory registry of in-flight jobs.
///
/// Authoritative during normal operation; the Redis hash mirror exists only
/// for crash-recovery visibility.
struct WatchdogState {
    entries: Mutex<HashMap<String, InflightEntry>>,
    max_job_duration: Duration,
}

impl WatchdogState {
    fn new(max_job_duration: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_job_duration,
        }
    }

    fn insert(&self, job_id: &str, worker_id: &str, job_type: JobType) {
        let mut entries = self.entries.lock().expect("watchdog registry poisoned");
        entries.insert(
            job_id.to_string(),
            InflightEntry {
                worker_id: worker_id.to_string(),
                job_type,
                started: Instant::now(),
                started_at: Utc::now(),
            },
        );
    }

    /// Removes an entry. Idempotent: returns `false` if it was absent.
    fn remove(&self, job_id: &str) -> bool {
        let mut entries = self.entries.lock().expect("watchdog registry poisoned");
        entries.remove(job_id).is_some()
    }

    /// Drains every entry whose elapsed time exceeds the deadline.
    ///
    /// Removal happens under the lock, so each stuck transition is observed
    /// by exactly one caller.
    fn take_stuck(&self) -> Vec<StuckJob> {
        let mut entries = self.entries.lock().expect("watchdog registry poisoned");
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.started.elapsed() > self.max_job_duration)
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| {
                entries.remove(&id).map(|entry| StuckJob {
                    job_id: id,
                    worker_id: entry.worker_id,
                    job_type: entry.job_type,
                    elapsed: entry.started.elapsed(),
                    started_at: entry.started_at,
                })
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.lock().expect("watchdog registry poisoned").len()
    }
}

/// Snapshot of watchdog state for status reporting.
#[derive(Debug, Clone)]
pub struct WatchdogStatus {
    /// Number of jobs currently registered.
    pub in_flight: usize,
    /// The configured deadline.
    pub max_job_duration: Duration,
    /// Whether the scan loop is running.
    pub running: bool,
}

struct WatchdogInner {
    state: WatchdogState,
    redis: ConnectionManager,
    kill: KillSwitch,
    inflight_hash: String,
    stuck_log: String,
    check_interval: Duration,
}

impl WatchdogInner {
    /// Best-effort mirror of a registration to the crash-recovery hash.
    async fn mirror_register(&self, job_id: &str, worker_id: &str, job_type: JobType) {
        let record = serde_json::json!({
            "start": Utc::now().to_rfc3339(),
            "owner": worker_id,
            "type": job_type.as_str(),
        });
        let mut conn = self.redis.clone();
        if let Err(e) = conn
            .hset::<_, _, _, ()>(&self.inflight_hash, job_id, record.to_string())
            .await
        {
            error!(job_id = %job_id, error = %e, "Failed to mirror in-flight job to store");
        }
    }

    /// Best-effort removal from the crash-recovery hash.
    async fn mirror_unregister(&self, job_id: &str) {
        let mut conn = self.redis.clone();
        if let Err(e) = conn.hdel::<_, _, ()>(&self.inflight_hash, job_id).await {
            error!(job_id = %job_id, error = %e, "Failed to remove in-flight job from store");
        }
    }

    /// Audits and signals one stuck job.
    async fn handle_stuck(&self, stuck: StuckJob) {
        error!(
            job_id = %stuck.job_id,
            worker = %stuck.worker_id,
            job_type = %stuck.job_type,
            elapsed_secs = stuck.elapsed.as_secs(),
            max_secs = self.state.max_job_duration.as_secs(),
            started_at = %stuck.started_at,
            "Stuck job detected"
        );

        let audit = serde_json::json!({
            "job_id": stuck.job_id,
            "worker_id": stuck.worker_id,
            "job_type": stuck.job_type.as_str(),
            "elapsed_secs": stuck.elapsed.as_secs(),
            "started_at": stuck.started_at.to_rfc3339(),
            "detected_at": Utc::now().to_rfc3339(),
        });
        let mut conn = self.redis.clone();
        if let Err(e) = conn
            .rpush::<_, _, ()>(&self.stuck_log, audit.to_string())
            .await
        {
            error!(job_id = %stuck.job_id, error = %e, "Failed to append stuck-job audit record");
        }

        let signal = KillSignal::new(
            &stuck.worker_id,
            stuck.job_type,
            &stuck.job_id,
            KillReason::DeadlineExceeded,
        );
        match self.kill.send(&signal).await {
            Ok(()) => {
                warn!(
                    worker = %stuck.worker_id,
                    job_id = %stuck.job_id,
                    "Kill signal sent for stuck job"
                );
            }
            Err(e) => {
                error!(
                    worker = %stuck.worker_id,
                    job_id = %stuck.job_id,
                    error = %e,
                    "Failed to send kill signal"
                );
            }
        }

        self.mirror_unregister(&stuck.job_id).await;
        metrics::record_stuck_job();
    }
}

/// Monitors in-flight jobs and surfaces the ones that exceed their deadline.
pub struct Watchdog {
    inner: Arc<WatchdogInner>,
    shutdown_tx: broadcast::Sender<()>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl Watchdog {
    /// Creates a watchdog over an existing store connection.
    pub fn new(redis: ConnectionManager, kill: KillSwitch, config: &OrchestratorConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(WatchdogInner {
                state: WatchdogState::new(config.max_job_duration),
                redis,
                kill,
                inflight_hash: config.inflight_hash.clone(),
                stuck_log: config.stuck_log.clone(),
                check_interval: config.watchdog_check_interval,
            }),
            shutdown_tx,
            monitor: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Registers a job as started.
    pub async fn register(&self, job_id: &str, worker_id: &str, job_type: JobType) {
        self.inner.state.insert(job_id, worker_id, job_type);
        debug!(
            job_id = %job_id,
            worker = %worker_id,
            max_secs = self.inner.state.max_job_duration.as_secs(),
            "Job registered with watchdog"
        );
        self.inner.mirror_register(job_id, worker_id, job_type).await;
    }

    /// Unregisters a finished job. Idempotent: safe to call even if the job
    /// was already removed by a stuck detection.
    pub async fn unregister(&self, job_id: &str) {
        if self.inner.state.remove(job_id) {
            self.inner.mirror_unregister(job_id).await;
        }
    }

    /// Starts the periodic scan loop.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Watchdog is already running");
            return;
        }

        let inner = Arc::clone(&self.inner);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            info!(
                max_secs = inner.state.max_job_duration.as_secs(),
                check_secs = inner.check_interval.as_secs(),
                "Watchdog started"
            );
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(inner.check_interval) => {}
                    _ = shutdown_rx.recv() => break,
                }

                let stuck = inner.state.take_stuck();
                for job in stuck {
                    inner.handle_stuck(job).await;
                }

                let in_flight = inner.state.len();
                if in_flight > 0 {
                    debug!(in_flight, "Watchdog scan complete");
                }
            }
            info!("Watchdog stopped");
        });

        *self.monitor.lock().expect("watchdog monitor poisoned") = Some(handle);
    }

    /// Stops the scan loop and waits for it to exit.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());
        let handle = self
            .monitor
            .lock()
            .expect("watchdog monitor poisoned")
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Watchdog monitor task panicked");
            }
        }
    }

    /// Returns a snapshot of the watchdog state.
    pub fn status(&self) -> WatchdogStatus {
        WatchdogStatus {
            in_flight: self.inner.state.len(),
            max_job_duration: self.inner.state.max_job_duration,
            running: self.running.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_stuck_is_exactly_once() {
        // Zero deadline: everything registered is immediately stuck.
        let state = WatchdogState::new(Duration::ZERO);
        state.insert("job-1", "conference-worker-1", JobType::Conference);

        let first = state.take_stuck();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].job_id, "job-1");
        assert_eq!(first[0].worker_id, "conference-worker-1");

        // The stuck transition was consumed; later scans see nothing.
        assert!(state.take_stuck().is_empty());
        assert_eq!(state.len(), 0);
    }

    #[test]
    fn unregistered_jobs_are_never_stuck() {
        let state = WatchdogState::new(Duration::ZERO);
        state.insert("job-2", "emission-worker-1", JobType::Emission);
        assert!(state.remove("job-2"));

        assert!(state.take_stuck().is_empty());
    }

    #[test]
    fn remove_is_idempotent() {
        let state = WatchdogState::new(Duration::from_secs(300));
        state.insert("job-3", "conference-worker-2", JobType::Conference);

        assert!(state.remove("job-3"));
        assert!(!state.remove("job-3"));
        assert!(!state.remove("never-registered"));
    }

    #[test]
    fn entries_within_deadline_are_kept() {
        let state = WatchdogState::new(Duration::from_secs(300));
        state.insert("job-4", "conference-worker-1", JobType::Conference);

        assert!(state.take_stuck().is_empty());
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn take_stuck_drains_every_expired_entry() {
        let state = WatchdogState::new(Duration::ZERO);
        state.insert("old", "w-1", JobType::Conference);
        state.insert("also-old", "w-2", JobType::Emission);

        let stuck = state.take_stuck();
        assert_eq!(stuck.len(), 2);
        assert_eq!(state.len(), 0);
    }
}
