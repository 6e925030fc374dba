//! Dynamic worker pool sizing, liveness recovery and kill-signal handling.
//!
//! The pool manager keeps the live worker count per job type aligned with
//! observed queue depth, within per-type and global bounds:
//!
//! - `start()` spawns one warm worker per enabled type regardless of depth,
//!   then runs the rebalance and liveness loops.
//! - `rebalance()` recomputes the desired count from queue depth and spawns
//!   the deficit. Shrink is by attrition only: excess workers are never
//!   force-stopped, the manager just stops replacing them.
//! - `reconcile_liveness()` prunes dead units, restores coverage when a type
//!   starves, and drains kill signals by spawning a replacement before the
//!   stuck unit has necessarily died. The job lock, not the pool, prevents
//!   duplicate work during that overlap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use redis::aio::ConnectionManager;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::OrchestratorConfig;
use crate::coordination::{ControlSet, JobQueue, KillSwitch};
use crate::job::JobType;
use crate::metrics;
use crate::processor::JobProcessor;

use super::watchdog::Watchdog;
use super::worker::Worker;

/// Errors that can occur in the pool manager.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// The pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Workers did not stop within the allotted time.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Computes the desired worker count for a queue depth.
///
/// Zero pending jobs need zero workers; otherwise one worker per
/// `batch_size` pending jobs, rounded up and capped at `max_per_type`.
pub fn required_workers(pending: usize, batch_size: usize, max_per_type: usize) -> usize {
    if pending == 0 {
        return 0;
    }
    let needed = (pending + batch_size - 1) / batch_size;
    needed.min(max_per_type)
}

/// One tracked worker unit.
struct WorkerUnit {
    name: String,
    handle: JoinHandle<()>,
}

/// Snapshot of pool state for status reporting.
#[derive(Debug, Clone)]
pub struct PoolStatus {
    /// Live worker count per job type.
    pub live_workers: HashMap<JobType, usize>,
    /// Live worker count across all types.
    pub total_live: usize,
    /// Whether the control loops are running.
    pub running: bool,
}

struct PoolInner<P: JobProcessor> {
    config: OrchestratorConfig,
    queues: HashMap<JobType, JobQueue>,
    control: ControlSet,
    kill: KillSwitch,
    watchdog: Arc<Watchdog>,
    processor: Arc<P>,
    registry: Mutex<HashMap<JobType, Vec<WorkerUnit>>>,
    worker_seq: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
}

impl<P: JobProcessor> PoolInner<P> {
    /// Spawns a worker and records it in the registry. Infallible from the
    /// caller's perspective: a failure here is logged and the bookkeeping
    /// gap is retried on the next tick.
    fn spawn_worker(
        &self,
        registry: &mut HashMap<JobType, Vec<WorkerUnit>>,
        job_type: JobType,
        tag: Option<&str>,
    ) {
        let Some(queue) = self.queues.get(&job_type) else {
            error!(job_type = %job_type, "No queue configured for job type, cannot spawn worker");
            return;
        };

        let seq = self.worker_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let name = match tag {
            Some(tag) => format!("{}-worker-{}-{}", job_type, tag, seq),
            None => format!("{}-worker-{}", job_type, seq),
        };

        let worker = Worker {
            name: name.clone(),
            job_type,
            queue: queue.clone(),
            control: self.control.clone(),
            kill: self.kill.clone(),
            watchdog: Arc::clone(&self.watchdog),
            processor: Arc::clone(&self.processor),
            shutdown_rx: self.shutdown_tx.subscribe(),
            dequeue_timeout: self.config.dequeue_timeout,
        };
        let handle = tokio::spawn(worker.run());

        registry
            .entry(job_type)
            .or_default()
            .push(WorkerUnit { name: name.clone(), handle });
        info!(worker = %name, job_type = %job_type, "Worker spawned");
    }

    /// Reads the depth of every enabled queue. Types whose depth cannot be
    /// read are skipped for this tick.
    async fn queue_depths(&self) -> Vec<(JobType, usize)> {
        let mut depths = Vec::with_capacity(self.config.enabled_types.len());
        for &job_type in &self.config.enabled_types {
            let Some(queue) = self.queues.get(&job_type) else {
                continue;
            };
            match queue.len().await {
                Ok(pending) => depths.push((job_type, pending)),
                Err(e) => {
                    error!(
                        job_type = %job_type,
                        error = %e,
                        "Failed to read queue depth, skipping this tick"
                    );
                }
            }
        }
        depths
    }

    /// One rebalance pass: prune dead units, recompute the desired count per
    /// type from queue depth, and spawn the deficit within the caps.
    async fn rebalance(&self) {
        let depths = self.queue_depths().await;

        let mut registry = self.registry.lock().expect("pool registry poisoned");
        for units in registry.values_mut() {
            units.retain(|unit| !unit.handle.is_finished());
        }
        let mut total_live: usize = registry.values().map(Vec::len).sum();

        for (job_type, pending) in depths {
            let live = registry.get(&job_type).map_or(0, Vec::len);
            let required = required_workers(
                pending,
                self.config.batch_size,
                self.config.max_workers_per_type,
            );

            if required > live {
                let deficit = required - live;
                let headroom = self.config.max_total_workers.saturating_sub(total_live);
                let to_spawn = deficit.min(headroom);

                if to_spawn < deficit {
                    warn!(
                        job_type = %job_type,
                        deficit,
                        headroom,
                        "Global worker cap reached, scale-up truncated"
                    );
                }
                if to_spawn > 0 {
                    info!(
                        job_type = %job_type,
                        pending,
                        live,
                        required,
                        spawning = to_spawn,
                        "Scaling up workers"
                    );
                }
                for _ in 0..to_spawn {
                    self.spawn_worker(&mut registry, job_type, None);
                    total_live += 1;
                }
            } else if required < live {
                // Workers are cooperative and mid-job: record the intent and
                // let the excess exit by attrition as the queue drains.
                info!(
                    job_type = %job_type,
                    pending,
                    live,
                    required,
                    excess = live - required,
                    "Shrink intent recorded, excess workers exit as jobs drain"
                );
            } else if live > 0 {
                debug!(job_type = %job_type, pending, live, "Pool balanced");
            }

            let live_now = registry.get(&job_type).map_or(0, Vec::len);
            metrics::record_queue_depth(job_type, pending);
            metrics::record_live_workers(job_type, live_now);
        }
    }

    /// One liveness pass: drain kill signals into replacement spawns, prune
    /// units whose task ended, and restore coverage for starving types.
    async fn reconcile_liveness(&self) {
        // Kill signals first: the replacement races ahead of the stuck
        // unit's teardown by design. The job lock prevents duplicate
        // in-flight work during the overlap.
        match self.kill.drain().await {
            Ok(signals) => {
                if !signals.is_empty() {
                    let mut registry = self.registry.lock().expect("pool registry poisoned");
                    let mut total_live: usize = registry.values().map(Vec::len).sum();
                    for signal in signals {
                        warn!(
                            job_id = %signal.job_id,
                            worker = %signal.worker_id,
                            job_type = %signal.job_type,
                            reason = %signal.reason,
                            "Kill signal drained, spawning replacement worker"
                        );
                        if total_live >= self.config.max_total_workers {
                            warn!(
                                job_type = %signal.job_type,
                                "Global worker cap reached, replacement deferred to next scan"
                            );
                            continue;
                        }
                        self.spawn_worker(&mut registry, signal.job_type, Some("replace"));
                        total_live += 1;
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to drain kill signals");
            }
        }

        let depths = self.queue_depths().await;

        let mut registry = self.registry.lock().expect("pool registry poisoned");
        let mut dead_counts: HashMap<JobType, usize> = HashMap::new();
        for (job_type, units) in registry.iter_mut() {
            let before = units.len();
            units.retain(|unit| !unit.handle.is_finished());
            let dead = before - units.len();
            if dead > 0 {
                warn!(job_type = %job_type, dead, "Dead worker(s) pruned from pool");
                dead_counts.insert(*job_type, dead);
            }
        }
        let mut total_live: usize = registry.values().map(Vec::len).sum();

        let mut summary = Vec::with_capacity(depths.len());
        for (job_type, pending) in depths {
            let live = registry.get(&job_type).map_or(0, Vec::len);
            let dead = dead_counts.get(&job_type).copied().unwrap_or(0);

            // Replace crashed units while their queue still has work.
            if dead > 0 && pending > 0 {
                let per_type_headroom = self.config.max_workers_per_type.saturating_sub(live);
                let global_headroom = self.config.max_total_workers.saturating_sub(total_live);
                let to_spawn = dead.min(per_type_headroom).min(global_headroom);
                if to_spawn > 0 {
                    info!(
                        job_type = %job_type,
                        dead,
                        spawning = to_spawn,
                        "Replacing dead workers"
                    );
                }
                for _ in 0..to_spawn {
                    self.spawn_worker(&mut registry, job_type, Some("recovery"));
                    total_live += 1;
                }
            }

            // Starvation guard: an enabled type never stays at zero workers.
            let live_now = registry.get(&job_type).map_or(0, Vec::len);
            if live_now == 0 && total_live < self.config.max_total_workers {
                info!(
                    job_type = %job_type,
                    pending,
                    "No live workers for enabled type, spawning recovery worker"
                );
                self.spawn_worker(&mut registry, job_type, Some("recovery"));
                total_live += 1;
            }

            let live_final = registry.get(&job_type).map_or(0, Vec::len);
            metrics::record_queue_depth(job_type, pending);
            metrics::record_live_workers(job_type, live_final);
            summary.push(format!("{}: {} live / {} pending", job_type, live_final, pending));
        }

        debug!(total_live, status = %summary.join(", "), "Liveness scan complete");
    }
}

/// Manages the worker pools for every enabled job type.
pub struct PoolManager<P: JobProcessor> {
    inner: Arc<PoolInner<P>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl<P: JobProcessor> PoolManager<P> {
    /// Creates a pool manager over an existing store connection.
    pub fn new(
        config: OrchestratorConfig,
        redis: ConnectionManager,
        watchdog: Arc<Watchdog>,
        processor: Arc<P>,
    ) -> Self {
        let queues = config
            .enabled_types
            .iter()
            .map(|&job_type| {
                (
                    job_type,
                    JobQueue::new(redis.clone(), config.queue_name(job_type)),
                )
            })
            .collect();
        let control = ControlSet::new(redis.clone(), config.control_set.clone());
        let kill = KillSwitch::new(redis, config.kill_set.clone());
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            inner: Arc::new(PoolInner {
                config,
                queues,
                control,
                kill,
                watchdog,
                processor,
                registry: Mutex::new(HashMap::new()),
                worker_seq: AtomicU64::new(0),
                shutdown_tx,
            }),
            loops: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Starts the pool: one warm worker per enabled type (regardless of
    /// queue depth), then the periodic rebalance and liveness loops.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool was already started.
    pub fn start(&self) -> Result<(), PoolError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        {
            let mut registry = self.inner.registry.lock().expect("pool registry poisoned");
            for &job_type in &self.inner.config.enabled_types {
                self.inner.spawn_worker(&mut registry, job_type, None);
            }
        }

        let rebalance_inner = Arc::clone(&self.inner);
        let mut rebalance_rx = self.inner.shutdown_tx.subscribe();
        let rebalance_loop = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(rebalance_inner.config.rebalance_interval) => {}
                    _ = rebalance_rx.recv() => break,
                }
                rebalance_inner.rebalance().await;
            }
        });

        let liveness_inner = Arc::clone(&self.inner);
        let mut liveness_rx = self.inner.shutdown_tx.subscribe();
        let liveness_loop = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(liveness_inner.config.liveness_interval) => {}
                    _ = liveness_rx.recv() => break,
                }
                liveness_inner.reconcile_liveness().await;
            }
        });

        let mut loops = self.loops.lock().expect("pool loops poisoned");
        loops.push(rebalance_loop);
        loops.push(liveness_loop);

        info!(
            types = self.inner.config.enabled_types.len(),
            rebalance_secs = self.inner.config.rebalance_interval.as_secs(),
            liveness_secs = self.inner.config.liveness_interval.as_secs(),
            "Pool manager started"
        );
        Ok(())
    }

    /// Runs one rebalance pass immediately, outside the periodic loop.
    pub async fn rebalance(&self) {
        self.inner.rebalance().await;
    }

    /// Runs one liveness pass immediately, outside the periodic loop.
    pub async fn reconcile_liveness(&self) {
        self.inner.reconcile_liveness().await;
    }

    /// Signals every loop and worker to stop at its next checkpoint and
    /// waits for the control loops (not the workers) to exit.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::NotRunning` if the pool was not started.
    pub async fn stop(&self) -> Result<(), PoolError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        // Ignore send errors: receivers may all have exited already.
        let _ = self.inner.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = {
            let mut loops = self.loops.lock().expect("pool loops poisoned");
            loops.drain(..).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Pool control loop panicked");
            }
        }

        info!("Pool manager stopped, workers exit at their next checkpoint");
        Ok(())
    }

    /// Stops the pool and waits for every worker to finish its current job.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers are still running
    /// when the timeout expires.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), PoolError> {
        self.stop().await?;

        let workers: Vec<WorkerUnit> = {
            let mut registry = self.inner.registry.lock().expect("pool registry poisoned");
            registry.values_mut().flat_map(|units| units.drain(..)).collect()
        };

        let wait_all = async {
            for unit in workers {
                if let Err(e) = unit.handle.await {
                    error!(worker = %unit.name, error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        match tokio::time::timeout(timeout, wait_all).await {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(timeout)),
        }
    }

    /// Returns a snapshot of live worker counts.
    pub fn status(&self) -> PoolStatus {
        let registry = self.inner.registry.lock().expect("pool registry poisoned");
        let live_workers: HashMap<JobType, usize> = registry
            .iter()
            .map(|(&job_type, units)| {
                (
                    job_type,
                    units.iter().filter(|u| !u.handle.is_finished()).count(),
                )
            })
            .collect();
        let total_live = live_workers.values().sum();

        PoolStatus {
            live_workers,
            total_live,
            running: self.running.load(Ordering::SeqCst),
        }
    }

    /// Reads the current depth of every enabled queue.
    pub async fn queue_depths(&self) -> Vec<(JobType, usize)> {
        self.inner.queue_depths().await
    }

    /// Returns whether the control loops are running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
