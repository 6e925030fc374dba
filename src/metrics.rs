//! Prometheus metrics for the orchestration core.
//!
//! Metrics are advisory: every behavior they describe is also observable in
//! the logs, and all recording helpers are no-ops until [`init_metrics`] has
//! been called, so library users (and tests) that never initialize the
//! registry pay nothing.

use std::sync::OnceLock;

use prometheus::{
    Counter, CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};

use crate::job::JobType;

/// Global Prometheus registry for all docflow metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Pending jobs per queue, labeled by job type.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Live workers per pool, labeled by job type.
pub static LIVE_WORKERS: OnceLock<GaugeVec> = OnceLock::new();

/// Jobs completed successfully, labeled by job type.
pub static JOBS_COMPLETED: OnceLock<CounterVec> = OnceLock::new();

/// Jobs that ended in a business failure or an execution error, labeled by
/// job type.
pub static JOBS_FAILED: OnceLock<CounterVec> = OnceLock::new();

/// Jobs pushed back for retry after a transient failure, labeled by job type.
pub static JOBS_RETRIED: OnceLock<CounterVec> = OnceLock::new();

/// Job processing duration in seconds, labeled by job type.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Stuck jobs detected by the watchdog.
pub static STUCK_JOBS_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Kill signals emitted by the watchdog.
pub static KILL_SIGNALS_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at host startup. Subsequent calls return an error from the
/// duplicate registration, which is safe to ignore.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let queue_depth = GaugeVec::new(
        Opts::new("docflow_queue_depth", "Pending jobs per queue"),
        &["job_type"],
    )?;
    let live_workers = GaugeVec::new(
        Opts::new("docflow_live_workers", "Live workers per job type"),
        &["job_type"],
    )?;
    let jobs_completed = CounterVec::new(
        Opts::new("docflow_jobs_completed_total", "Jobs completed successfully"),
        &["job_type"],
    )?;
    let jobs_failed = CounterVec::new(
        Opts::new("docflow_jobs_failed_total", "Jobs that failed"),
        &["job_type"],
    )?;
    let jobs_retried = CounterVec::new(
        Opts::new("docflow_jobs_retried_total", "Jobs re-enqueued for retry"),
        &["job_type"],
    )?;
    let job_duration = HistogramVec::new(
        HistogramOpts::new("docflow_job_duration_seconds", "Job processing duration")
            .buckets(vec![5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
        &["job_type"],
    )?;
    let stuck_jobs = Counter::new("docflow_stuck_jobs_total", "Stuck jobs detected")?;
    let kill_signals = Counter::new("docflow_kill_signals_total", "Kill signals emitted")?;

    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(live_workers.clone()))?;
    registry.register(Box::new(jobs_completed.clone()))?;
    registry.register(Box::new(jobs_failed.clone()))?;
    registry.register(Box::new(jobs_retried.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(stuck_jobs.clone()))?;
    registry.register(Box::new(kill_signals.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = LIVE_WORKERS.set(live_workers);
    let _ = JOBS_COMPLETED.set(jobs_completed);
    let _ = JOBS_FAILED.set(jobs_failed);
    let _ = JOBS_RETRIED.set(jobs_retried);
    let _ = JOB_DURATION.set(job_duration);
    let _ = STUCK_JOBS_TOTAL.set(stuck_jobs);
    let _ = KILL_SIGNALS_TOTAL.set(kill_signals);

    Ok(())
}

/// Export all metrics in the Prometheus text format.
///
/// Returns an empty string if metrics were never initialized.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return String::new();
    };

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&registry.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Records the current depth of a job queue.
pub fn record_queue_depth(job_type: JobType, depth: usize) {
    if let Some(gauge) = QUEUE_DEPTH.get() {
        gauge.with_label_values(&[job_type.as_str()]).set(depth as f64);
    }
}

/// Records the current live worker count for a job type.
pub fn record_live_workers(job_type: JobType, count: usize) {
    if let Some(gauge) = LIVE_WORKERS.get() {
        gauge.with_label_values(&[job_type.as_str()]).set(count as f64);
    }
}

/// Records a completed job and its duration.
pub fn record_job_completed(job_type: JobType, duration_secs: f64) {
    if let Some(counter) = JOBS_COMPLETED.get() {
        counter.with_label_values(&[job_type.as_str()]).inc();
    }
    if let Some(histogram) = JOB_DURATION.get() {
        histogram
            .with_label_values(&[job_type.as_str()])
            .observe(duration_secs);
    }
}

/// Records a failed job and its duration.
pub fn record_job_failed(job_type: JobType, duration_secs: f64) {
    if let Some(counter) = JOBS_FAILED.get() {
        counter.with_label_values(&[job_type.as_str()]).inc();
    }
    if let Some(histogram) = JOB_DURATION.get() {
        histogram
            .with_label_values(&[job_type.as_str()])
            .observe(duration_secs);
    }
}

/// Records a job pushed back for retry.
pub fn record_job_retried(job_type: JobType) {
    if let Some(counter) = JOBS_RETRIED.get() {
        counter.with_label_values(&[job_type.as_str()]).inc();
    }
}

/// Records a stuck-job detection (one kill signal emitted).
pub fn record_stuck_job() {
    if let Some(counter) = STUCK_JOBS_TOTAL.get() {
        counter.inc();
    }
    if let Some(counter) = KILL_SIGNALS_TOTAL.get() {
        counter.inc();
    }
}
