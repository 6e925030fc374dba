//! Integration tests for the orchestration core.
//!
//! These tests talk to a real Redis instance.
//! Run with: REDIS_URL=redis://localhost:6379 cargo test --test orchestration -- --ignored

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use docflow::{
    connect, CancellationToken, ControlSet, Job, JobProcessor, JobQueue, JobType, KillReason,
    KillSignal, KillSwitch, OrchestratorConfig, PoolManager, ProcessOutcome, Producer, Watchdog,
};
use serde_json::{Map, Value};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

/// Unique key prefix per test so concurrent runs never collide.
fn test_config(name: &str) -> OrchestratorConfig {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_nanos();
    OrchestratorConfig::default()
        .with_redis_url(redis_url())
        .with_key_prefix(&format!(
            "docflow-test:{}:{}:{}",
            name,
            std::process::id(),
            nanos
        ))
        .with_dequeue_timeout(Duration::from_secs(1))
        // Keep the periodic loops out of the way; ticks are driven manually.
        .with_rebalance_interval(Duration::from_secs(3600))
        .with_liveness_interval(Duration::from_secs(3600))
}

/// Polls `condition` until it holds or the timeout expires.
async fn wait_until<F, Fut>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition().await {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "condition not met within {:?}",
            timeout
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Processor that records every processed job id and derives its outcome
/// from the job payload's `behavior` field.
struct RecordingProcessor {
    processed: Mutex<Vec<String>>,
    delay: Duration,
}

impl RecordingProcessor {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            processed: Mutex::new(Vec::new()),
            delay,
        })
    }

    fn processed(&self) -> Vec<String> {
        self.processed.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobProcessor for RecordingProcessor {
    type Session = ();

    async fn open_session(&self, _job_type: JobType) -> Result<(), docflow::ProcessorError> {
        Ok(())
    }

    async fn process(
        &self,
        _session: &mut (),
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, docflow::ProcessorError> {
        self.processed.lock().unwrap().push(job.id.clone());

        tokio::select! {
            _ = tokio::time::sleep(self.delay) => {}
            _ = cancel.cancelled() => {
                return Ok(ProcessOutcome::Failed {
                    reason: "preempted".to_string(),
                });
            }
        }

        match job.field("behavior") {
            Some("fail") => Ok(ProcessOutcome::Failed {
                reason: "business failure".to_string(),
            }),
            Some("error") => Err(docflow::ProcessorError::Execution("boom".to_string())),
            Some("panic") => panic!("intentional test panic"),
            _ => Ok(ProcessOutcome::Completed),
        }
    }
}

fn behavior_job(id: &str, behavior: &str) -> Job {
    let mut payload = Map::new();
    payload.insert("behavior".to_string(), Value::from(behavior));
    Job::new(id, JobType::Conference, 1).with_payload(payload)
}

#[tokio::test]
#[ignore] // Run with: cargo test --test orchestration -- --ignored
async fn lock_exclusivity_under_contention() {
    init_tracing();
    let config = test_config("lock-exclusivity");
    let redis = connect(&config.redis_url).await.expect("redis");
    let control = ControlSet::new(redis, config.control_set.clone());
    control.clear().await.expect("clear");

    let mut handles = Vec::new();
    for _ in 0..10 {
        let control = control.clone();
        handles.push(tokio::spawn(async move {
            control.acquire("contested-job").await.expect("acquire")
        }));
    }

    let mut successes = 0;
    for handle in handles {
        if handle.await.expect("join") {
            successes += 1;
        }
    }
    assert_eq!(successes, 1, "exactly one acquirer must win");

    // Release frees the identity for the next acquirer.
    assert!(control.release("contested-job").await.expect("release"));
    assert!(control.acquire("contested-job").await.expect("reacquire"));
    control.clear().await.expect("cleanup");
}

#[tokio::test]
#[ignore]
async fn lock_released_on_every_worker_exit_path() {
    init_tracing();
    let config = test_config("release-totality").with_enabled_types(vec![JobType::Conference]);
    let redis = connect(&config.redis_url).await.expect("redis");

    let control = ControlSet::new(redis.clone(), config.control_set.clone());
    let queue = JobQueue::new(redis.clone(), config.queue_name(JobType::Conference));
    let kill = KillSwitch::new(redis.clone(), config.kill_set.clone());
    control.clear().await.expect("clear control");
    queue.clear().await.expect("clear queue");
    kill.clear().await.expect("clear kill");

    let producer = Producer::new(
        control.clone(),
        queue.clone(),
        JobQueue::new(redis.clone(), config.queue_name(JobType::Emission)),
    );
    for (id, behavior) in [
        ("job-ok", "ok"),
        ("job-fail", "fail"),
        ("job-error", "error"),
        ("job-panic", "panic"),
    ] {
        assert!(producer
            .submit(behavior_job(id, behavior))
            .await
            .expect("submit"));
    }

    let processor = RecordingProcessor::new(Duration::from_millis(20));
    let watchdog = Arc::new(Watchdog::new(redis.clone(), kill.clone(), &config));
    let pool = PoolManager::new(config, redis, Arc::clone(&watchdog), Arc::clone(&processor));
    pool.start().expect("start");

    wait_until(Duration::from_secs(30), || {
        let queue = queue.clone();
        let control = control.clone();
        let processor = Arc::clone(&processor);
        async move {
            queue.is_empty().await.unwrap_or(false)
                && control.len().await.unwrap_or(1) == 0
                && processor.processed().len() == 4
        }
    })
    .await;

    // Every path (success, business failure, error, panic) released its lock
    // and each identity was processed exactly once.
    let mut processed = processor.processed();
    processed.sort();
    assert_eq!(processed, ["job-error", "job-fail", "job-ok", "job-panic"]);
    assert_eq!(control.len().await.expect("control len"), 0);

    pool.shutdown(Duration::from_secs(10))
        .await
        .expect("shutdown");
}

#[tokio::test]
#[ignore]
async fn watchdog_emits_exactly_one_kill_signal() {
    init_tracing();
    let config = test_config("watchdog-single-signal")
        .with_max_job_duration(Duration::from_secs(1))
        .with_watchdog_check_interval(Duration::from_secs(1));
    let redis = connect(&config.redis_url).await.expect("redis");
    let kill = KillSwitch::new(redis.clone(), config.kill_set.clone());
    kill.clear().await.expect("clear kill");

    let watchdog = Watchdog::new(redis, kill.clone(), &config);

    // One job never unregisters, one finishes before the deadline.
    watchdog
        .register("stuck-job", "conference-worker-99", JobType::Conference)
        .await;
    watchdog
        .register("quick-job", "conference-worker-98", JobType::Conference)
        .await;
    watchdog.unregister("quick-job").await;

    watchdog.start();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(kill.pending().await.expect("pending"), 1);

    // Level-triggered but consumed: later scans must not re-signal.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let signals = kill.drain().await.expect("drain");
    assert_eq!(signals.len(), 1);
    assert_eq!(signals[0].job_id, "stuck-job");
    assert_eq!(signals[0].worker_id, "conference-worker-99");
    assert_eq!(kill.pending().await.expect("pending"), 0);

    watchdog.stop().await;
}

#[tokio::test]
#[ignore]
async fn pool_baseline_spawns_one_worker_per_type() {
    init_tracing();
    let config = test_config("pool-baseline");
    let redis = connect(&config.redis_url).await.expect("redis");
    let kill = KillSwitch::new(redis.clone(), config.kill_set.clone());
    let watchdog = Arc::new(Watchdog::new(redis.clone(), kill, &config));
    let processor = RecordingProcessor::new(Duration::from_millis(10));

    let pool = PoolManager::new(config, redis, watchdog, processor);
    pool.start().expect("start");

    // Queues are empty, yet the warm baseline is one worker per type.
    let status = pool.status();
    assert_eq!(status.total_live, 2);
    assert_eq!(status.live_workers.get(&JobType::Conference), Some(&1));
    assert_eq!(status.live_workers.get(&JobType::Emission), Some(&1));

    assert!(pool.start().is_err(), "double start must be rejected");
    pool.shutdown(Duration::from_secs(10))
        .await
        .expect("shutdown");
}

#[tokio::test]
#[ignore]
async fn rebalance_scales_to_load_and_shrinks_by_attrition() {
    init_tracing();
    let config = test_config("rebalance-75").with_enabled_types(vec![JobType::Conference]);
    let redis = connect(&config.redis_url).await.expect("redis");

    let control = ControlSet::new(redis.clone(), config.control_set.clone());
    let queue = JobQueue::new(redis.clone(), config.queue_name(JobType::Conference));
    let kill = KillSwitch::new(redis.clone(), config.kill_set.clone());
    control.clear().await.expect("clear control");
    queue.clear().await.expect("clear queue");
    kill.clear().await.expect("clear kill");

    let producer = Producer::new(
        control.clone(),
        queue.clone(),
        JobQueue::new(redis.clone(), config.queue_name(JobType::Emission)),
    );
    for i in 0..75 {
        assert!(producer
            .submit(Job::new(format!("load-{:03}", i), JobType::Conference, i))
            .await
            .expect("submit"));
    }

    let processor = RecordingProcessor::new(Duration::from_millis(200));
    let watchdog = Arc::new(Watchdog::new(redis.clone(), kill, &config));
    let pool = PoolManager::new(config, redis, watchdog, Arc::clone(&processor));
    pool.start().expect("start");

    // 75 pending / batch of 50 -> 2 workers after one rebalance tick.
    pool.rebalance().await;
    let status = pool.status();
    assert_eq!(status.live_workers.get(&JobType::Conference), Some(&2));

    wait_until(Duration::from_secs(60), || {
        let queue = queue.clone();
        let control = control.clone();
        async move {
            queue.is_empty().await.unwrap_or(false) && control.len().await.unwrap_or(1) == 0
        }
    })
    .await;

    // Each job ran exactly once: nothing lost, nothing duplicated.
    let mut processed = processor.processed();
    processed.sort();
    assert_eq!(processed.len(), 75);
    processed.dedup();
    assert_eq!(processed.len(), 75, "no job may be processed twice");

    // Queue drained: the rebalance records shrink intent but never stops
    // workers, so both stay alive until they exit on their own.
    pool.rebalance().await;
    let status = pool.status();
    assert_eq!(status.live_workers.get(&JobType::Conference), Some(&2));

    pool.shutdown(Duration::from_secs(10))
        .await
        .expect("shutdown");
}

#[tokio::test]
#[ignore]
async fn liveness_scan_restores_a_starved_type() {
    init_tracing();
    let config = test_config("liveness-recovery").with_enabled_types(vec![JobType::Conference]);
    let redis = connect(&config.redis_url).await.expect("redis");

    let control = ControlSet::new(redis.clone(), config.control_set.clone());
    let queue = JobQueue::new(redis.clone(), config.queue_name(JobType::Conference));
    let kill = KillSwitch::new(redis.clone(), config.kill_set.clone());
    control.clear().await.expect("clear control");
    queue.clear().await.expect("clear queue");
    kill.clear().await.expect("clear kill");

    let processor = RecordingProcessor::new(Duration::from_millis(10));
    let watchdog = Arc::new(Watchdog::new(redis.clone(), kill.clone(), &config));
    let pool = PoolManager::new(
        config.clone(),
        redis.clone(),
        watchdog,
        Arc::clone(&processor),
    );
    pool.start().expect("start");
    assert_eq!(pool.status().total_live, 1);

    // Kill the only worker: it consumes the signal at its next checkpoint
    // and exits.
    kill.send(&KillSignal::new(
        "conference-worker-1",
        JobType::Conference,
        "whatever-job",
        KillReason::DeadlineExceeded,
    ))
    .await
    .expect("send kill");

    wait_until(Duration::from_secs(15), || {
        let live = pool.status().total_live;
        async move { live == 0 }
    })
    .await;

    // Work arrives while the type has zero workers.
    queue
        .enqueue(&Job::new("after-death", JobType::Conference, 9))
        .await
        .expect("enqueue");

    pool.reconcile_liveness().await;
    assert!(
        pool.status().total_live >= 1,
        "recovery worker must be spawned"
    );

    wait_until(Duration::from_secs(15), || {
        let processor = Arc::clone(&processor);
        async move { processor.processed().contains(&"after-death".to_string()) }
    })
    .await;

    pool.shutdown(Duration::from_secs(10))
        .await
        .expect("shutdown");
}

#[tokio::test]
#[ignore]
async fn kill_replacement_races_ahead_without_double_work() {
    init_tracing();
    let config = test_config("kill-race").with_enabled_types(vec![JobType::Conference]);
    let redis = connect(&config.redis_url).await.expect("redis");

    let control = ControlSet::new(redis.clone(), config.control_set.clone());
    let queue = JobQueue::new(redis.clone(), config.queue_name(JobType::Conference));
    let kill = KillSwitch::new(redis.clone(), config.kill_set.clone());
    control.clear().await.expect("clear control");
    queue.clear().await.expect("clear queue");
    kill.clear().await.expect("clear kill");

    // Worker 1 takes this job and holds its lock for several seconds.
    let slow_processor = RecordingProcessor::new(Duration::from_secs(3));
    let watchdog = Arc::new(Watchdog::new(redis.clone(), kill.clone(), &config));
    let pool = PoolManager::new(
        config.clone(),
        redis.clone(),
        watchdog,
        Arc::clone(&slow_processor),
    );

    let producer = Producer::new(
        control.clone(),
        queue.clone(),
        JobQueue::new(redis.clone(), config.queue_name(JobType::Emission)),
    );
    assert!(producer
        .submit(Job::new("slow-job", JobType::Conference, 1))
        .await
        .expect("submit"));

    pool.start().expect("start");
    wait_until(Duration::from_secs(10), || {
        let control = control.clone();
        async move { control.is_held("slow-job").await.unwrap_or(false) }
    })
    .await;

    // A duplicate descriptor sneaks into the queue (bypassing the producer's
    // dedup, as a crashed producer might) and the watchdog flags the worker.
    queue
        .enqueue(&Job::new("slow-job", JobType::Conference, 1))
        .await
        .expect("enqueue duplicate");
    kill.send(&KillSignal::new(
        "conference-worker-1",
        JobType::Conference,
        "slow-job",
        KillReason::DeadlineExceeded,
    ))
    .await
    .expect("send kill");

    // The liveness pass drains the signal and spawns a replacement before
    // the original worker has stopped.
    pool.reconcile_liveness().await;
    assert_eq!(pool.status().total_live, 2);

    // The replacement pops the duplicate while the lock is still held and
    // must drop it silently.
    wait_until(Duration::from_secs(30), || {
        let queue = queue.clone();
        let control = control.clone();
        async move {
            queue.is_empty().await.unwrap_or(false) && control.len().await.unwrap_or(1) == 0
        }
    })
    .await;

    let processed = slow_processor.processed();
    assert_eq!(
        processed,
        vec!["slow-job".to_string()],
        "the duplicate must never reach the processor"
    );

    pool.shutdown(Duration::from_secs(10))
        .await
        .expect("shutdown");
}

#[tokio::test]
#[ignore]
async fn producer_dedup_and_terminal_cleanup() {
    init_tracing();
    let config = test_config("producer-dedup");
    let redis = connect(&config.redis_url).await.expect("redis");

    let control = ControlSet::new(redis.clone(), config.control_set.clone());
    let conference = JobQueue::new(redis.clone(), config.queue_name(JobType::Conference));
    let emission = JobQueue::new(redis.clone(), config.queue_name(JobType::Emission));
    control.clear().await.expect("clear control");
    conference.clear().await.expect("clear queue");

    let producer = Producer::new(control.clone(), conference.clone(), emission);

    let job = Job::new("dedup-job", JobType::Conference, 5);
    assert!(producer.submit(job.clone()).await.expect("first submit"));
    assert_eq!(conference.len().await.expect("len"), 1);
    assert_eq!(
        control.len().await.expect("control len"),
        0,
        "the probe marker must not outlive the submit"
    );

    // While a worker holds the identity's lock, a later poll cycle must not
    // enqueue the job again.
    assert!(control.acquire("dedup-job").await.expect("worker acquire"));
    assert!(
        !producer.submit(job.clone()).await.expect("second submit"),
        "an executing identity must not be enqueued again"
    );
    assert_eq!(conference.len().await.expect("len"), 1);

    // Terminal cleanup frees a leaked identity for a later cycle.
    assert!(producer.clear_finished("dedup-job").await.expect("clear"));
    assert!(producer.submit(job).await.expect("resubmit"));

    conference.clear().await.expect("cleanup queue");
    control.clear().await.expect("cleanup control");
}

#[tokio::test]
#[ignore]
async fn watchdog_preemption_ends_the_worker_cooperatively() {
    init_tracing();
    let config = test_config("preemption-chain")
        .with_enabled_types(vec![JobType::Conference])
        .with_max_job_duration(Duration::from_secs(1))
        .with_watchdog_check_interval(Duration::from_secs(1));
    let redis = connect(&config.redis_url).await.expect("redis");

    let control = ControlSet::new(redis.clone(), config.control_set.clone());
    let queue = JobQueue::new(redis.clone(), config.queue_name(JobType::Conference));
    let kill = KillSwitch::new(redis.clone(), config.kill_set.clone());
    control.clear().await.expect("clear control");
    queue.clear().await.expect("clear queue");
    kill.clear().await.expect("clear kill");

    // The job would run for a minute; the deadline is one second.
    let processor = RecordingProcessor::new(Duration::from_secs(60));
    let watchdog = Arc::new(Watchdog::new(redis.clone(), kill.clone(), &config));
    watchdog.start();

    let pool = PoolManager::new(
        config.clone(),
        redis.clone(),
        Arc::clone(&watchdog),
        processor,
    );

    let producer = Producer::new(
        control.clone(),
        queue.clone(),
        JobQueue::new(redis.clone(), config.queue_name(JobType::Emission)),
    );
    assert!(producer
        .submit(Job::new("hung-job", JobType::Conference, 2))
        .await
        .expect("submit"));

    pool.start().expect("start");

    // Watchdog flags the job, the worker's mid-job watcher cancels the
    // token, the flow observes it, and the unit exits after cleanup.
    wait_until(Duration::from_secs(30), || {
        let live = pool.status().total_live;
        async move { live == 0 }
    })
    .await;

    assert_eq!(
        control.len().await.expect("control"),
        0,
        "lock must be released"
    );
    assert_eq!(
        kill.pending().await.expect("kill"),
        0,
        "signal must be consumed"
    );

    watchdog.stop().await;
    pool.shutdown(Duration::from_secs(10))
        .await
        .expect("shutdown");
}
