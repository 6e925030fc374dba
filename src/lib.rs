//! docflow: job orchestration core for browser-automated document emission.
//!
//! This library coordinates the unattended processing of shipment records
//! through two automation pipelines (conference and emission): Redis-backed
//! job queues, a distributed per-job lock, dynamically sized worker pools,
//! a stuck-job watchdog with cooperative preemption, and a batched
//! write-back path for results. The browser automation itself and the
//! spreadsheet API stay outside, behind the [`JobProcessor`], [`RowSource`]
//! and [`WriteBackend`] traits; the host process wires them together.

// Core modules
pub mod config;
pub mod coordination;
pub mod job;
pub mod metrics;
pub mod poller;
pub mod processor;
pub mod producer;
pub mod scheduler;
pub mod sink;
pub mod utils;
pub mod writer;

// Re-export the types a host process needs to wire the system together
pub use config::{ConfigError, OrchestratorConfig};
pub use coordination::{
    connect, ControlSet, CoordinationError, JobQueue, KillReason, KillSignal, KillSwitch,
};
pub use job::{Job, JobType};
pub use poller::{CycleStats, Poller, PollerConfig, PollerError, RowAction, RowSnapshot, RowSource};
pub use processor::{CancellationToken, JobProcessor, ProcessOutcome, ProcessorError};
pub use producer::Producer;
pub use scheduler::{
    required_workers, PoolError, PoolManager, PoolStatus, StuckJob, Watchdog, WatchdogStatus,
};
pub use sink::{ResultRecord, ResultSink};
pub use writer::{CellUpdate, WriteBackend, Writer, WriterConfig, WriterError};
