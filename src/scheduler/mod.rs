//! Job orchestration core: worker pools, the worker loop, and the watchdog.
//!
//! # Architecture
//!
//! ```text
//!   ┌──────────┐  sadd + rpush   ┌─────────────────┐
//!   │ Producer ├────────────────►│ queue:<type>    │
//!   └──────────┘                 │ control:inflight│  Redis
//!                                └───────┬─────────┘
//!                 PoolManager            │ blpop + sadd
//!          ┌───────────────────┐         ▼
//!          │ rebalance loop    │   ┌─────────┐ ┌─────────┐ ┌─────────┐
//!          │ liveness loop     │──►│ Worker 1│ │ Worker 2│ │ Worker N│
//!          │ kill-signal drain │   └────┬────┘ └────┬────┘ └────┬────┘
//!          └───────────────────┘        │ register / unregister │
//!                     ▲                 ▼                       ▼
//!                     │  kill      ┌──────────────────────────────┐
//!                     └────────────┤           Watchdog           │
//!                       signals    └──────────────────────────────┘
//! ```
//!
//! Each worker owns one automation session and processes one job at a time.
//! The control set guarantees at-most-one in-flight execution per job
//! identity across any number of workers and producers; the watchdog bounds
//! job duration; the pool manager keeps worker counts aligned with load and
//! replaces units that die or get preempted.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use docflow::{connect, KillSwitch, OrchestratorConfig, PoolManager, Watchdog};
//!
//! let config = OrchestratorConfig::from_env()?;
//! let redis = connect(&config.redis_url).await?;
//!
//! let kill = KillSwitch::new(redis.clone(), config.kill_set.clone());
//! let watchdog = Arc::new(Watchdog::new(redis.clone(), kill, &config));
//! watchdog.start();
//!
//! let pool = PoolManager::new(config, redis, Arc::clone(&watchdog), processor);
//! pool.start()?;
//! ```

pub mod pool;
pub mod watchdog;
pub(crate) mod worker;

pub use pool::{required_workers, PoolError, PoolManager, PoolStatus};
pub use watchdog::{StuckJob, Watchdog, WatchdogStatus};
