//! Coordination-store primitives backing the orchestration core.
//!
//! The core depends on three Redis primitives, each wrapped by a small typed
//! client:
//!
//! - [`JobQueue`]: a durable FIFO list per job type with blocking pop
//! - [`ControlSet`]: a set used as a distributed, non-reentrant lock keyed by
//!   job identity (set membership *is* the lock)
//! - [`KillSwitch`]: a set of pending preemption requests with
//!   delete-on-read consumption
//!
//! Every mutation issued here is a single atomic Redis command. The core
//! never performs a check-then-act pair of separate operations against the
//! store; the return value of the mutating command (SADD/SREM) is the only
//! source of truth about who won a race.

pub mod control;
pub mod kill;
pub mod queue;

pub use control::ControlSet;
pub use kill::{KillReason, KillSignal, KillSwitch};
pub use queue::JobQueue;

use redis::aio::ConnectionManager;
use thiserror::Error;

/// Errors that can occur during coordination-store operations.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// Failed to establish the initial connection.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// A Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// A record crossing the store could not be (de)serialized.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Connects to the coordination store.
///
/// Returns a [`ConnectionManager`] that transparently reconnects after
/// transient failures. Clones of it are cheap and share the underlying
/// connection, so a single connect call serves every component.
///
/// # Errors
///
/// Returns `CoordinationError::ConnectionFailed` if the URL is invalid or
/// the initial connection cannot be established.
pub async fn connect(redis_url: &str) -> Result<ConnectionManager, CoordinationError> {
    let client = redis::Client::open(redis_url)
        .map_err(|e| CoordinationError::ConnectionFailed(e.to_string()))?;

    ConnectionManager::new(client)
        .await
        .map_err(|e| CoordinationError::ConnectionFailed(e.to_string()))
}
