//! The control set: a distributed, non-reentrant lock keyed by job identity.
//!
//! Membership in the set *is* the lock. SADD reports whether the member was
//! newly inserted, which makes acquisition a single atomic operation shared
//! by producers (dedup before enqueue) and workers (exclusivity before
//! processing). A leaked entry permanently blocks that identity, so holders
//! must release on every exit path.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::CoordinationError;

/// Client for the in-flight control set.
#[derive(Clone)]
pub struct ControlSet {
    redis: ConnectionManager,
    key: String,
}

impl ControlSet {
    /// Creates a control-set client over an existing connection.
    pub fn new(redis: ConnectionManager, key: impl Into<String>) -> Self {
        Self {
            redis,
            key: key.into(),
        }
    }

    /// Attempts to acquire the lock for a job identity.
    ///
    /// Returns `true` if this caller now holds the lock, `false` if the
    /// identity is already in flight somewhere else. Non-reentrant: a second
    /// acquire from the same holder also returns `false`.
    pub async fn acquire(&self, id: &str) -> Result<bool, CoordinationError> {
        let mut conn = self.redis.clone();
        let added: i64 = conn.sadd(&self.key, id).await?;
        Ok(added == 1)
    }

    /// Releases the lock for a job identity.
    ///
    /// Unconditional and idempotent: releasing an identity that is not held
    /// returns `false` and is not an error.
    pub async fn release(&self, id: &str) -> Result<bool, CoordinationError> {
        let mut conn = self.redis.clone();
        let removed: i64 = conn.srem(&self.key, id).await?;
        Ok(removed == 1)
    }

    /// Returns whether an identity is currently in flight.
    pub async fn is_held(&self, id: &str) -> Result<bool, CoordinationError> {
        let mut conn = self.redis.clone();
        let held: bool = conn.sismember(&self.key, id).await?;
        Ok(held)
    }

    /// Returns the number of in-flight identities.
    pub async fn len(&self) -> Result<usize, CoordinationError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.scard(&self.key).await?;
        Ok(len)
    }

    /// Deletes every lock entry.
    ///
    /// **Warning**: only safe when no producers or workers are running.
    pub async fn clear(&self) -> Result<(), CoordinationError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(&self.key).await?;
        Ok(())
    }

    /// Returns the set key.
    pub fn key(&self) -> &str {
        &self.key
    }
}
