//! The ephemeral challenge store: TTL'd key/value with an atomic
//! single-use marker. All session state the protocol needs lives here, so
//! any server instance sharing the store can verify any instance's
//! challenge.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::GateError;

mod memory;
mod redis;

pub use self::redis::RedisStore;
pub use memory::MemoryStore;

pub(crate) fn challenge_key(token: &str) -> String {
    format!("challenge:{token}")
}

pub(crate) fn spent_key(token: &str) -> String {
    format!("challenge:spent:{token}")
}

#[async_trait]
pub trait ChallengeStore: Send + Sync {
    /// Unconditional set with expiry.
    async fn put(&self, token: &str, challenge: &str, ttl: Duration) -> Result<(), GateError>;

    /// Returns the stored challenge, or None once expired or deleted.
    async fn get(&self, token: &str) -> Result<Option<String>, GateError>;

    /// Atomic set-if-absent on the spent marker. Returns true iff this
    /// caller created the marker. This is the replay-prevention
    /// linearization point and must stay atomic across server instances.
    async fn mark_spent(&self, token: &str, ttl: Duration) -> Result<bool, GateError>;

    async fn delete(&self, token: &str) -> Result<(), GateError>;

    async fn close(&self) -> Result<(), GateError>;
}
