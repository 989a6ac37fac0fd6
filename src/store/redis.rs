//! Redis store backend. `SET ... NX EX` supplies the atomic set-if-absent
//! the replay check relies on, and it holds across a fleet of server
//! instances pointed at the same Redis.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::info;

use super::{challenge_key, spent_key, ChallengeStore};
use crate::error::GateError;

pub struct RedisStore {
    client: redis::Client,
}

impl RedisStore {
    /// Connects and pings so a bad address fails at startup, not on the
    /// first request.
    pub async fn connect(addr: &str) -> Result<Self, GateError> {
        let client = redis::Client::open(addr).map_err(GateError::internal)?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(GateError::internal)?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(GateError::internal)?;
        info!(addr, "connected to challenge store");
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<MultiplexedConnection, GateError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(GateError::internal)
    }
}

#[async_trait]
impl ChallengeStore for RedisStore {
    async fn put(&self, token: &str, challenge: &str, ttl: Duration) -> Result<(), GateError> {
        let mut conn = self.conn().await?;
        redis::cmd("SET")
            .arg(challenge_key(token))
            .arg(challenge)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(GateError::internal)
    }

    async fn get(&self, token: &str) -> Result<Option<String>, GateError> {
        let mut conn = self.conn().await?;
        redis::cmd("GET")
            .arg(challenge_key(token))
            .query_async::<_, Option<String>>(&mut conn)
            .await
            .map_err(GateError::internal)
    }

    async fn mark_spent(&self, token: &str, ttl: Duration) -> Result<bool, GateError> {
        let mut conn = self.conn().await?;
        // SET NX EX returns OK to exactly one concurrent caller.
        let created: Option<String> = redis::cmd("SET")
            .arg(spent_key(token))
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(GateError::internal)?;
        Ok(created.is_some())
    }

    async fn delete(&self, token: &str) -> Result<(), GateError> {
        let mut conn = self.conn().await?;
        redis::cmd("DEL")
            .arg(challenge_key(token))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(GateError::internal)
    }

    async fn close(&self) -> Result<(), GateError> {
        // Connections are multiplexed and close with the client.
        Ok(())
    }
}
