//! Single-process store backend. Same observable semantics as the Redis
//! backend, minus cross-process sharing; used by tests and by deployments
//! that run exactly one instance.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{challenge_key, spent_key, ChallengeStore};
use crate::error::GateError;

struct Entry {
    value: String,
    expires_at: Instant,
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, key: String, value: String, ttl: Duration) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

#[async_trait]
impl ChallengeStore for MemoryStore {
    async fn put(&self, token: &str, challenge: &str, ttl: Duration) -> Result<(), GateError> {
        self.set(challenge_key(token), challenge.to_string(), ttl);
        Ok(())
    }

    async fn get(&self, token: &str) -> Result<Option<String>, GateError> {
        Ok(self.live_value(&challenge_key(token)))
    }

    async fn mark_spent(&self, token: &str, ttl: Duration) -> Result<bool, GateError> {
        let key = spent_key(token);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        // Set-if-absent under the one lock; an expired marker counts as absent.
        if let Some(existing) = entries.get(&key) {
            if existing.expires_at > Instant::now() {
                return Ok(false);
            }
        }
        entries.insert(
            key,
            Entry {
                value: "1".to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn delete(&self, token: &str) -> Result<(), GateError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(&challenge_key(token));
        Ok(())
    }

    async fn close(&self) -> Result<(), GateError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn put_then_get() {
        let store = MemoryStore::new();
        store.put("tok", "header", TTL).await.unwrap();
        assert_eq!(store.get("tok").await.unwrap().as_deref(), Some("header"));
    }

    #[tokio::test]
    async fn get_misses_after_delete() {
        let store = MemoryStore::new();
        store.put("tok", "header", TTL).await.unwrap();
        store.delete("tok").await.unwrap();
        assert_eq!(store.get("tok").await.unwrap(), None);
    }

    #[tokio::test]
    async fn entries_expire() {
        let store = MemoryStore::new();
        store
            .put("tok", "header", Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("tok").await.unwrap(), None);
    }

    #[tokio::test]
    async fn mark_spent_is_single_shot() {
        let store = MemoryStore::new();
        assert!(store.mark_spent("tok", TTL).await.unwrap());
        assert!(!store.mark_spent("tok", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn spent_marker_outlives_challenge() {
        let store = MemoryStore::new();
        store.put("tok", "header", TTL).await.unwrap();
        assert!(store.mark_spent("tok", TTL).await.unwrap());
        store.delete("tok").await.unwrap();
        // The marker still shadows the token after the primary key is gone.
        assert!(!store.mark_spent("tok", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_mark_spent_admits_exactly_one() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.mark_spent("tok", TTL).await.unwrap()
            }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
