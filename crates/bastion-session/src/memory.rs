//! Process-local session store.
//!
//! Used as the fallback while the durable store is down. Records live only
//! as long as the process.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bastion_core::{Clock, RealClock};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::{
    error::Result,
    store::{validate_key, SessionStore},
};

#[derive(Debug, Clone)]
struct Record {
    value: Value,
    expires_at: Option<Instant>,
}

impl Record {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-memory [`SessionStore`] with clock-driven expiry.
#[derive(Debug, Clone)]
pub struct MemorySessionStore {
    records: Arc<RwLock<HashMap<String, Record>>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new(Arc::new(RealClock::new()))
    }
}

impl MemorySessionStore {
    /// Creates an empty store that reads time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { records: Arc::new(RwLock::new(HashMap::new())), clock }
    }

    /// Records held, including expired ones not yet cleaned up.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether the store holds no records at all.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn save(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<()> {
        validate_key(key)?;
        let expires_at = ttl.and_then(|ttl| self.clock.now().checked_add(ttl));
        let record = Record { value: value.clone(), expires_at };
        self.records.write().await.insert(key.to_string(), record);
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<Value>> {
        let now = self.clock.now();
        let records = self.records.read().await;
        Ok(records.get(key).filter(|r| r.is_live(now)).map(|r| r.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = self.clock.now();
        Ok(self.records.write().await.remove(key).is_some_and(|r| r.is_live(now)))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let now = self.clock.now();
        Ok(self.records.read().await.get(key).is_some_and(|r| r.is_live(now)))
    }

    async fn cleanup(&self) -> Result<u64> {
        let now = self.clock.now();
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, r| r.is_live(now));
        Ok((before - records.len()) as u64)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let now = self.clock.now();
        let mut keys: Vec<String> = self
            .records
            .read()
            .await
            .iter()
            .filter(|(key, r)| key.starts_with(prefix) && r.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use bastion_core::TestClock;
    use serde_json::json;

    use super::*;

    fn store() -> (MemorySessionStore, TestClock) {
        let clock = TestClock::new();
        (MemorySessionStore::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn save_load_delete() {
        let (store, _) = store();
        store.save("s:1", &json!({"turns": 3}), None).await.unwrap();

        assert_eq!(store.load("s:1").await.unwrap(), Some(json!({"turns": 3})));
        assert!(store.exists("s:1").await.unwrap());
        assert!(store.delete("s:1").await.unwrap());
        assert!(!store.delete("s:1").await.unwrap());
        assert_eq!(store.load("s:1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_records_behave_as_absent() {
        let (store, clock) = store();
        store.save("s:short", &json!(1), Some(Duration::from_secs(30))).await.unwrap();
        store.save("s:long", &json!(2), None).await.unwrap();

        clock.advance(Duration::from_secs(31));

        assert_eq!(store.load("s:short").await.unwrap(), None);
        assert!(!store.exists("s:short").await.unwrap());
        assert_eq!(store.list("s:").await.unwrap(), vec!["s:long".to_string()]);
        assert_eq!(store.len().await, 2);

        assert_eq!(store.cleanup().await.unwrap(), 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn list_filters_by_prefix_and_sorts() {
        let (store, _) = store();
        for key in ["b:2", "a:1", "b:1"] {
            store.save(key, &json!(null), None).await.unwrap();
        }
        assert_eq!(store.list("b:").await.unwrap(), vec!["b:1", "b:2"]);
        assert_eq!(store.list("").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn empty_key_is_rejected() {
        let (store, _) = store();
        assert!(store.save("", &json!(1), None).await.is_err());
        assert!(store.is_empty().await);
    }
}
