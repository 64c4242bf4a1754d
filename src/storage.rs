//! Storage capabilities used by the offline queue and the session.
//!
//! The coordinator and realtime client only see these traits; `db::SqliteStore`
//! is the durable implementation and `MemoryKv` backs short-lived sessions.

use crate::model::{PendingRequest, RequestDescriptor};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("local store unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable queue of requests waiting to be replayed.
#[async_trait]
pub trait PendingStore: Send + Sync {
    async fn enqueue(&self, request: &RequestDescriptor) -> StoreResult<i64>;

    /// Unsynced records in insertion order.
    async fn list_pending(&self) -> StoreResult<Vec<PendingRequest>>;

    /// Missing ids are ignored.
    async fn mark_synced(&self, id: i64) -> StoreResult<()>;

    /// Deletes every synced record and returns how many were removed.
    async fn purge_synced(&self) -> StoreResult<u64>;

    async fn count_pending(&self) -> StoreResult<i64>;
}

/// Small string key/value capability (session token, connection id).
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;
    async fn delete(&self, key: &str) -> StoreResult<()>;
    async fn keys(&self) -> StoreResult<Vec<String>>;
}

/// Process-local key/value store.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl KeyValueStore for MemoryKv {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.lock().remove(key);
        Ok(())
    }

    async fn keys(&self) -> StoreResult<Vec<String>> {
        Ok(self.lock().keys().cloned().collect())
    }
}
