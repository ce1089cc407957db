// Session storage backends
// Durable key/value port, write-through session repository and per-user index

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::types::Session;

/// Storage errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("Connection error: {0}")]
    ConnectionError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Per-write options
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// Entry is dropped once this elapses
    pub ttl: Option<Duration>,
}

impl StoreOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { ttl: Some(ttl) }
    }
}

/// Namespaced key/value store the engine persists through
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn set(&self, key: &str, value: Value, options: StoreOptions)
    -> Result<(), StorageError>;

    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

/// In-memory durable store with per-entry TTL
pub struct MemoryDurableStore {
    entries: Arc<RwLock<HashMap<String, StoredValue>>>,
    fail_get: AtomicBool,
    fail_set: AtomicBool,
    fail_delete: AtomicBool,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            fail_get: AtomicBool::new(false),
            fail_set: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
        }
    }

    /// Make subsequent reads fail
    pub fn set_fail_get(&self, fail: bool) {
        self.fail_get.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent writes fail
    pub fn set_fail_set(&self, fail: bool) {
        self.fail_set.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent deletes fail
    pub fn set_fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    /// Number of live entries
    pub async fn len(&self) -> usize {
        let now = Utc::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.expires_at.is_none_or(|at| now <= at))
            .count()
    }
}

impl Default for MemoryDurableStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for MemoryDurableStore {
    async fn set(
        &self,
        key: &str,
        value: Value,
        options: StoreOptions,
    ) -> Result<(), StorageError> {
        if self.fail_set.load(Ordering::SeqCst) {
            return Err(StorageError::ConnectionError("writes disabled".to_string()));
        }

        let expires_at = options.ttl.and_then(|ttl| Utc::now().checked_add_signed(ttl));
        self.entries
            .write()
            .await
            .insert(key.to_string(), StoredValue { value, expires_at });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        if self.fail_get.load(Ordering::SeqCst) {
            return Err(StorageError::ConnectionError("reads disabled".to_string()));
        }

        let mut entries = self.entries.write().await;

        if let Some(entry) = entries.get(key)
            && let Some(expires_at) = entry.expires_at
            && Utc::now() > expires_at
        {
            entries.remove(key);
            debug!("Dropped expired store entry {}", key);
            return Ok(None);
        }

        Ok(entries.get(key).map(|e| e.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(StorageError::ConnectionError("deletes disabled".to_string()));
        }

        self.entries.write().await.remove(key);
        Ok(())
    }
}

fn session_key(session_id: &str) -> String {
    format!("sessions.{}", session_id)
}

/// Session repository: in-memory cache over a durable store.
/// Reads fall through to the store on a cache miss; writes go to the store first.
pub struct SessionRepository {
    cache: RwLock<HashMap<String, Session>>,
    durable: Arc<dyn DurableStore>,
}

impl SessionRepository {
    pub fn new(durable: Arc<dyn DurableStore>) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            durable,
        }
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<Session>, StorageError> {
        if let Some(session) = self.cache.read().await.get(session_id) {
            return Ok(Some(session.clone()));
        }

        let Some(value) = self.durable.get(&session_key(session_id)).await? else {
            return Ok(None);
        };

        let session: Session = serde_json::from_value(value)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;

        if session.id != session_id {
            return Err(StorageError::InvalidData(format!(
                "Stored session id {} does not match key {}",
                session.id, session_id
            )));
        }

        debug!("Loaded session {} from durable store", session_id);
        self.cache
            .write()
            .await
            .insert(session_id.to_string(), session.clone());
        Ok(Some(session))
    }

    pub async fn save(&self, session: &Session) -> Result<(), StorageError> {
        let value = serde_json::to_value(session)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;

        // Durable entry lives as long as the session itself
        let remaining = session.expires_at - Utc::now();
        let options = if remaining > Duration::zero() {
            StoreOptions::with_ttl(remaining)
        } else {
            StoreOptions::default()
        };

        self.durable
            .set(&session_key(&session.id), value, options)
            .await?;
        self.cache
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    /// Remove a session from cache and store under one cache write lock
    pub async fn remove(&self, session_id: &str) -> Result<(), StorageError> {
        let mut cache = self.cache.write().await;
        cache.remove(session_id);
        self.durable.delete(&session_key(session_id)).await
    }

    pub async fn cached_len(&self) -> usize {
        self.cache.read().await.len()
    }
}

/// User id -> session ids in login order, bounded by FIFO eviction
pub struct SessionIndex {
    by_user: RwLock<HashMap<String, VecDeque<String>>>,
    /// 0 = unbounded
    max_per_user: usize,
}

impl SessionIndex {
    pub fn new(max_per_user: usize) -> Self {
        Self {
            by_user: RwLock::new(HashMap::new()),
            max_per_user,
        }
    }

    /// Append a session; returns the ids evicted to respect the limit, oldest first
    pub async fn insert(&self, user_id: &str, session_id: &str) -> Vec<String> {
        let mut by_user = self.by_user.write().await;
        let ids = by_user.entry(user_id.to_string()).or_default();

        if !ids.iter().any(|id| id == session_id) {
            ids.push_back(session_id.to_string());
        }

        let mut evicted = Vec::new();
        if self.max_per_user > 0 {
            while ids.len() > self.max_per_user {
                if let Some(oldest) = ids.pop_front() {
                    evicted.push(oldest);
                }
            }
        }

        if !evicted.is_empty() {
            info!(
                "User {} exceeded {} sessions, evicting {:?}",
                user_id, self.max_per_user, evicted
            );
        }

        evicted
    }

    pub async fn remove(&self, user_id: &str, session_id: &str) -> bool {
        let mut by_user = self.by_user.write().await;
        let Some(ids) = by_user.get_mut(user_id) else {
            return false;
        };

        let before = ids.len();
        ids.retain(|id| id != session_id);
        let removed = ids.len() != before;

        if ids.is_empty() {
            by_user.remove(user_id);
        }
        removed
    }

    /// Copy of the user's session ids in login order
    pub async fn snapshot(&self, user_id: &str) -> Vec<String> {
        self.by_user
            .read()
            .await
            .get(user_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn count(&self, user_id: &str) -> usize {
        self.by_user
            .read()
            .await
            .get(user_id)
            .map_or(0, |ids| ids.len())
    }

    pub async fn user_count(&self) -> usize {
        self.by_user.read().await.len()
    }

    pub async fn total_sessions(&self) -> usize {
        self.by_user.read().await.values().map(|ids| ids.len()).sum()
    }
}
