//! Pluggable durable key-value backend
//!
//! The adapter only needs `get`, `set` with an optional TTL, and `delete`.
//! `MemoryBackend` is the in-process implementation used by tests and the
//! operator binary; it can be switched offline to exercise failure paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::PersistenceError;

/// Durable byte store keyed by string.
#[async_trait]
pub trait DurableBackend: Send + Sync {
    /// Stored bytes, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError>;

    /// Overwrite `key`. A `ttl` lets the backend drop the value later.
    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), PersistenceError>;

    /// Remove `key`; absent keys are fine.
    async fn delete(&self, key: &str) -> Result<(), PersistenceError>;
}

struct StoredValue {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-memory backend with TTL support.
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, StoredValue>>,
    available: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Create a shared reference to this backend
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Simulate an outage: while unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Live keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, v)| v.is_live(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Raw stored bytes, bypassing availability.
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.lock().get(key).map(|v| v.bytes.clone())
    }

    /// Overwrite raw bytes, bypassing availability.
    pub fn put_raw(&self, key: &str, bytes: Vec<u8>) {
        self.entries.lock().insert(
            key.to_string(),
            StoredValue {
                bytes,
                expires_at: None,
            },
        );
    }

    fn check_available(&self) -> Result<(), PersistenceError> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(PersistenceError::backend("memory backend unavailable"))
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(value) if value.is_live(now) => Ok(Some(value.bytes.clone())),
            Some(_) => {
                entries.remove(key);
                debug!(key, "Dropped expired entry");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), PersistenceError> {
        self.check_available()?;
        self.entries.lock().insert(
            key.to_string(),
            StoredValue {
                bytes: value,
                expires_at: ttl.and_then(|ttl| Instant::now().checked_add(ttl)),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), PersistenceError> {
        self.check_available()?;
        self.entries.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let backend = MemoryBackend::new();
        backend.set("k", b"v".to_vec(), None).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some(b"v".to_vec()));

        backend.delete("k").await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), None);
        backend.delete("k").await.unwrap();
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let backend = MemoryBackend::new();
        backend
            .set("k", b"v".to_vec(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert!(backend.keys().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_backend_fails() {
        let backend = MemoryBackend::new();
        backend.set_available(false);
        let err = backend.set("k", Vec::new(), None).await.unwrap_err();
        assert!(err.is_retryable());

        backend.set_available(true);
        backend.set("k", Vec::new(), None).await.unwrap();
    }
}
