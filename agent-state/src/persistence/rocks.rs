//! RocksDB-backed durable backend
//!
//! Values carry an 8-byte big-endian expiry header (unix millis, 0 = never)
//! ahead of the payload. Expired values are dropped lazily on read. All DB
//! calls run on the blocking pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rocksdb::{ColumnFamilyDescriptor, Options, DB};

use super::backend::DurableBackend;
use super::schema::{ALL_CFS, CF_AGENTS};
use crate::error::PersistenceError;

const HEADER_LEN: usize = 8;

/// Persistent backend over a RocksDB instance
pub struct RocksBackend {
    db: Arc<DB>,
    path: PathBuf,
}

impl RocksBackend {
    /// Open or create a database at the given path
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let path = path.into();

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, &path, cf_descriptors)
            .map_err(PersistenceError::backend)?;

        Ok(Self {
            db: Arc::new(db),
            path,
        })
    }

    /// Get the database path
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, PersistenceError>
    where
        T: Send + 'static,
        F: FnOnce(&DB) -> Result<T, PersistenceError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(PersistenceError::backend)?
    }
}

fn encode_value(value: &[u8], ttl: Option<Duration>) -> Vec<u8> {
    let expires_at = ttl
        .map(|ttl| {
            let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
            (Utc::now().timestamp_millis().max(0) as u64).saturating_add(ttl_ms)
        })
        .unwrap_or(0);
    let mut bytes = Vec::with_capacity(HEADER_LEN + value.len());
    bytes.extend_from_slice(&expires_at.to_be_bytes());
    bytes.extend_from_slice(value);
    bytes
}

/// Payload if the value is still live. `Err` on a truncated header.
fn decode_value(bytes: &[u8], now_ms: u64) -> Result<Option<Vec<u8>>, PersistenceError> {
    let header: [u8; HEADER_LEN] = bytes
        .get(..HEADER_LEN)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| PersistenceError::Integrity {
            reason: "stored value shorter than expiry header".to_string(),
        })?;
    let expires_at = u64::from_be_bytes(header);
    if expires_at != 0 && expires_at <= now_ms {
        return Ok(None);
    }
    Ok(Some(bytes[HEADER_LEN..].to_vec()))
}

#[async_trait]
impl DurableBackend for RocksBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        let key = key.to_string();
        self.blocking(move |db| {
            let cf = db
                .cf_handle(CF_AGENTS)
                .ok_or_else(|| PersistenceError::backend("missing column family"))?;
            let Some(bytes) = db
                .get_cf(&cf, key.as_bytes())
                .map_err(PersistenceError::backend)?
            else {
                return Ok(None);
            };
            let now_ms = Utc::now().timestamp_millis().max(0) as u64;
            let value = decode_value(&bytes, now_ms)?;
            if value.is_none() {
                db.delete_cf(&cf, key.as_bytes())
                    .map_err(PersistenceError::backend)?;
            }
            Ok(value)
        })
        .await
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), PersistenceError> {
        let key = key.to_string();
        self.blocking(move |db| {
            let cf = db
                .cf_handle(CF_AGENTS)
                .ok_or_else(|| PersistenceError::backend("missing column family"))?;
            db.put_cf(&cf, key.as_bytes(), encode_value(&value, ttl))
                .map_err(PersistenceError::backend)
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), PersistenceError> {
        let key = key.to_string();
        self.blocking(move |db| {
            let cf = db
                .cf_handle(CF_AGENTS)
                .ok_or_else(|| PersistenceError::backend("missing column family"))?;
            db.delete_cf(&cf, key.as_bytes())
                .map_err(PersistenceError::backend)
        })
        .await
    }
}
