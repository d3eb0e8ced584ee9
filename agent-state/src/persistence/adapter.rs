//! Snapshot persistence and recovery
//!
//! A persisted snapshot is a versioned JSON envelope around the agent
//! aggregate, prefixed by a one-byte codec tag:
//!
//! ```text
//! [tag][payload]
//!   0x00  payload = JSON envelope
//!   0x01  payload = zlib(JSON envelope)
//! ```
//!
//! No agent lock is held while backend I/O is in flight; the snapshot is
//! captured first and every backend call is bounded by the configured timeout.

use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::backend::DurableBackend;
use super::schema::keys;
use crate::config::{CompressionConfig, PersistenceConfig};
use crate::error::{PersistenceError, StateError, StateResult};
use crate::state::{AgentEntry, AgentId, AgentState, ChildLinks};

const TAG_JSON: u8 = 0x00;
const TAG_ZLIB: u8 = 0x01;

/// Envelope written to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedAgentState {
    /// Schema version for forward compatibility.
    pub schema_version: u32,
    pub persisted_at: DateTime<Utc>,
    pub state: AgentState,
    /// Entries dropped from the head of `state.history` by the cap.
    #[serde(default)]
    pub truncated_history: usize,
    #[serde(default)]
    pub ignored_children: BTreeSet<AgentId>,
    #[serde(default)]
    pub completed_children: BTreeSet<AgentId>,
}

impl PersistedAgentState {
    /// Current schema version.
    pub const CURRENT_VERSION: u32 = 1;

    /// Capture an entry, keeping at most `history_cap` recent history entries.
    pub fn capture(entry: &AgentEntry, history_cap: usize) -> Self {
        let mut state = entry.to_state();
        let links = entry.links();
        let truncated_history = state.history.len().saturating_sub(history_cap);
        state.history.drain(..truncated_history);

        Self {
            schema_version: Self::CURRENT_VERSION,
            persisted_at: Utc::now(),
            state,
            truncated_history,
            ignored_children: links.ignored,
            completed_children: links.completed,
        }
    }

    /// Parent-side child bookkeeping carried by the snapshot.
    pub fn links(&self) -> ChildLinks {
        ChildLinks {
            children: self.state.children_ids.clone(),
            ignored: self.ignored_children.clone(),
            completed: self.completed_children.clone(),
        }
    }

    /// Structural checks run before a snapshot is trusted.
    pub fn validate(&self, agent_id: &str) -> Result<(), PersistenceError> {
        if self.schema_version > Self::CURRENT_VERSION {
            return Err(PersistenceError::VersionMismatch {
                expected: Self::CURRENT_VERSION,
                found: self.schema_version,
            });
        }

        let mut errors = Vec::new();
        if self.state.agent_id != agent_id {
            errors.push(format!(
                "snapshot belongs to {}, not {}",
                self.state.agent_id, agent_id
            ));
        }
        if let Some(last) = self.state.history.last() {
            if last.to != self.state.current_state {
                errors.push(format!(
                    "last transition lands on {} but current state is {}",
                    last.to, self.state.current_state
                ));
            }
        }
        if self
            .state
            .checkpoints
            .windows(2)
            .any(|pair| pair[0].sequence >= pair[1].sequence)
        {
            errors.push("checkpoint sequences not increasing".to_string());
        }
        if self
            .state
            .checkpoints
            .iter()
            .any(|c| c.version > self.state.version)
        {
            errors.push("checkpoint newer than snapshot version".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(PersistenceError::Integrity {
                reason: errors.join("; "),
            })
        }
    }
}

/// Outcome of a successful persist.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistReport {
    pub agent_id: AgentId,
    pub version: u64,
    /// Size of the JSON envelope.
    pub original_bytes: usize,
    /// Size written to the backend, tag included.
    pub stored_bytes: usize,
    pub compressed: bool,
}

impl PersistReport {
    /// `original_bytes / stored_bytes`; above 1.0 when compression helped.
    pub fn compression_ratio(&self) -> f64 {
        if self.stored_bytes == 0 {
            1.0
        } else {
            self.original_bytes as f64 / self.stored_bytes as f64
        }
    }
}

/// Encode an envelope, compressing when `compression` applies.
pub fn encode(
    snapshot: &PersistedAgentState,
    compression: Option<&CompressionConfig>,
) -> Result<(Vec<u8>, usize, bool), PersistenceError> {
    let json = serde_json::to_vec(snapshot).map_err(|e| PersistenceError::Serialize {
        reason: e.to_string(),
    })?;
    let original = json.len();

    match compression {
        Some(config) if original >= config.min_size_bytes => {
            let mut encoder = ZlibEncoder::new(vec![TAG_ZLIB], Compression::new(config.level));
            encoder
                .write_all(&json)
                .map_err(|e| PersistenceError::Compression {
                    reason: e.to_string(),
                })?;
            let bytes = encoder.finish().map_err(|e| PersistenceError::Compression {
                reason: e.to_string(),
            })?;
            Ok((bytes, original, true))
        }
        _ => {
            let mut bytes = Vec::with_capacity(original + 1);
            bytes.push(TAG_JSON);
            bytes.extend_from_slice(&json);
            Ok((bytes, original, false))
        }
    }
}

/// Decode stored bytes. Does not run integrity checks.
pub fn decode(bytes: &[u8]) -> Result<PersistedAgentState, PersistenceError> {
    let (tag, payload) = bytes
        .split_first()
        .ok_or_else(|| PersistenceError::Deserialize {
            reason: "empty payload".to_string(),
        })?;

    let json = match *tag {
        TAG_JSON => payload.to_vec(),
        TAG_ZLIB => {
            let mut json = Vec::new();
            ZlibDecoder::new(payload)
                .read_to_end(&mut json)
                .map_err(|e| PersistenceError::Compression {
                    reason: e.to_string(),
                })?;
            json
        }
        other => {
            return Err(PersistenceError::Deserialize {
                reason: format!("unknown codec tag {:#04x}", other),
            })
        }
    };

    serde_json::from_slice(&json).map_err(|e| PersistenceError::Deserialize {
        reason: e.to_string(),
    })
}

/// Durable snapshot/recovery against a [`DurableBackend`].
#[derive(Clone)]
pub struct PersistenceAdapter {
    backend: Arc<dyn DurableBackend>,
    config: PersistenceConfig,
    compression: Option<CompressionConfig>,
}

impl PersistenceAdapter {
    pub fn new(
        backend: Arc<dyn DurableBackend>,
        config: PersistenceConfig,
        compression: Option<CompressionConfig>,
    ) -> Self {
        Self {
            backend,
            config,
            compression,
        }
    }

    pub fn key(&self, agent_id: &str) -> String {
        keys::agent(&self.config.key_prefix, agent_id)
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        call: impl std::future::Future<Output = Result<T, PersistenceError>>,
    ) -> Result<T, PersistenceError> {
        let timeout = self.config.timeout();
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(PersistenceError::Timeout {
                operation: operation.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Persist with the configured compression.
    pub async fn persist(&self, entry: &AgentEntry) -> StateResult<PersistReport> {
        self.persist_with(entry, self.compression.as_ref()).await
    }

    /// Persist with explicit compression settings.
    ///
    /// On failure the in-memory agent is untouched and its persisted
    /// version marker does not move. Persists of one agent are serialized,
    /// so an older snapshot never overwrites a newer one.
    pub async fn persist_with(
        &self,
        entry: &AgentEntry,
        compression: Option<&CompressionConfig>,
    ) -> StateResult<PersistReport> {
        let _serial = entry.lock_persist().await;
        let snapshot = PersistedAgentState::capture(entry, self.config.history_cap);
        let version = snapshot.state.version;
        let (bytes, original_bytes, compressed) = encode(&snapshot, compression)?;
        let stored_bytes = bytes.len();
        let key = self.key(entry.agent_id());

        if let Err(e) = self
            .bounded("persist", self.backend.set(&key, bytes, self.config.ttl()))
            .await
        {
            warn!(agent_id = %entry.agent_id(), version, error = %e, "Persist failed");
            return Err(e.into());
        }

        entry.mark_persisted(version);
        debug!(
            agent_id = %entry.agent_id(),
            version,
            original_bytes,
            stored_bytes,
            compressed,
            "Persisted agent state"
        );

        Ok(PersistReport {
            agent_id: entry.agent_id().to_string(),
            version,
            original_bytes,
            stored_bytes,
            compressed,
        })
    }

    /// Load and validate the last persisted snapshot of `agent_id`.
    pub async fn recover(&self, agent_id: &str) -> StateResult<PersistedAgentState> {
        let key = self.key(agent_id);
        let bytes = match self.bounded("recover", self.backend.get(&key)).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                return Err(StateError::NotFound {
                    agent_id: agent_id.to_string(),
                })
            }
            Err(e) => {
                warn!(agent_id, error = %e, "Recover failed");
                return Err(e.into());
            }
        };

        let snapshot = decode(&bytes)?;
        snapshot.validate(agent_id)?;

        info!(
            agent_id,
            version = snapshot.state.version,
            state = %snapshot.state.current_state,
            "Recovered agent state"
        );
        Ok(snapshot)
    }
}

impl std::fmt::Debug for PersistenceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceAdapter")
            .field("config", &self.config)
            .field("compression", &self.compression)
            .finish()
    }
}
