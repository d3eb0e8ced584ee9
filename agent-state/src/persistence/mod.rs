//! Durable persistence of agent snapshots
//!
//! - `backend`: the `DurableBackend` trait and the in-memory backend
//! - `rocks`: RocksDB backend (feature `rocksdb-backend`)
//! - `adapter`: envelope codec, integrity checks, bounded backend calls
//! - `schema`: key layout

pub mod adapter;
pub mod backend;
#[cfg(feature = "rocksdb-backend")]
pub mod rocks;
pub mod schema;

pub use adapter::{decode, encode, PersistReport, PersistedAgentState, PersistenceAdapter};
pub use backend::{DurableBackend, MemoryBackend};
#[cfg(feature = "rocksdb-backend")]
pub use rocks::RocksBackend;
