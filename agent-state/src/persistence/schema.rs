//! Key layout for persisted agent snapshots
//!
//! Every snapshot lives under one key per agent; a persist overwrites the
//! previous snapshot.

/// Column family holding agent snapshots (RocksDB backend)
pub const CF_AGENTS: &str = "agents";

/// All column family names
pub const ALL_CFS: &[&str] = &[CF_AGENTS];

/// Key prefixes for compound keys
pub mod keys {
    /// Create an agent snapshot key
    pub fn agent(prefix: &str, agent_id: &str) -> String {
        format!("{}:{}", prefix, agent_id)
    }
}
