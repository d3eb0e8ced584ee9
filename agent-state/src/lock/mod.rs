//! Agent locking
//!
//! - `manager`: shared/exclusive lock table with leases and abort-and-release
//!   deadlock recovery
//! - `wait_graph`: wait-for graph used to detect cycles before blocking

pub mod manager;
pub mod wait_graph;

pub use manager::{LockHandle, LockInfo, LockManager, LockMode};
pub use wait_graph::WaitForGraph;
