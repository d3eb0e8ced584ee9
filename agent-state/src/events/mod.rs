//! Tracker event stream
//!
//! - `types`: `StateEvent`, one variant per observable state change
//! - `bus`: broadcast `EventBus` with optional per-subscriber filtering
//!
//! ```ignore
//! let mut events = tracker.subscribe();
//! tracker.transition_agent_state("a1", StateTag::CollectingData, "op-1").await?;
//! assert_eq!(events.recv().await?.event_type(), "transitioned");
//! ```

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventFilter, FilteredReceiver, SharedEventBus, CHANNEL_CAPACITY};
pub use types::{LockAbortReason, StateEvent};
