//! Activity feed for live observers of the orchestration engine.
//!
//! The bus keeps a bounded, in-memory history of recent events with
//! monotonically increasing ids and fans new events out to subscribers.
//! Nothing here is persisted; the durable record is the per-run trace file.

mod bus;
mod types;

pub use bus::ActivityBus;
pub use types::*;
