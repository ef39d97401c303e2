//! memtide-state — durable controller bookkeeping.
//!
//! Holds the per-VM cooldown/backoff state and the per-host migration
//! timestamps that must survive a controller restart.
//!
//! # Architecture
//!
//! During a run the state lives in [`ControlState`], a pair of concurrent
//! maps sharded by key so workers evaluating unrelated VMs never contend.
//! Once per scheduling cycle the controller prunes VMs that left the
//! platform and writes a [`ControlSnapshot`] to the [`StateStore`], a
//! single redb file with one table per map and JSON-serialized values.
//!
//! A missing or unreadable store is never fatal: it loads as empty state.

pub mod error;
pub mod state;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use state::ControlState;
pub use store::StateStore;
pub use types::*;
