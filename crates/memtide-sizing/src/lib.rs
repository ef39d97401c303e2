//! memtide-sizing — per-VM memory targets.
//!
//! Compares a VM's guest-reported free memory against the target
//! overcommit ratio and decides whether its allocation should change.
//! The engine is pure: it reads telemetry, updates the VM's
//! [`VmControlState`](memtide_state::VmControlState) in place, and returns
//! a [`SizingAction`]. Applying the action is the controller's job.
//!
//! # Sizing Algorithm
//!
//! ```text
//! free_pct = free / total * 100
//! offset   = real - total                  (captured once per VM)
//! total'   = total + offset
//!
//! if R - margin <= free_pct <= R + margin:  NoChange
//! if never adjusted:  baseline = allocated, stamp, NoChange
//! if in cooldown:     NoChange
//!
//! used = total - free
//! if free <= min_free:                     (starvation backoff)
//!     third starved cycle:  new = baseline
//!     otherwise:            new = used + (baseline - used) / 2
//! else:
//!     new = used / (1 - R/100)
//!
//! new = min(max(new, min_memory) + offset, baseline)
//! |total' - new| < threshold:  NoChange
//! new > total':  RequestMigrationThenResize(new)
//! otherwise:     Resize(new)
//! ```

pub mod engine;

pub use engine::{SizingAction, evaluate};
