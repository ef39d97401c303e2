//! Persisted controller state.
//!
//! Timestamps are unix epoch milliseconds.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use memtide_core::{HostId, VmId};
use serde::{Deserialize, Serialize};

/// Unix timestamp in milliseconds.
pub type Timestamp = u64;

// ── VM ────────────────────────────────────────────────────────────

/// Cooldown and backoff bookkeeping for a single VM.
///
/// Created the first time the VM is evaluated, dropped when the VM
/// disappears from the platform.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmControlState {
    /// Last successful memory change. `None` until the first pressure event.
    pub last_adjusted_at: Option<Timestamp>,
    /// Allocation captured at the first pressure event. Ceiling for growth.
    pub baseline_memory: Option<u64>,
    /// `real_memory - total_memory`, captured once and kept.
    pub memory_offset: Option<i64>,
    /// Successive starved evaluations, drives exponential backoff.
    pub consecutive_starvation_count: u32,
}

impl VmControlState {
    /// Whether a change at `now` would fall inside the cooldown window.
    pub fn in_cooldown(&self, now: Timestamp, cooldown: Duration) -> bool {
        self.last_adjusted_at
            .is_some_and(|at| elapsed(at, now) < cooldown)
    }

    /// Record a memory change applied at `now`.
    pub fn record_adjustment(&mut self, now: Timestamp) {
        self.last_adjusted_at = Some(now);
    }
}

// ── Host ──────────────────────────────────────────────────────────

/// Migration bookkeeping for a single host.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostControlState {
    /// Last migration started to evacuate a VM from this host.
    pub last_migration_at: Option<Timestamp>,
}

impl HostControlState {
    pub fn in_cooldown(&self, now: Timestamp, cooldown: Duration) -> bool {
        self.last_migration_at
            .is_some_and(|at| elapsed(at, now) < cooldown)
    }
}

// ── Snapshot ──────────────────────────────────────────────────────

/// Point-in-time copy of all controller state, as loaded from and
/// written to the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlSnapshot {
    pub vms: BTreeMap<VmId, VmControlState>,
    pub hosts: BTreeMap<HostId, HostControlState>,
}

/// Time elapsed between two timestamps; zero if `now` is earlier.
pub fn elapsed(since: Timestamp, now: Timestamp) -> Duration {
    Duration::from_millis(now.saturating_sub(since))
}

/// Current wall-clock time as a [`Timestamp`].
pub fn epoch_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Timestamp
}
