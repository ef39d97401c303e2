//! ControlState — the live, concurrently shared controller state.
//!
//! Workers read and write entries by key; the maps are sharded so that
//! evaluations of unrelated VMs and hosts do not serialize on one lock.

use std::collections::HashSet;

use dashmap::DashMap;
use memtide_core::{HostId, VmId};
use tracing::debug;

use crate::types::*;

/// Live per-VM and per-host control state.
#[derive(Debug, Default)]
pub struct ControlState {
    vms: DashMap<VmId, VmControlState>,
    hosts: DashMap<HostId, HostControlState>,
}

impl ControlState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild live state from a persisted snapshot.
    pub fn from_snapshot(snapshot: ControlSnapshot) -> Self {
        Self {
            vms: snapshot.vms.into_iter().collect(),
            hosts: snapshot.hosts.into_iter().collect(),
        }
    }

    /// Copy the current state out for persistence.
    pub fn snapshot(&self) -> ControlSnapshot {
        ControlSnapshot {
            vms: self
                .vms
                .iter()
                .map(|e| (*e.key(), e.value().clone()))
                .collect(),
            hosts: self
                .hosts
                .iter()
                .map(|e| (*e.key(), e.value().clone()))
                .collect(),
        }
    }

    // ── VMs ────────────────────────────────────────────────────────

    /// Copy of a VM's state, if it has ever been evaluated.
    pub fn vm(&self, vm_id: VmId) -> Option<VmControlState> {
        self.vms.get(&vm_id).map(|e| e.value().clone())
    }

    /// Replace a VM's state.
    pub fn put_vm(&self, vm_id: VmId, state: VmControlState) {
        self.vms.insert(vm_id, state);
    }

    pub fn vm_count(&self) -> usize {
        self.vms.len()
    }

    /// Drop state for VMs that are no longer in the platform snapshot.
    /// Returns how many entries were removed.
    pub fn prune(&self, current: &HashSet<VmId>) -> usize {
        let before = self.vms.len();
        self.vms.retain(|vm_id, _| {
            let keep = current.contains(vm_id);
            if !keep {
                debug!(vm_id, "removing state for departed VM");
            }
            keep
        });
        before - self.vms.len()
    }

    // ── Hosts ──────────────────────────────────────────────────────

    /// Copy of a host's migration state (default if none recorded).
    pub fn host(&self, host_id: HostId) -> HostControlState {
        self.hosts
            .get(&host_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Record that a VM was migrated away from `host_id` at `at`.
    pub fn record_migration(&self, host_id: HostId, at: Timestamp) {
        self.hosts.entry(host_id).or_default().last_migration_at = Some(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adjusted(at: Timestamp) -> VmControlState {
        VmControlState {
            last_adjusted_at: Some(at),
            baseline_memory: Some(1_048_576),
            memory_offset: Some(0),
            consecutive_starvation_count: 0,
        }
    }

    #[test]
    fn put_and_get_vm() {
        let state = ControlState::new();
        assert!(state.vm(1).is_none());

        state.put_vm(1, adjusted(1000));
        assert_eq!(state.vm(1), Some(adjusted(1000)));
        assert_eq!(state.vm_count(), 1);
    }

    #[test]
    fn prune_removes_departed_vms_only() {
        let state = ControlState::new();
        state.put_vm(1, adjusted(1000));
        state.put_vm(2, adjusted(2000));
        state.put_vm(3, adjusted(3000));

        let current: HashSet<VmId> = [1, 3].into_iter().collect();
        assert_eq!(state.prune(&current), 1);
        assert!(state.vm(2).is_none());
        assert!(state.vm(1).is_some());
        assert!(state.vm(3).is_some());
    }

    #[test]
    fn prune_keeps_host_state() {
        let state = ControlState::new();
        state.put_vm(1, adjusted(1000));
        state.record_migration(10, 5000);

        state.prune(&HashSet::new());
        assert_eq!(state.vm_count(), 0);
        assert_eq!(state.host(10).last_migration_at, Some(5000));
    }

    #[test]
    fn unknown_host_has_no_migration() {
        let state = ControlState::new();
        assert_eq!(state.host(42), HostControlState::default());
    }

    #[test]
    fn snapshot_round_trips() {
        let state = ControlState::new();
        state.put_vm(7, adjusted(1000));
        state.put_vm(8, VmControlState::default());
        state.record_migration(3, 9000);

        let snapshot = state.snapshot();
        let restored = ControlState::from_snapshot(snapshot.clone());
        assert_eq!(restored.snapshot(), snapshot);
    }
}
