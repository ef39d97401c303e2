//! Sizing engine: decides a VM's next memory target.

use tracing::debug;

use memtide_core::{ControllerConfig, VirtualMachine};
use memtide_state::{Timestamp, VmControlState};

/// What should happen to a VM's memory this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingAction {
    /// Leave the VM alone.
    NoChange,
    /// Shrink the VM to the given size (KiB). Needs no host capacity.
    Resize(u64),
    /// Grow the VM to the given size (KiB). The caller must check host
    /// headroom first and may have to evict another VM.
    RequestMigrationThenResize(u64),
}

impl SizingAction {
    /// Target memory, if the action changes anything.
    pub fn target(self) -> Option<u64> {
        match self {
            SizingAction::NoChange => None,
            SizingAction::Resize(m) | SizingAction::RequestMigrationThenResize(m) => Some(m),
        }
    }
}

/// Evaluate one VM.
///
/// `state` is updated in place: the memory offset is captured on first
/// sight, the baseline and first timestamp on the first pressure event,
/// and the starvation counter on every evaluation that gets past the
/// cooldown. The caller stamps `last_adjusted_at` once a resize has
/// actually been applied.
pub fn evaluate(
    vm: &VirtualMachine,
    state: &mut VmControlState,
    now: Timestamp,
    config: &ControllerConfig,
) -> SizingAction {
    let Some(telemetry) = vm.telemetry.filter(|t| t.total_memory > 0) else {
        return SizingAction::NoChange;
    };
    let total = telemetry.total_memory as f64;
    let free = telemetry.free_memory as f64;
    let free_pct = free / total * 100.0;

    let offset = *state
        .memory_offset
        .get_or_insert(telemetry.real_memory as i64 - telemetry.total_memory as i64);
    let offset_total = total + offset as f64;

    let ratio = vm.overcommit_ratio.unwrap_or(config.overcommit_ratio);
    let lower = ratio - config.overcommit_margin;
    let upper = ratio + config.overcommit_margin;

    debug!(
        vm_id = vm.id,
        total = telemetry.total_memory,
        free = telemetry.free_memory,
        free_pct,
        offset,
        "evaluating memory"
    );

    if (lower..=upper).contains(&free_pct) {
        return SizingAction::NoChange;
    }

    if state.last_adjusted_at.is_none() {
        state.baseline_memory = Some(vm.allocated_memory);
        state.record_adjustment(now);
        debug!(
            vm_id = vm.id,
            baseline = vm.allocated_memory,
            "first pressure event, baseline recorded"
        );
        return SizingAction::NoChange;
    }

    if state.in_cooldown(now, config.cooldown) {
        debug!(vm_id = vm.id, "in cooldown");
        return SizingAction::NoChange;
    }

    let baseline = *state.baseline_memory.get_or_insert(vm.allocated_memory) as f64;
    let used = total - free;
    let min_free = vm.min_free_memory.unwrap_or(config.min_free_memory) as f64;

    let mut target = if free <= min_free {
        if state.consecutive_starvation_count > 1 {
            state.consecutive_starvation_count = 0;
            debug!(vm_id = vm.id, "starved repeatedly, restoring baseline");
            baseline
        } else {
            state.consecutive_starvation_count += 1;
            debug!(
                vm_id = vm.id,
                count = state.consecutive_starvation_count,
                "starved, backing off toward baseline"
            );
            used + (baseline - used) * 0.5
        }
    } else {
        state.consecutive_starvation_count = 0;
        used / (1.0 - ratio / 100.0)
    };

    target = target.max(config.min_memory as f64);
    target += offset as f64;
    target = target.min(baseline);

    if (offset_total - target).abs() < config.change_threshold as f64 {
        debug!(vm_id = vm.id, target, "change below threshold");
        return SizingAction::NoChange;
    }

    let new_memory = target.max(0.0).round() as u64;
    if target > offset_total {
        debug!(vm_id = vm.id, from = offset_total, to = new_memory, "growth requested");
        SizingAction::RequestMigrationThenResize(new_memory)
    } else {
        debug!(vm_id = vm.id, from = offset_total, to = new_memory, "shrink requested");
        SizingAction::Resize(new_memory)
    }
}
