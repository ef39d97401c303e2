//! Host headroom and victim selection.

use tracing::debug;

use memtide_core::{Host, VirtualMachine, VmId};

/// Whether `host` can grant `delta` KiB and still keep more than `margin` free.
pub fn host_has_headroom(host: &Host, delta: u64, margin: u64) -> bool {
    host.free_memory
        .checked_sub(delta)
        .is_some_and(|rest| rest > margin)
}

/// Pick the VM to evict from `host` so `requester` can grow.
///
/// Candidates are the host's resident VMs other than `requester`, looked
/// up in `vms`. The one with the smallest memory requirement wins; on a
/// tie the first in the host's resident order is kept.
pub fn select_victim<'a>(
    host: &Host,
    requester: VmId,
    vms: &'a [VirtualMachine],
) -> Option<&'a VirtualMachine> {
    let victim = host
        .vm_ids
        .iter()
        .filter(|id| **id != requester)
        .filter_map(|id| vms.iter().find(|vm| vm.id == *id))
        .min_by_key(|vm| vm.memory_requirement());

    if let Some(vm) = victim {
        debug!(
            host = %host.name,
            victim = vm.id,
            memory = vm.memory_requirement(),
            "victim selected"
        );
    }
    victim
}
