//! Destination host ranking.

use tracing::debug;

use memtide_core::{Host, HostId, VirtualMachine};

/// Hosts ordered by free memory, roomiest first. Ties keep input order.
pub fn rank_hosts(hosts: &[Host]) -> Vec<&Host> {
    let mut ranked: Vec<&Host> = hosts.iter().collect();
    ranked.sort_by(|a, b| b.free_memory.cmp(&a.free_memory));
    ranked
}

/// First ranked host able to receive `vm`.
///
/// A destination must be active, differ from `source`, have more free
/// memory than the VM needs and more free CPU than its vCPUs require.
pub fn select_destination<'a>(
    hosts: &'a [Host],
    source: HostId,
    vm: &VirtualMachine,
) -> Option<&'a Host> {
    let memory = vm.memory_requirement();
    let cpu = vm.cpu_requirement();

    let destination = rank_hosts(hosts).into_iter().find(|host| {
        host.id != source && host.is_active() && host.free_memory > memory && host.free_cpu > cpu
    });

    match destination {
        Some(host) => debug!(vm_id = vm.id, host = %host.name, "destination selected"),
        None => debug!(vm_id = vm.id, memory, cpu, "no destination fits"),
    }
    destination
}
