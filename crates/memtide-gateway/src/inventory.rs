//! File-backed platform backend.
//!
//! Reads a JSON inventory on every call, so an external agent can keep
//! the file current. Migrations are recorded by rewriting the file; memory
//! changes go through a [`CommandResizer`].
//!
//! ```json
//! {
//!   "hosts": [{ "id": 0, "name": "node-a", "state": "monitored",
//!               "max_memory": 16777216, "used_memory": 8388608,
//!               "free_memory": 8388608, "free_cpu": 400.0 }],
//!   "vms":   [{ "id": 12, "user_id": 3, "host_id": 0, "cpus": 1.0,
//!               "allocated_memory": 1048576, "mem_total_real": 1048576,
//!               "mem_total": 1000000, "mem_free": 180000 }]
//! }
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use memtide_core::{Host, HostId, VirtualMachine, VmId};

use crate::error::{GatewayError, GatewayResult};
use crate::platform::{GatewayFuture, Platform};
use crate::resize::CommandResizer;

/// On-disk inventory document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Inventory {
    #[serde(default)]
    pub hosts: Vec<Host>,
    #[serde(default)]
    pub vms: Vec<InventoryVm>,
}

/// A VM as recorded in the inventory, with raw guest-agent figures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InventoryVm {
    pub id: VmId,
    #[serde(default)]
    pub user_id: u64,
    pub host_id: HostId,
    #[serde(default = "default_cpus")]
    pub cpus: f64,
    pub allocated_memory: u64,
    #[serde(default)]
    pub mem_total_real: Option<u64>,
    #[serde(default)]
    pub mem_total: Option<u64>,
    #[serde(default)]
    pub mem_free: Option<u64>,
    #[serde(default)]
    pub min_free_mem: Option<u64>,
    #[serde(default)]
    pub mem_over: Option<f64>,
}

fn default_cpus() -> f64 {
    1.0
}

impl Inventory {
    /// Build the controller's view of one VM.
    pub fn virtual_machine(&self, vm: &InventoryVm, system_offset: u64) -> VirtualMachine {
        let host_name = self
            .hosts
            .iter()
            .find(|h| h.id == vm.host_id)
            .map(|h| h.name.clone())
            .unwrap_or_else(|| vm.host_id.to_string());

        let mut out = VirtualMachine::new(vm.id, vm.host_id, host_name, vm.allocated_memory);
        out.user_id = vm.user_id;
        out.cpus = vm.cpus;
        out.min_free_memory = vm.min_free_mem.filter(|v| *v > 0);
        out.overcommit_ratio = vm.mem_over.filter(|v| *v > 0.0);
        if let Some(total) = vm.mem_total.filter(|t| *t > 0) {
            out = out.with_telemetry(
                vm.mem_total_real.unwrap_or(total),
                total,
                vm.mem_free.unwrap_or(0),
                system_offset,
            );
        }
        out
    }

    /// A host with its resident VM list derived from the VM records.
    pub fn host(&self, host_id: HostId) -> Option<Host> {
        let mut host = self.hosts.iter().find(|h| h.id == host_id)?.clone();
        host.vm_ids = self
            .vms
            .iter()
            .filter(|vm| vm.host_id == host_id)
            .map(|vm| vm.id)
            .collect();
        Some(host)
    }
}

/// Platform backed by a JSON inventory file.
pub struct InventoryPlatform {
    path: PathBuf,
    resizer: CommandResizer,
    system_offset: u64,
    /// Serializes read-modify-write cycles on the file.
    write_lock: Mutex<()>,
}

impl InventoryPlatform {
    pub fn new(path: impl Into<PathBuf>, resizer: CommandResizer, system_offset: u64) -> Self {
        Self {
            path: path.into(),
            resizer,
            system_offset,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> GatewayResult<Inventory> {
        let bytes = tokio::fs::read(&self.path).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| GatewayError::Malformed(format!("{}: {e}", self.path.display())))
    }

    async fn write(&self, inventory: &Inventory) -> GatewayResult<()> {
        let bytes = serde_json::to_vec_pretty(inventory)
            .map_err(|e| GatewayError::Malformed(e.to_string()))?;
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn load_vms(&self) -> GatewayResult<Vec<VirtualMachine>> {
        let inventory = self.read().await?;
        let vms: Vec<VirtualMachine> = inventory
            .vms
            .iter()
            .map(|vm| inventory.virtual_machine(vm, self.system_offset))
            .collect();
        debug!(count = vms.len(), "inventory vms listed");
        Ok(vms)
    }

    async fn load_host(&self, host_id: HostId) -> GatewayResult<Host> {
        self.read()
            .await?
            .host(host_id)
            .ok_or_else(|| GatewayError::NotFound(format!("host {host_id}")))
    }

    async fn load_hosts(&self) -> GatewayResult<Vec<Host>> {
        let inventory = self.read().await?;
        Ok(inventory
            .hosts
            .iter()
            .filter_map(|h| inventory.host(h.id))
            .collect())
    }

    async fn migrate_in_file(&self, vm_id: VmId, host_id: HostId) -> GatewayResult<bool> {
        let _guard = self.write_lock.lock().await;
        let mut inventory = self.read().await?;

        let Some(vm_idx) = inventory.vms.iter().position(|vm| vm.id == vm_id) else {
            return Err(GatewayError::NotFound(format!("vm {vm_id}")));
        };
        if !inventory.hosts.iter().any(|h| h.id == host_id) {
            return Err(GatewayError::NotFound(format!("host {host_id}")));
        }

        let source = inventory.vms[vm_idx].host_id;
        if source == host_id {
            return Ok(false);
        }
        let memory = inventory.vms[vm_idx].allocated_memory;
        inventory.vms[vm_idx].host_id = host_id;

        for host in &mut inventory.hosts {
            if host.id == source {
                host.used_memory = host.used_memory.saturating_sub(memory);
                host.free_memory = host.free_memory.saturating_add(memory);
            } else if host.id == host_id {
                host.used_memory = host.used_memory.saturating_add(memory);
                host.free_memory = host.free_memory.saturating_sub(memory);
            }
        }

        self.write(&inventory).await?;
        info!(vm_id, from = source, to = host_id, "migration recorded in inventory");
        Ok(true)
    }
}

impl Platform for InventoryPlatform {
    fn list_vms(&self) -> GatewayFuture<'_, Vec<VirtualMachine>> {
        Box::pin(self.load_vms())
    }

    fn get_host(&self, host_id: HostId) -> GatewayFuture<'_, Host> {
        Box::pin(self.load_host(host_id))
    }

    fn list_hosts(&self) -> GatewayFuture<'_, Vec<Host>> {
        Box::pin(self.load_hosts())
    }

    fn migrate(&self, vm_id: VmId, host_id: HostId) -> GatewayFuture<'_, bool> {
        Box::pin(self.migrate_in_file(vm_id, host_id))
    }

    fn resize_running_vm<'a>(
        &'a self,
        vm_id: VmId,
        host_name: &'a str,
        new_memory: u64,
    ) -> GatewayFuture<'a, ()> {
        Box::pin(self.resizer.resize(host_name, vm_id, new_memory))
    }
}
